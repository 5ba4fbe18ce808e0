//! Products of fields, and mesh-derived independent fields.

use hydrograph_core::keys::mesh_of;
use hydrograph_core::{
    CompositeVector, ConfigError, EntityKind, FieldShape, Key, KeyTag, ParameterList, StateError, Tag,
};
use hydrograph_state::{EvalContext, Evaluator, EvaluatorKind};

use crate::common::{eval_failed, unsupported};

/// `coefficient * prod(dependencies)`, component by component.
#[derive(Debug)]
pub struct Multiplicative {
    name: String,
    coefficient: f64,
    provides: [KeyTag; 1],
    deps: Vec<KeyTag>,
}

impl Multiplicative {
    /// Factory constructor.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        Ok(Box::new(Self::new(plist, tag)?))
    }

    /// Construct directly. Requires `"evaluator name"` and a non-empty
    /// `"evaluator dependencies"` array; `"coefficient"` defaults to 1.
    pub fn new(plist: &ParameterList, tag: &Tag) -> Result<Self, ConfigError> {
        let name = plist.get_str("evaluator name")?.to_string();
        if !plist.is_parameter("evaluator dependencies") {
            return Err(ConfigError::MissingParameter {
                list: plist.name().to_string(),
                name: "evaluator dependencies".to_string(),
            });
        }
        let deps: Vec<KeyTag> = plist
            .get_string_array_or("evaluator dependencies", &[])?
            .into_iter()
            .map(|k| Key::from(k).at(tag))
            .collect();
        if deps.is_empty() {
            return Err(plist.invalid("evaluator dependencies", "at least one dependency is required"));
        }
        Ok(Self {
            provides: [Key::from(name.as_str()).at(tag)],
            name,
            coefficient: plist.get_f64_or("coefficient", 1.0)?,
            deps,
        })
    }

    /// Construct from keys.
    pub fn with_keys(output: KeyTag, deps: Vec<KeyTag>, coefficient: f64) -> Self {
        Self {
            name: output.key.as_str().to_string(),
            coefficient,
            provides: [output],
            deps,
        }
    }

    /// Fill `results[0]` with `coefficient * prod(deps except skip)`.
    fn product(
        &self,
        ctx: &EvalContext<'_>,
        results: &mut [CompositeVector],
        skip: Option<usize>,
    ) -> Result<(), StateError> {
        let fields = self
            .deps
            .iter()
            .map(|kt| ctx.field(kt))
            .collect::<Result<Vec<_>, _>>()?;
        for (spec, out) in results[0].components_mut() {
            out.iter_mut().for_each(|v| *v = self.coefficient);
            for (i, field) in fields.iter().enumerate() {
                if Some(i) == skip {
                    continue;
                }
                for (v, d) in out.iter_mut().zip(field.view(&spec.name)?) {
                    *v *= d;
                }
            }
        }
        Ok(())
    }
}

impl Evaluator for Multiplicative {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &self.deps
    }

    fn evaluate(&self, ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        self.product(ctx, results, None)
    }

    fn evaluate_partial_derivative(
        &self,
        ctx: &EvalContext<'_>,
        wrt: &KeyTag,
        results: &mut [CompositeVector],
    ) -> Result<(), StateError> {
        // A dependency listed twice contributes once per occurrence.
        let occurrences: Vec<usize> = self
            .deps
            .iter()
            .enumerate()
            .filter(|(_, d)| *d == wrt)
            .map(|(i, _)| i)
            .collect();
        if occurrences.is_empty() {
            return Err(unsupported(&self.name, &self.provides[0], wrt));
        }
        let mut total = results[0].zeros_like();
        for i in occurrences {
            let mut term = [results[0].zeros_like()];
            self.product(ctx, &mut term, Some(i))?;
            total.update(1.0, &term[0], 1.0)?;
        }
        results[0].assign(&total)
    }
}

// ── Cell volume ────────────────────────────────────────────────────

/// Cell volumes of the key's mesh, computed once.
#[derive(Debug)]
pub struct CellVolume {
    name: String,
    provides: [KeyTag; 1],
}

impl CellVolume {
    /// Factory constructor.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        let key = Key::from(plist.get_str("evaluator name")?);
        Ok(Box::new(Self::new(key.at(tag))))
    }

    /// Construct for `kt`.
    pub fn new(kt: KeyTag) -> Self {
        Self {
            name: kt.key.as_str().to_string(),
            provides: [kt],
        }
    }
}

impl Evaluator for CellVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EvaluatorKind {
        EvaluatorKind::Independent
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &[]
    }

    fn output_shape(&self, kt: &KeyTag) -> Option<FieldShape> {
        Some(FieldShape::cells(mesh_of(kt.key.as_str())))
    }

    fn evaluate(&self, ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        let mesh = ctx.mesh(mesh_of(self.provides[0].key.as_str()))?;
        for (spec, out) in results[0].components_mut() {
            if spec.kind != EntityKind::Cell {
                return Err(eval_failed(&self.name, format!("'{}' is not a cell component", spec.name)));
            }
            for (c, v) in out.iter_mut().enumerate() {
                *v = mesh.cell_volume(c);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_are_required() {
        let mut p = ParameterList::new("e");
        p.set("evaluator name", "energy");
        match Multiplicative::new(&p, &Tag::NEXT) {
            Err(ConfigError::MissingParameter { name, .. }) => assert_eq!(name, "evaluator dependencies"),
            other => panic!("expected MissingParameter, got {other:?}"),
        }
    }

    #[test]
    fn reads_coefficient_and_keys() {
        let p = ParameterList::from_json(
            "e",
            r#"{"evaluator name": "energy",
                "evaluator dependencies": ["cell_volume", "temperature"],
                "coefficient": 4.2e6}"#,
        )
        .unwrap();
        let ev = Multiplicative::new(&p, &Tag::NEXT).unwrap();
        assert_eq!(ev.coefficient, 4.2e6);
        assert_eq!(ev.dependencies().len(), 2);
        assert_eq!(ev.dependencies()[1], KeyTag::new("temperature", Tag::NEXT));
    }
}
