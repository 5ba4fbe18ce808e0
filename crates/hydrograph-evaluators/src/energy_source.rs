//! Energy carried in or out by a mass source, optionally plus conduction.

use hydrograph_core::keys::{mesh_of, read_key};
use hydrograph_core::{CompositeVector, ConfigError, FieldShape, KeyTag, ParameterList, StateError, Tag};
use hydrograph_state::{EvalContext, Evaluator};

use crate::common::{domain_from, output_key};

const INT_ENTHALPY: usize = 0;
const EXT_ENTHALPY: usize = 1;
const MASS_SOURCE: usize = 2;
const INT_DENSITY: usize = 3;
const EXT_DENSITY: usize = 4;
const CELL_VOLUME: usize = 5;
const CONDUCTED: usize = 6;

/// `V * Q * n * h`, upwinded on the sign of the mass source `Q`: a
/// positive source brings in water at the external density and enthalpy,
/// a negative one removes it at the internal values. With conduction,
/// `V * conducted` is added.
///
/// Derivatives are not provided; kernels treat them as zero.
#[derive(Debug)]
pub struct AdvectedEnergySource {
    name: String,
    provides: [KeyTag; 1],
    deps: Vec<KeyTag>,
}

impl AdvectedEnergySource {
    /// Factory constructor.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        Ok(Box::new(Self::new(plist, tag)?))
    }

    /// Construct directly. `"include conduction"` is required.
    pub fn new(plist: &ParameterList, tag: &Tag) -> Result<Self, ConfigError> {
        let domain = domain_from(plist)?;
        let include_conduction = plist.get_bool("include conduction")?;

        let default_out = if include_conduction {
            "total_energy_source"
        } else {
            "advected_energy_source"
        };
        let out = output_key(plist, &domain, "energy source", default_out)?;

        let mut deps = vec![
            read_key(plist, &domain, "internal enthalpy", "enthalpy")?.at(tag),
            read_key(plist, &domain, "external enthalpy", "mass_source_enthalpy")?.at(tag),
            read_key(plist, &domain, "mass source", "mass_source")?.at(tag),
            read_key(plist, &domain, "internal density", "molar_density_liquid")?.at(tag),
            read_key(plist, &domain, "external density", "source_molar_density")?.at(tag),
            read_key(plist, &domain, "cell volume", "cell_volume")?.at(tag),
        ];
        if include_conduction {
            let cond = read_key(plist, &domain, "conducted energy source", "conducted_energy_source")?;
            deps.push(cond.at(tag));
        }
        Ok(Self {
            name: out.as_str().to_string(),
            provides: [out.at(tag)],
            deps,
        })
    }

    /// Whether the conducted source is added.
    pub fn includes_conduction(&self) -> bool {
        self.deps.len() > CONDUCTED
    }
}

impl Evaluator for AdvectedEnergySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &self.deps
    }

    fn output_shape(&self, kt: &KeyTag) -> Option<FieldShape> {
        Some(FieldShape::cells(mesh_of(kt.key.as_str())))
    }

    fn evaluate(&self, ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        let v: Vec<&[f64]> = self
            .deps
            .iter()
            .map(|kt| ctx.view(kt, "cell"))
            .collect::<Result<_, _>>()?;
        let conduction = self.includes_conduction();
        let res = results[0].view_mut("cell")?;
        for (c, r) in res.iter_mut().enumerate() {
            let q = v[MASS_SOURCE][c];
            let (n, h) = if q > 0.0 {
                (v[EXT_DENSITY][c], v[EXT_ENTHALPY][c])
            } else {
                (v[INT_DENSITY][c], v[INT_ENTHALPY][c])
            };
            *r = v[CELL_VOLUME][c] * q * n * h;
            if conduction {
                *r += v[CELL_VOLUME][c] * v[CONDUCTED][c];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_depends_on_conduction() {
        let mut p = ParameterList::new("src");
        p.set("domain name", "surface");
        p.set("include conduction", true);
        let ev = AdvectedEnergySource::new(&p, &Tag::NEXT).unwrap();
        assert_eq!(ev.provides()[0].key, "surface-total_energy_source");
        assert!(ev.includes_conduction());

        p.set("include conduction", false);
        let ev = AdvectedEnergySource::new(&p, &Tag::NEXT).unwrap();
        assert_eq!(ev.provides()[0].key, "surface-advected_energy_source");
        assert_eq!(ev.dependencies().len(), 6);
    }

    #[test]
    fn include_conduction_is_required() {
        let p = ParameterList::new("src");
        assert!(matches!(
            AdvectedEnergySource::new(&p, &Tag::NEXT),
            Err(ConfigError::MissingParameter { .. })
        ));
    }
}
