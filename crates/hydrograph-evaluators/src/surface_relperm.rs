//! Surface relative permeability limited by unfrozen fraction and ponded
//! depth.

use std::f64::consts::FRAC_PI_2;

use hydrograph_core::keys::{mesh_of, read_key};
use hydrograph_core::{CompositeVector, ConfigError, EntityKind, FieldShape, KeyTag, ParameterList, StateError, Tag};
use hydrograph_state::{EvalContext, Evaluator};

use crate::common::{domain_from, eval_failed, output_key, unsupported};

/// `kr = sin(pi uf / 2)^alpha`, cut off smoothly as ponded depth drops
/// below `h_c` and zero once the surface is dry.
#[derive(Clone, Debug, PartialEq)]
pub struct UnfrozenFractionModel {
    alpha: i32,
    cutoff: f64,
}

impl UnfrozenFractionModel {
    /// Read `"unfrozen rel perm alpha"` (even integer, default 4) and
    /// `"unfrozen rel perm cutoff height"` (default 0.01).
    pub fn from_plist(plist: &ParameterList) -> Result<Self, ConfigError> {
        let alpha = plist.get_i64_or("unfrozen rel perm alpha", 4)?;
        if alpha % 2 != 0 {
            return Err(plist.invalid(
                "unfrozen rel perm alpha",
                format!("{alpha} is odd; an even integer is required"),
            ));
        }
        let alpha = i32::try_from(alpha)
            .map_err(|_| plist.invalid("unfrozen rel perm alpha", "out of range"))?;
        let cutoff = plist.get_f64_or("unfrozen rel perm cutoff height", 0.01)?;
        if !(cutoff > 0.0) {
            return Err(plist.invalid("unfrozen rel perm cutoff height", "must be positive"));
        }
        Ok(Self { alpha, cutoff })
    }

    fn depth_factor(&self, h: f64) -> f64 {
        if h <= 0.0 {
            0.0
        } else if h < self.cutoff {
            (FRAC_PI_2 * h / self.cutoff).sin().powi(2)
        } else {
            1.0
        }
    }

    /// Relative permeability.
    pub fn k_relative(&self, uf: f64, h: f64) -> f64 {
        let f = self.depth_factor(h);
        if f == 0.0 {
            return 0.0;
        }
        (FRAC_PI_2 * uf).sin().powi(self.alpha) * f
    }

    /// `d kr / d uf`.
    pub fn d_k_relative_d_uf(&self, uf: f64, h: f64) -> f64 {
        let x = FRAC_PI_2 * uf;
        f64::from(self.alpha) * x.sin().powi(self.alpha - 1) * x.cos() * FRAC_PI_2 * self.depth_factor(h)
    }

    /// `d kr / d h`.
    pub fn d_k_relative_d_h(&self, uf: f64, h: f64) -> f64 {
        if h <= 0.0 || h >= self.cutoff {
            return 0.0;
        }
        let y = FRAC_PI_2 * h / self.cutoff;
        (FRAC_PI_2 * uf).sin().powi(self.alpha) * 2.0 * y.sin() * y.cos() * FRAC_PI_2 / self.cutoff
    }
}

/// Evaluator wrapping [`UnfrozenFractionModel`].
#[derive(Debug)]
pub struct UnfrozenFractionRelPerm {
    name: String,
    model: UnfrozenFractionModel,
    provides: [KeyTag; 1],
    // [unfrozen fraction, ponded depth]
    deps: [KeyTag; 2],
}

impl UnfrozenFractionRelPerm {
    /// Factory constructor.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        Ok(Box::new(Self::new(plist, tag)?))
    }

    /// Construct directly.
    pub fn new(plist: &ParameterList, tag: &Tag) -> Result<Self, ConfigError> {
        let domain = domain_from(plist)?;
        let kr = output_key(plist, &domain, "relative permeability", "relative_permeability")?;
        let uf = read_key(plist, &domain, "unfrozen fraction", "unfrozen_fraction")?;
        let h = read_key(plist, &domain, "height", "ponded_depth")?;
        Ok(Self {
            name: kr.as_str().to_string(),
            model: UnfrozenFractionModel::from_plist(plist)?,
            provides: [kr.at(tag)],
            deps: [uf.at(tag), h.at(tag)],
        })
    }

    fn fill(
        &self,
        ctx: &EvalContext<'_>,
        results: &mut [CompositeVector],
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), StateError> {
        let uf = ctx.view(&self.deps[0], "cell")?;
        let h = ctx.view(&self.deps[1], "cell")?;
        let mesh = ctx.mesh(mesh_of(self.provides[0].key.as_str()))?;
        for (spec, out) in results[0].components_mut() {
            match spec.kind {
                EntityKind::Cell => {
                    for (c, v) in out.iter_mut().enumerate() {
                        *v = f(uf[c], h[c]);
                    }
                }
                EntityKind::BoundaryFace => {
                    for (v, &face) in out.iter_mut().zip(mesh.boundary_faces()) {
                        let c = mesh.face_cells(face)[0];
                        *v = f(uf[c], h[c]);
                    }
                }
                other => {
                    return Err(eval_failed(
                        &self.name,
                        format!("component '{}' of kind {other:?} is not supported", spec.name),
                    ))
                }
            }
        }
        Ok(())
    }
}

impl Evaluator for UnfrozenFractionRelPerm {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &self.deps
    }

    fn dependency_shape(&self, dep: &KeyTag, _output: &FieldShape) -> Option<FieldShape> {
        Some(FieldShape::cells(mesh_of(dep.key.as_str())))
    }

    fn evaluate(&self, ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        self.fill(ctx, results, |uf, h| self.model.k_relative(uf, h))
    }

    fn evaluate_partial_derivative(
        &self,
        ctx: &EvalContext<'_>,
        wrt: &KeyTag,
        results: &mut [CompositeVector],
    ) -> Result<(), StateError> {
        if *wrt == self.deps[0] {
            self.fill(ctx, results, |uf, h| self.model.d_k_relative_d_uf(uf, h))
        } else if *wrt == self.deps[1] {
            self.fill(ctx, results, |uf, h| self.model.d_k_relative_d_h(uf, h))
        } else {
            Err(unsupported(&self.name, &self.provides[0], wrt))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> UnfrozenFractionModel {
        UnfrozenFractionModel::from_plist(&ParameterList::new("kr")).unwrap()
    }

    #[test]
    fn odd_alpha_rejected() {
        let mut p = ParameterList::new("kr");
        p.set("unfrozen rel perm alpha", 3);
        match UnfrozenFractionModel::from_plist(&p) {
            Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, "unfrozen rel perm alpha"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn dry_surface_has_zero_permeability() {
        let m = model();
        assert_eq!(m.k_relative(1.0, 0.0), 0.0);
        assert_eq!(m.k_relative(0.7, -0.5), 0.0);
    }

    #[test]
    fn thawed_and_ponded_is_one() {
        let m = model();
        assert!((m.k_relative(1.0, 0.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn derivatives_match_finite_difference() {
        let m = model();
        let (uf, h, eps) = (0.6, 0.004, 1e-7);
        let fd_uf = (m.k_relative(uf + eps, h) - m.k_relative(uf - eps, h)) / (2.0 * eps);
        assert!((fd_uf - m.d_k_relative_d_uf(uf, h)).abs() < 1e-6);
        let fd_h = (m.k_relative(uf, h + eps) - m.k_relative(uf, h - eps)) / (2.0 * eps);
        assert!((fd_h - m.d_k_relative_d_h(uf, h)).abs() < 1e-4);
    }
}
