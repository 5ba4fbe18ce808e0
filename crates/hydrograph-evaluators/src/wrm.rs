//! Van Genuchten water retention and relative permeability.
//!
//! [`VanGenuchten`] is the scalar model. [`WrmEvaluator`] maps pressure to
//! liquid and gas saturation; [`RelPermEvaluator`] maps liquid saturation
//! to relative permeability. Both evaluate on every component of their
//! outputs; a `boundary_face` component reads the pressure on the matching
//! face.

use hydrograph_core::keys::{mesh_of, read_key};
use hydrograph_core::{
    CompositeVector, ConfigError, EntityKind, FieldShape, KeyTag, ParameterList, StateError, Tag,
};
use hydrograph_state::{EvalContext, Evaluator};

use crate::common::{domain_from, eval_failed, output_key, unsupported};

/// Standard atmospheric pressure [Pa].
pub const P_ATM: f64 = 101325.0;

const WRM_TOLERANCE: f64 = 1e-10;

/// Closure used to turn saturation into relative permeability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KrelFunction {
    /// `k = se^l (1 - (1 - se^(1/m))^m)^2`.
    Mualem,
    /// `k = se^2 (1 - (1 - se^(1/m))^m)`.
    Burdine,
}

/// Cubic Hermite interpolant on `[x0, x1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Hermite {
    x0: f64,
    x1: f64,
    y0: f64,
    y1: f64,
    d0: f64,
    d1: f64,
}

impl Hermite {
    fn value(&self, x: f64) -> f64 {
        let h = self.x1 - self.x0;
        let t = (x - self.x0) / h;
        let (t2, t3) = (t * t, t * t * t);
        (2.0 * t3 - 3.0 * t2 + 1.0) * self.y0
            + (t3 - 2.0 * t2 + t) * h * self.d0
            + (-2.0 * t3 + 3.0 * t2) * self.y1
            + (t3 - t2) * h * self.d1
    }

    fn derivative(&self, x: f64) -> f64 {
        let h = self.x1 - self.x0;
        let t = (x - self.x0) / h;
        let t2 = t * t;
        ((6.0 * t2 - 6.0 * t) * self.y0
            + (3.0 * t2 - 4.0 * t + 1.0) * h * self.d0
            + (-6.0 * t2 + 6.0 * t) * self.y1
            + (3.0 * t2 - 2.0 * t) * h * self.d1)
            / h
    }
}

/// Van Genuchten water retention model.
#[derive(Clone, Debug, PartialEq)]
pub struct VanGenuchten {
    alpha: f64,
    m: f64,
    n: f64,
    sr: f64,
    l: f64,
    function: KrelFunction,
    s0: f64,
    fit: Option<Hermite>,
    p_atm: f64,
}

impl VanGenuchten {
    /// Build from a parameter list.
    ///
    /// Requires `"van Genuchten alpha"` and one of `"van Genuchten m"` /
    /// `"van Genuchten n"`.
    pub fn from_plist(plist: &ParameterList) -> Result<Self, ConfigError> {
        let function = match plist.get_string_or("Krel function name", "Mualem")?.as_str() {
            "Mualem" => KrelFunction::Mualem,
            "Burdine" => KrelFunction::Burdine,
            other => {
                return Err(plist.invalid(
                    "Krel function name",
                    format!("'{other}' is not one of Mualem, Burdine"),
                ))
            }
        };
        let alpha = plist.get_f64("van Genuchten alpha")?;
        let sr = plist.get_f64_or("residual saturation", 0.0)?;
        let l = plist.get_f64_or("Mualem exponent l", 0.5)?;

        let (m, n) = if plist.is_parameter("van Genuchten m") {
            let m = plist.get_f64("van Genuchten m")?;
            let n = match function {
                KrelFunction::Mualem => 1.0 / (1.0 - m),
                KrelFunction::Burdine => 2.0 / (1.0 - m),
            };
            (m, n)
        } else {
            let n = plist.get_f64("van Genuchten n")?;
            let m = match function {
                KrelFunction::Mualem => 1.0 - 1.0 / n,
                KrelFunction::Burdine => 1.0 - 2.0 / n,
            };
            (m, n)
        };
        let smoothing = plist.get_f64_or("smoothing interval width [saturation]", 0.0)?;
        let p_atm = plist.get_f64_or("atmospheric pressure", P_ATM)?;

        if !(alpha > 0.0) {
            return Err(plist.invalid("van Genuchten alpha", "must be positive"));
        }
        if !(m > 0.0 && m < 1.0) {
            return Err(plist.invalid("van Genuchten m", format!("m = {m} must lie in (0, 1)")));
        }
        if !(0.0..1.0).contains(&sr) {
            return Err(plist.invalid("residual saturation", "must lie in [0, 1)"));
        }
        if !(0.0..1.0).contains(&smoothing) {
            return Err(plist.invalid(
                "smoothing interval width [saturation]",
                "must lie in [0, 1)",
            ));
        }

        let mut model = Self {
            alpha,
            m,
            n,
            sr,
            l,
            function,
            s0: 1.0 - smoothing,
            fit: None,
            p_atm,
        };
        if model.s0 < 1.0 {
            let s0 = model.s0;
            model.fit = Some(Hermite {
                x0: s0,
                x1: 1.0,
                y0: model.k_relative(s0),
                y1: 1.0,
                d0: model.d_k_relative(s0),
                d1: 0.0,
            });
        }
        Ok(model)
    }

    /// Reference atmospheric pressure used to form capillary pressure.
    pub fn p_atm(&self) -> f64 {
        self.p_atm
    }

    /// Capillary pressure `p_atm - p`.
    pub fn capillary_pressure_of(&self, p: f64) -> f64 {
        self.p_atm - p
    }

    fn effective(&self, s: f64) -> f64 {
        ((s - self.sr) / (1.0 - self.sr)).clamp(0.0, 1.0)
    }

    /// Relative permeability as a function of liquid saturation.
    pub fn k_relative(&self, s: f64) -> f64 {
        if s <= self.s0 {
            let se = self.effective(s);
            match self.function {
                KrelFunction::Mualem => {
                    se.powf(self.l) * (1.0 - (1.0 - se.powf(1.0 / self.m)).powf(self.m)).powi(2)
                }
                KrelFunction::Burdine => {
                    se * se * (1.0 - (1.0 - se.powf(1.0 / self.m)).powf(self.m))
                }
            }
        } else if s >= 1.0 {
            1.0
        } else {
            self.fit.map_or(1.0, |f| f.value(s))
        }
    }

    /// `d k_relative / d s`.
    pub fn d_k_relative(&self, s: f64) -> f64 {
        if s <= self.s0 {
            let se = self.effective(s);
            if se <= 0.0 {
                return 0.0;
            }
            let x = se.powf(1.0 / self.m);
            if (1.0 - x).abs() < WRM_TOLERANCE {
                return 0.0;
            }
            let y = (1.0 - x).powf(self.m);
            let dkdse = match self.function {
                KrelFunction::Mualem => {
                    (1.0 - y)
                        * (self.l * (1.0 - y) + 2.0 * x * y / (1.0 - x))
                        * se.powf(self.l - 1.0)
                }
                KrelFunction::Burdine => (2.0 * (1.0 - y) + x / (1.0 - x)) * se,
            };
            dkdse / (1.0 - self.sr)
        } else if s >= 1.0 {
            0.0
        } else {
            self.fit.map_or(0.0, |f| f.derivative(s))
        }
    }

    /// Liquid saturation as a function of capillary pressure.
    pub fn saturation(&self, pc: f64) -> f64 {
        if pc > 0.0 {
            (1.0 + (self.alpha * pc).powf(self.n)).powf(-self.m) * (1.0 - self.sr) + self.sr
        } else {
            1.0
        }
    }

    /// `d saturation / d pc`.
    pub fn d_saturation(&self, pc: f64) -> f64 {
        if pc > 0.0 {
            -self.m
                * self.n
                * (1.0 + (self.alpha * pc).powf(self.n)).powf(-self.m - 1.0)
                * (self.alpha * pc).powf(self.n - 1.0)
                * self.alpha
                * (1.0 - self.sr)
        } else {
            0.0
        }
    }

    /// Capillary pressure as a function of liquid saturation.
    pub fn capillary_pressure(&self, s: f64) -> f64 {
        let se = ((s - self.sr) / (1.0 - self.sr)).clamp(1e-40, 1.0);
        if se < 1e-8 {
            se.powf(-1.0 / (self.m * self.n)) / self.alpha
        } else {
            (se.powf(-1.0 / self.m) - 1.0).powf(1.0 / self.n) / self.alpha
        }
    }

    /// Relative permeability as a function of pressure.
    pub fn k_relative_of_pressure(&self, p: f64) -> f64 {
        self.k_relative(self.saturation(self.capillary_pressure_of(p)))
    }
}

// ── Component helpers ──────────────────────────────────────────────

/// Pressure values aligned with an output component.
fn pressure_for(
    ctx: &EvalContext<'_>,
    pres: &KeyTag,
    kind: EntityKind,
    name: &str,
) -> Result<Vec<f64>, StateError> {
    let field = ctx.field(pres)?;
    match kind {
        EntityKind::BoundaryFace => {
            let faces = field.view("face")?;
            let mesh = ctx.mesh(mesh_of(pres.key.as_str()))?;
            Ok(mesh.boundary_faces().iter().map(|&f| faces[f]).collect())
        }
        _ => Ok(field.view(name)?.to_vec()),
    }
}

// ── Water retention evaluator ──────────────────────────────────────

/// Computes `saturation_liquid` and `saturation_gas` from pressure.
#[derive(Debug)]
pub struct WrmEvaluator {
    name: String,
    model: VanGenuchten,
    provides: [KeyTag; 2],
    deps: [KeyTag; 1],
}

impl WrmEvaluator {
    /// Factory constructor.
    ///
    /// Reads `"saturation key"` (default `saturation_liquid`),
    /// `"saturation gas key"` (default `saturation_gas`), `"pressure key"`
    /// (default `pressure`), and the van Genuchten parameters, either
    /// directly or from a `"WRM parameters"` sublist.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        Ok(Box::new(Self::new(plist, tag)?))
    }

    /// Construct directly.
    pub fn new(plist: &ParameterList, tag: &Tag) -> Result<Self, ConfigError> {
        let domain = domain_from(plist)?;
        let sat = output_key(plist, &domain, "saturation", "saturation_liquid")?;
        let sat_gas = read_key(plist, &domain, "saturation gas", "saturation_gas")?;
        let pres = read_key(plist, &domain, "pressure", "pressure")?;
        let model = if plist.is_sublist("WRM parameters") {
            VanGenuchten::from_plist(&plist.sublist("WRM parameters")?)?
        } else {
            VanGenuchten::from_plist(plist)?
        };
        Ok(Self {
            name: sat.as_str().to_string(),
            model,
            provides: [sat.at(tag), sat_gas.at(tag)],
            deps: [pres.at(tag)],
        })
    }

    /// The retention model.
    pub fn model(&self) -> &VanGenuchten {
        &self.model
    }
}

impl Evaluator for WrmEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> &[KeyTag] {
        &self.provides
    }

    fn dependencies(&self) -> &[KeyTag] {
        &self.deps
    }

    fn dependency_shape(&self, dep: &KeyTag, output: &FieldShape) -> Option<FieldShape> {
        let domain = mesh_of(dep.key.as_str());
        let needs_faces = output
            .components
            .iter()
            .any(|c| matches!(c.kind, EntityKind::Face | EntityKind::BoundaryFace));
        Some(if needs_faces {
            FieldShape::cells_and_faces(domain)
        } else {
            FieldShape::cells(domain)
        })
    }

    fn evaluate(&self, ctx: &EvalContext<'_>, results: &mut [CompositeVector]) -> Result<(), StateError> {
        let [liquid, gas] = results else {
            return Err(eval_failed(&self.name, "expected two results"));
        };
        let comps: Vec<_> = liquid
            .components()
            .map(|(spec, _)| (spec.name.clone(), spec.kind))
            .collect();
        for (name, kind) in comps {
            let p = pressure_for(ctx, &self.deps[0], kind, &name)?;
            let sl = liquid.view_mut(&name)?;
            for (s, &pv) in sl.iter_mut().zip(&p) {
                *s = self.model.saturation(self.model.capillary_pressure_of(pv));
            }
            let sl = liquid.view(&name)?.to_vec();
            if let Some(sg) = gas.component_mut(&name) {
                for (g, s) in sg.iter_mut().zip(sl) {
                    *g = 1.0 - s;
                }
            }
        }
        Ok(())
    }

    fn evaluate_partial_derivative(
        &self,
        ctx: &EvalContext<'_>,
        wrt: &KeyTag,
        results: &mut [CompositeVector],
    ) -> Result<(), StateError> {
        if *wrt != self.deps[0] {
            return Err(unsupported(&self.name, &self.provides[0], wrt));
        }
        let [liquid, gas] = results else {
            return Err(eval_failed(&self.name, "expected two results"));
        };
        let comps: Vec<_> = liquid
            .components()
            .map(|(spec, _)| (spec.name.clone(), spec.kind))
            .collect();
        for (name, kind) in comps {
            let p = pressure_for(ctx, &self.deps[0], kind, &name)?;
            // pc = p_atm - p, so ds/dp = -ds/dpc.
            let dsl: Vec<f64> = p
                .iter()
                .map(|&pv| -self.model.d_saturation(self.model.capillary_pressure_of(pv)))
                .collect();
            liquid.view_mut(&name)?.copy_from_slice(&dsl);
            if let Some(sg) = gas.component_mut(&name) {
                for (g, d) in sg.iter_mut().zip(&dsl) {
                    *g = -d;
                }
            }
        }
        Ok(())
    }
}

// ── Relative permeability evaluator ────────────────────────────────

/// Computes `relative_permeability = kr(saturation_liquid) * rescaling`.
#[derive(Debug)]
pub struct RelPermEvaluator {
    name: String,
    model: VanGenuchten,
    rescaling: f64,
    provides: [KeyTag; 1],
    deps: [KeyTag; 1],
}

impl RelPermEvaluator {
    /// Factory constructor. Reads the same parameters as [`WrmEvaluator`],
    /// plus `"permeability rescaling"` (default 1).
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        Ok(Box::new(Self::new(plist, tag)?))
    }

    /// Construct directly.
    pub fn new(plist: &ParameterList, tag: &Tag) -> Result<Self, ConfigError> {
        let domain = domain_from(plist)?;
        let krel = output_key(plist, &domain, "relative permeability", "relative_permeability")?;
        let sat = read_key(plist, &domain, "saturation", "saturation_liquid")?;
        let model = if plist.is_sublist("WRM parameters") {
            VanGenuchten::from_plist(&plist.sublist("WRM parameters")?)?
        } else {
            VanGenuchten::from_plist(plist)?
        };
        Ok(Self {
            name: krel.as_str().to_string(),
            model,
            rescaling: plist.get_f64_or("permeability rescaling", 1.0)?,
            provides: [krel.at(tag)],
            deps: [sat.at(tag)],
        })
    }
}

impl Evaluator for RelPermEvaluator {
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
        let sat = ctx.field(&self.deps[0])?;
        for (spec, out) in results[0].components_mut() {
            let s = sat.view(&spec.name)?;
            for (k, &sv) in out.iter_mut().zip(s) {
                *k = self.model.k_relative(sv) * self.rescaling;
            }
        }
        Ok(())
    }

    fn evaluate_partial_derivative(
        &self,
        ctx: &EvalContext<'_>,
        wrt: &KeyTag,
        results: &mut [CompositeVector],
    ) -> Result<(), StateError> {
        if *wrt != self.deps[0] {
            return Err(unsupported(&self.name, &self.provides[0], wrt));
        }
        let sat = ctx.field(&self.deps[0])?;
        for (spec, out) in results[0].components_mut() {
            let s = sat.view(&spec.name)?;
            for (k, &sv) in out.iter_mut().zip(s) {
                *k = self.model.d_k_relative(sv) * self.rescaling;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(extra: &[(&str, f64)]) -> VanGenuchten {
        let mut p = ParameterList::new("wrm");
        p.set("van Genuchten alpha", 1.5e-4);
        p.set("van Genuchten m", 0.8);
        p.set("residual saturation", 0.1);
        for (k, v) in extra {
            p.set(*k, *v);
        }
        VanGenuchten::from_plist(&p).unwrap()
    }

    #[test]
    fn saturated_at_nonpositive_capillary_pressure() {
        let m = model(&[]);
        assert_eq!(m.saturation(0.0), 1.0);
        assert_eq!(m.saturation(-10.0), 1.0);
        assert_eq!(m.d_saturation(0.0), 0.0);
    }

    #[test]
    fn full_saturation_gives_unit_krel() {
        let m = model(&[]);
        assert!((m.k_relative(1.0) - 1.0).abs() < 1e-12);
        let smooth = model(&[("smoothing interval width [saturation]", 0.05)]);
        assert_eq!(smooth.k_relative(1.0), 1.0);
    }

    #[test]
    fn smoothing_is_continuous_at_junction() {
        let m = model(&[("smoothing interval width [saturation]", 0.05)]);
        let s0 = 0.95;
        let below = m.k_relative(s0 - 1e-9);
        let above = m.k_relative(s0 + 1e-9);
        assert!((below - above).abs() < 1e-6);
    }

    #[test]
    fn d_saturation_matches_finite_difference() {
        let m = model(&[]);
        for pc in [1.0e3, 1.0e4, 5.0e4] {
            let h = 1e-5 * pc;
            let fd = (m.saturation(pc + h) - m.saturation(pc - h)) / (2.0 * h);
            let exact = m.d_saturation(pc);
            assert!(
                (fd - exact).abs() < 1e-5 * exact.abs().max(1e-12),
                "pc={pc}: fd={fd}, exact={exact}"
            );
        }
    }

    #[test]
    fn capillary_pressure_inverts_saturation() {
        let m = model(&[]);
        let pc = 2.0e4;
        let s = m.saturation(pc);
        assert!((m.capillary_pressure(s) - pc).abs() / pc < 1e-8);
    }

    #[test]
    fn burdine_maps_m_to_n() {
        let mut p = ParameterList::new("wrm");
        p.set("van Genuchten alpha", 1e-4);
        p.set("van Genuchten n", 3.0);
        p.set("Krel function name", "Burdine");
        let m = VanGenuchten::from_plist(&p).unwrap();
        assert!((m.m - (1.0 - 2.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn requires_m_or_n() {
        let mut p = ParameterList::new("wrm");
        p.set("van Genuchten alpha", 1e-4);
        match VanGenuchten::from_plist(&p) {
            Err(ConfigError::MissingParameter { name, .. }) => assert_eq!(name, "van Genuchten n"),
            other => panic!("expected MissingParameter, got {other:?}"),
        }
    }

    #[test]
    fn unknown_krel_function_rejected() {
        let mut p = ParameterList::new("wrm");
        p.set("van Genuchten alpha", 1e-4);
        p.set("van Genuchten m", 0.5);
        p.set("Krel function name", "Brooks");
        assert!(matches!(
            VanGenuchten::from_plist(&p),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn saturation_stays_in_unit_interval(pc in -1.0e5f64..1.0e7) {
                let m = model(&[]);
                let s = m.saturation(pc);
                prop_assert!((0.1..=1.0).contains(&s));
            }

            #[test]
            fn krel_is_monotone(a in 0.1f64..1.0, b in 0.1f64..1.0) {
                let m = model(&[]);
                let (lo, hi) = if a < b { (a, b) } else { (b, a) };
                prop_assert!(m.k_relative(lo) <= m.k_relative(hi) + 1e-12);
            }
        }
    }
}
