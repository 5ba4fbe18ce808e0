//! Equations of state: molar and mass density from temperature and pressure.

use std::fmt;

use hydrograph_core::keys::{get_domain, read_key};
use hydrograph_core::{CompositeVector, ConfigError, Key, KeyTag, ParameterList, StateError, Tag};
use hydrograph_state::{EvalContext, Evaluator};
use tracing::debug;

use crate::common::{eval_failed, unsupported};

/// Universal gas constant [J/(mol K)].
pub const R_GAS: f64 = 8.31446261815324;

/// A density model `n(T, p)` in mol/m^3.
///
/// # Object safety
///
/// Stored as `Box<dyn EquationOfState>` inside [`EosEvaluator`].
pub trait EquationOfState: Send + Sync + fmt::Debug {
    /// Molar density.
    fn molar_density(&self, t: f64, p: f64) -> f64;
    /// `d n / d T`.
    fn d_molar_density_dt(&self, t: f64, p: f64) -> f64;
    /// `d n / d p`.
    fn d_molar_density_dp(&self, t: f64, p: f64) -> f64;
    /// Molar mass [kg/mol].
    fn molar_mass(&self) -> f64;
}

/// Density independent of temperature and pressure.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstantEos {
    /// Mass density [kg/m^3].
    pub density: f64,
    /// Molar mass [kg/mol].
    pub molar_mass: f64,
}

impl EquationOfState for ConstantEos {
    fn molar_density(&self, _t: f64, _p: f64) -> f64 {
        self.density / self.molar_mass
    }
    fn d_molar_density_dt(&self, _t: f64, _p: f64) -> f64 {
        0.0
    }
    fn d_molar_density_dp(&self, _t: f64, _p: f64) -> f64 {
        0.0
    }
    fn molar_mass(&self) -> f64 {
        self.molar_mass
    }
}

/// `n = p / (R T)`.
#[derive(Clone, Debug, PartialEq)]
pub struct IdealGasEos {
    /// Molar mass [kg/mol].
    pub molar_mass: f64,
}

impl EquationOfState for IdealGasEos {
    fn molar_density(&self, t: f64, p: f64) -> f64 {
        p / (R_GAS * t)
    }
    fn d_molar_density_dt(&self, t: f64, p: f64) -> f64 {
        -p / (R_GAS * t * t)
    }
    fn d_molar_density_dp(&self, t: f64, _p: f64) -> f64 {
        1.0 / (R_GAS * t)
    }
    fn molar_mass(&self) -> f64 {
        self.molar_mass
    }
}

/// Build an equation of state from an `"EOS parameters"` list.
pub fn create_eos(plist: &ParameterList) -> Result<Box<dyn EquationOfState>, ConfigError> {
    let molar_mass = plist.get_f64_or("molar mass [kg/mol]", 0.0180153)?;
    if !(molar_mass > 0.0) {
        return Err(plist.invalid("molar mass [kg/mol]", "must be positive"));
    }
    match plist.get_str("EOS type")? {
        "constant" => {
            let density = plist.get_f64_or("density [kg/m^3]", 1000.0)?;
            Ok(Box::new(ConstantEos {
                density,
                molar_mass,
            }))
        }
        "ideal gas" => Ok(Box::new(IdealGasEos { molar_mass })),
        other => Err(ConfigError::UnknownType {
            type_name: format!("EOS type '{other}'"),
        }),
    }
}

/// Which densities an [`EosEvaluator`] provides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EosBasis {
    /// Molar density only.
    Molar,
    /// Mass density only.
    Mass,
    /// Molar then mass density.
    Both,
}

/// Replace the first occurrence of `from` in `name` with `to`.
fn substitute(name: &str, from: &str, to: &str) -> Option<String> {
    name.find(from)
        .map(|pos| format!("{}{}{}", &name[..pos], to, &name[pos + from.len()..]))
}

/// Resolve one density key. Uses `option` if set, otherwise `name` when it
/// already names this basis, otherwise `name` with `other` swapped for
/// `this`.
fn density_key(
    plist: &ParameterList,
    name: &str,
    option: &str,
    this: &str,
    other: &str,
) -> Result<Key, ConfigError> {
    let inferred = if name.contains(this) {
        Some(name.to_string())
    } else {
        substitute(name, other, this)
    };
    match inferred {
        Some(default) => plist.get_string_or(option, &default).map(Key::from),
        None => plist.get_str(option).map(Key::from),
    }
}

/// Evaluates molar and/or mass density from temperature and pressure.
#[derive(Debug)]
pub struct EosEvaluator {
    name: String,
    basis: EosBasis,
    eos: Box<dyn EquationOfState>,
    provides: Vec<KeyTag>,
    deps: [KeyTag; 2],
}

impl EosEvaluator {
    /// Factory constructor.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        Ok(Box::new(Self::new(plist, tag)?))
    }

    /// Construct directly.
    ///
    /// `"EOS basis"` is `molar` (default), `mass`, or `both`. Output keys
    /// come from `"molar density key"` / `"mass density key"` or are
    /// inferred from `"evaluator name"`.
    pub fn new(plist: &ParameterList, tag: &Tag) -> Result<Self, ConfigError> {
        let basis = match plist.get_string_or("EOS basis", "molar")?.as_str() {
            "molar" => EosBasis::Molar,
            "mass" => EosBasis::Mass,
            "both" => EosBasis::Both,
            other => {
                return Err(plist.invalid("EOS basis", format!("'{other}' is not molar, mass, or both")))
            }
        };
        let name = plist.get_string_or("evaluator name", "")?;

        let mut provides = Vec::with_capacity(2);
        if matches!(basis, EosBasis::Molar | EosBasis::Both) {
            provides.push(density_key(plist, &name, "molar density key", "molar", "mass")?.at(tag));
        }
        if matches!(basis, EosBasis::Mass | EosBasis::Both) {
            provides.push(density_key(plist, &name, "mass density key", "mass", "molar")?.at(tag));
        }

        let domain = get_domain(provides[0].key.as_str()).to_string();
        let temp = read_key(plist, &domain, "temperature", "temperature")?;
        let pres = read_key(plist, &domain, "pressure", "effective_pressure")?;

        if !plist.is_sublist("EOS parameters") {
            return Err(ConfigError::MissingParameter {
                list: plist.name().to_string(),
                name: "EOS parameters".to_string(),
            });
        }
        let eos = create_eos(&plist.sublist("EOS parameters")?)?;
        debug!(field = %provides[0], ?basis, molar_mass = eos.molar_mass(), "equation of state configured");

        Ok(Self {
            name: provides[0].key.as_str().to_string(),
            basis,
            eos,
            provides,
            deps: [temp.at(tag), pres.at(tag)],
        })
    }

    /// Which densities are provided.
    pub fn basis(&self) -> EosBasis {
        self.basis
    }

    /// Output slots as (molar, mass) indices into `results`.
    fn slots(&self) -> (Option<usize>, Option<usize>) {
        match self.basis {
            EosBasis::Molar => (Some(0), None),
            EosBasis::Mass => (None, Some(0)),
            EosBasis::Both => (Some(0), Some(1)),
        }
    }

    fn fill(
        &self,
        ctx: &EvalContext<'_>,
        results: &mut [CompositeVector],
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), StateError> {
        let temp = ctx.field(&self.deps[0])?;
        let pres = ctx.field(&self.deps[1])?;
        let (molar, mass) = self.slots();
        let m = self.eos.molar_mass();
        for (slot, scale) in [(molar, 1.0), (mass, m)] {
            let Some(i) = slot else { continue };
            let out = results
                .get_mut(i)
                .ok_or_else(|| eval_failed(&self.name, "missing result slot"))?;
            for (spec, vals) in out.components_mut() {
                let t = temp.view(&spec.name)?;
                let p = pres.view(&spec.name)?;
                for ((v, &tv), &pv) in vals.iter_mut().zip(t).zip(p) {
                    *v = scale * f(tv, pv);
                }
            }
        }
        Ok(())
    }
}

impl Evaluator for EosEvaluator {
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
        self.fill(ctx, results, |t, p| self.eos.molar_density(t, p))?;
        for r in results.iter() {
            if let Some(bad) = r.values().find(|v| !(*v > 0.0)) {
                return Err(eval_failed(&self.name, format!("non-positive density {bad}")));
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
        if *wrt == self.deps[0] {
            self.fill(ctx, results, |t, p| self.eos.d_molar_density_dt(t, p))
        } else if *wrt == self.deps[1] {
            self.fill(ctx, results, |t, p| self.eos.d_molar_density_dp(t, p))
        } else {
            Err(unsupported(&self.name, &self.provides[0], wrt))
        }
    }
}
