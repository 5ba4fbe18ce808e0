//! Richards water content, the conserved quantity of variably saturated flow.
//!
//! `WC = phi * V * (s_l * n_l + s_g * n_g * omega_g)` on cells. The gas
//! term is included only with `"include water vapor"`.

use hydrograph_core::{CompositeVector, ConfigError, FieldShape, KeyTag, ParameterList, StateError, Tag};
use hydrograph_core::keys::{mesh_of, read_key};
use hydrograph_state::{EvalContext, Evaluator};

use crate::common::{domain_from, output_key, unsupported};

const POROSITY: usize = 0;
const SAT_LIQUID: usize = 1;
const DENS_LIQUID: usize = 2;
const VOLUME: usize = 3;
const SAT_GAS: usize = 4;
const DENS_GAS: usize = 5;
const MOL_FRAC_GAS: usize = 6;

/// Evaluates the Richards water content [mol].
#[derive(Debug)]
pub struct RichardsWaterContent {
    name: String,
    provides: [KeyTag; 1],
    // Ordered as the index constants above; the gas entries are present
    // only when vapor is included.
    deps: Vec<KeyTag>,
}

impl RichardsWaterContent {
    /// Factory constructor.
    pub fn from_plist(plist: &ParameterList, tag: &Tag) -> Result<Box<dyn Evaluator>, ConfigError> {
        Ok(Box::new(Self::new(plist, tag)?))
    }

    /// Construct directly.
    pub fn new(plist: &ParameterList, tag: &Tag) -> Result<Self, ConfigError> {
        let domain = domain_from(plist)?;
        let wc = output_key(plist, &domain, "water content", "water_content")?;
        let mut deps = vec![
            read_key(plist, &domain, "porosity", "porosity")?.at(tag),
            read_key(plist, &domain, "saturation liquid", "saturation_liquid")?.at(tag),
            read_key(plist, &domain, "molar density liquid", "molar_density_liquid")?.at(tag),
            read_key(plist, &domain, "cell volume", "cell_volume")?.at(tag),
        ];
        if plist.get_bool_or("include water vapor", false)? {
            deps.push(read_key(plist, &domain, "saturation gas", "saturation_gas")?.at(tag));
            deps.push(read_key(plist, &domain, "molar density gas", "molar_density_gas")?.at(tag));
            deps.push(read_key(plist, &domain, "molar fraction gas", "mol_frac_gas")?.at(tag));
        }
        Ok(Self {
            name: wc.as_str().to_string(),
            provides: [wc.at(tag)],
            deps,
        })
    }

    fn includes_vapor(&self) -> bool {
        self.deps.len() > VOLUME + 1
    }

    /// Cell views of every dependency, in index order.
    fn cell_views<'a>(&self, ctx: &EvalContext<'a>) -> Result<Vec<&'a [f64]>, StateError> {
        self.deps.iter().map(|kt| ctx.view(kt, "cell")).collect()
    }
}

impl Evaluator for RichardsWaterContent {
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
        let v = self.cell_views(ctx)?;
        let vapor = self.includes_vapor();
        let out = results[0].view_mut("cell")?;
        for (c, wc) in out.iter_mut().enumerate() {
            let mut content = v[SAT_LIQUID][c] * v[DENS_LIQUID][c];
            if vapor {
                content += v[SAT_GAS][c] * v[DENS_GAS][c] * v[MOL_FRAC_GAS][c];
            }
            *wc = v[POROSITY][c] * v[VOLUME][c] * content;
        }
        Ok(())
    }

    fn evaluate_partial_derivative(
        &self,
        ctx: &EvalContext<'_>,
        wrt: &KeyTag,
        results: &mut [CompositeVector],
    ) -> Result<(), StateError> {
        let which = self
            .deps
            .iter()
            .position(|d| d == wrt)
            .ok_or_else(|| unsupported(&self.name, &self.provides[0], wrt))?;
        let v = self.cell_views(ctx)?;
        let vapor = self.includes_vapor();
        let out = results[0].view_mut("cell")?;
        for (c, d) in out.iter_mut().enumerate() {
            let liquid = v[SAT_LIQUID][c] * v[DENS_LIQUID][c];
            let gas = if vapor {
                v[SAT_GAS][c] * v[DENS_GAS][c] * v[MOL_FRAC_GAS][c]
            } else {
                0.0
            };
            let phi_v = v[POROSITY][c] * v[VOLUME][c];
            *d = match which {
                POROSITY => v[VOLUME][c] * (liquid + gas),
                VOLUME => v[POROSITY][c] * (liquid + gas),
                SAT_LIQUID => phi_v * v[DENS_LIQUID][c],
                DENS_LIQUID => phi_v * v[SAT_LIQUID][c],
                SAT_GAS => phi_v * v[DENS_GAS][c] * v[MOL_FRAC_GAS][c],
                DENS_GAS => phi_v * v[SAT_GAS][c] * v[MOL_FRAC_GAS][c],
                MOL_FRAC_GAS => phi_v * v[SAT_GAS][c] * v[DENS_GAS][c],
                _ => 0.0,
            };
        }
        Ok(())
    }
}
