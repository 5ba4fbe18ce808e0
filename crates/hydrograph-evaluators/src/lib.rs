//! Constitutive-relation evaluators for Hydrograph.
//!
//! Each evaluator is a pure function of local state: it reads its declared
//! dependencies through an [`EvalContext`](hydrograph_state::EvalContext)
//! and overwrites its outputs. [`default_factory`] registers every type
//! under its configuration name.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

mod common;
pub mod energy_source;
pub mod eos;
pub mod product;
pub mod surface_relperm;
pub mod top_cells;
pub mod water_content;
pub mod wrm;

pub use energy_source::AdvectedEnergySource;
pub use eos::{ConstantEos, EosBasis, EosEvaluator, EquationOfState, IdealGasEos};
pub use product::{CellVolume, Multiplicative};
pub use surface_relperm::{UnfrozenFractionModel, UnfrozenFractionRelPerm};
pub use top_cells::TopCellsSurface;
pub use water_content::RichardsWaterContent;
pub use wrm::{KrelFunction, RelPermEvaluator, VanGenuchten, WrmEvaluator, P_ATM};

use hydrograph_state::EvaluatorFactory;

/// An [`EvaluatorFactory`] with the built-in types and every evaluator in
/// this crate registered.
pub fn default_factory() -> EvaluatorFactory {
    let mut f = EvaluatorFactory::new();
    f.register("eos", EosEvaluator::from_plist)
        .register("WRM", WrmEvaluator::from_plist)
        .register("relative permeability", RelPermEvaluator::from_plist)
        .register("richards water content", RichardsWaterContent::from_plist)
        .register("top cell surface", TopCellsSurface::from_plist)
        .register("advected energy source", AdvectedEnergySource::from_plist)
        .register("unfrozen fraction relperm", UnfrozenFractionRelPerm::from_plist)
        .register("multiplicative", Multiplicative::from_plist)
        .register("cell volume", CellVolume::from_plist);
    f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_factory_knows_every_type() {
        let f = default_factory();
        for name in [
            "primary variable",
            "constant",
            "eos",
            "WRM",
            "relative permeability",
            "richards water content",
            "top cell surface",
            "advected energy source",
            "unfrozen fraction relperm",
            "multiplicative",
            "cell volume",
        ] {
            assert!(f.contains(name), "missing {name}");
        }
    }
}
