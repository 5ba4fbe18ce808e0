//! Evaluators built by the default factory and resolved by the store.

use std::sync::Arc;

use hydrograph_core::{FieldShape, Key, KeyTag, ParameterList, Tag};
use hydrograph_evaluators::{default_factory, P_ATM};
use hydrograph_mesh::{ColumnMesh, SurfaceMesh};
use hydrograph_state::StateStore;

const R_GAS: f64 = 8.31446261815324;

fn at(key: &str) -> KeyTag {
    Key::from(key).at(&Tag::NEXT)
}

fn column_and_surface(ncells: usize, list: &str) -> StateStore {
    let column = ColumnMesh::uniform("domain", 0.0, 1.0, ncells).unwrap();
    let surface = SurfaceMesh::from_faces("surface", &column, vec![column.top_face()]).unwrap();
    let list = ParameterList::from_json("field evaluators", list).unwrap();
    let mut store = StateStore::new().with_factory(default_factory()).with_evaluator_list(list);
    store.register_mesh(Arc::new(column));
    store.register_mesh(Arc::new(surface));
    store
}

fn cells(store: &mut StateStore, key: &str) -> Vec<f64> {
    store.get_field(&at(key)).unwrap().view("cell").unwrap().to_vec()
}

const TOP_CELLS: &str = r#"{
    "surface-source": {"field evaluator type": "primary variable"},
    "source_cells": {
        "field evaluator type": "top cell surface",
        "surface key": "surface-source",
        "negate": NEGATE
    }
}"#;

fn top_cells_store(negate: bool) -> StateStore {
    let list = TOP_CELLS.replace("NEGATE", if negate { "true" } else { "false" });
    let mut store = column_and_surface(3, &list);
    store.require(at("source_cells"), FieldShape::cells("domain"), None).unwrap();
    store.setup().unwrap();
    store
}

#[test]
fn top_cells_writes_only_the_cell_under_the_surface() {
    let mut store = top_cells_store(false);
    store.set_scalar(&at("surface-source"), 3.0).unwrap();
    // Cells are numbered bottom to top; only the top one sits under the surface.
    assert_eq!(cells(&mut store, "source_cells"), vec![0.0, 0.0, 3.0]);
}

#[test]
fn top_cells_negates_on_request() {
    let mut store = top_cells_store(true);
    store.set_scalar(&at("surface-source"), 3.0).unwrap();
    assert_eq!(cells(&mut store, "source_cells"), vec![0.0, 0.0, -3.0]);

    store.set_scalar(&at("surface-source"), -1.5).unwrap();
    assert_eq!(cells(&mut store, "source_cells"), vec![0.0, 0.0, 1.5]);
}

const EOS_CONSTANT: &str = r#"{
    "temperature": {"field evaluator type": "primary variable"},
    "effective_pressure": {"field evaluator type": "primary variable"},
    "molar_density_liquid": {
        "field evaluator type": "eos",
        "EOS basis": "both",
        "EOS parameters": {"EOS type": "constant", "density [kg/m^3]": 1000.0}
    }
}"#;

#[test]
fn constant_eos_fills_both_densities() {
    let mut store = column_and_surface(2, EOS_CONSTANT);
    store.require(at("molar_density_liquid"), FieldShape::cells("domain"), None).unwrap();
    store.require(at("mass_density_liquid"), FieldShape::cells("domain"), None).unwrap();
    store.setup().unwrap();
    store.set_scalar(&at("temperature"), 273.65).unwrap();
    store.set_scalar(&at("effective_pressure"), P_ATM).unwrap();

    let molar = cells(&mut store, "molar_density_liquid");
    for n in molar {
        assert!((n - 1000.0 / 0.0180153).abs() < 1e-6);
    }
    let mass = cells(&mut store, "mass_density_liquid");
    for rho in mass {
        assert!((rho - 1000.0).abs() < 1e-9);
    }
    let d = store
        .get_derivative(&at("molar_density_liquid"), &at("effective_pressure"))
        .unwrap();
    assert_eq!(d.view("cell").unwrap(), &[0.0, 0.0]);
}

const EOS_GAS: &str = r#"{
    "temperature": {"field evaluator type": "primary variable"},
    "effective_pressure": {"field evaluator type": "primary variable"},
    "molar_density_gas": {
        "field evaluator type": "eos",
        "EOS parameters": {"EOS type": "ideal gas", "molar mass [kg/mol]": 0.0289}
    }
}"#;

#[test]
fn ideal_gas_derivatives_follow_the_chain() {
    let mut store = column_and_surface(1, EOS_GAS);
    store.require(at("molar_density_gas"), FieldShape::cells("domain"), None).unwrap();
    store.setup().unwrap();
    let (t, p) = (300.0, 2.0e5);
    store.set_scalar(&at("temperature"), t).unwrap();
    store.set_scalar(&at("effective_pressure"), p).unwrap();

    let n = cells(&mut store, "molar_density_gas")[0];
    assert!((n - p / (R_GAS * t)).abs() < 1e-9 * n);

    let dn_dt = store
        .get_derivative(&at("molar_density_gas"), &at("temperature"))
        .unwrap()
        .view("cell")
        .unwrap()[0];
    assert!((dn_dt + p / (R_GAS * t * t)).abs() < 1e-9 * dn_dt.abs());

    let dn_dp = store
        .get_derivative(&at("molar_density_gas"), &at("effective_pressure"))
        .unwrap()
        .view("cell")
        .unwrap()[0];
    assert!((dn_dp - 1.0 / (R_GAS * t)).abs() < 1e-12);
}

const WRM: &str = r#"{
    "pressure": {"field evaluator type": "primary variable"},
    "saturation_liquid": {
        "field evaluator type": "WRM",
        "van Genuchten alpha": 1.5e-4,
        "van Genuchten m": 0.5,
        "residual saturation": 0.1
    },
    "relative_permeability": {
        "field evaluator type": "relative permeability",
        "van Genuchten alpha": 1.5e-4,
        "van Genuchten m": 0.5,
        "residual saturation": 0.1
    }
}"#;

#[test]
fn wrm_and_relperm_chain_through_saturation() {
    let mut store = column_and_surface(2, WRM);
    store.require(at("relative_permeability"), FieldShape::cells("domain"), None).unwrap();
    store.require(at("saturation_gas"), FieldShape::cells("domain"), None).unwrap();
    store.setup().unwrap();

    // Saturated at or above atmospheric pressure.
    store.set_scalar(&at("pressure"), P_ATM + 1000.0).unwrap();
    assert_eq!(cells(&mut store, "relative_permeability"), vec![1.0, 1.0]);
    assert_eq!(cells(&mut store, "saturation_gas"), vec![0.0, 0.0]);

    store.set_scalar(&at("pressure"), P_ATM - 5.0e4).unwrap();
    let sl = cells(&mut store, "saturation_liquid");
    let kr = cells(&mut store, "relative_permeability");
    let sg = cells(&mut store, "saturation_gas");
    assert!(sl[0] > 0.1 && sl[0] < 1.0, "saturation {}", sl[0]);
    assert!(kr[0] > 0.0 && kr[0] < sl[0], "krel {}", kr[0]);
    assert!((sl[0] + sg[0] - 1.0).abs() < 1e-12);

    // Drier soil conducts less, so kr grows with pressure.
    let dkr = store
        .get_derivative(&at("relative_permeability"), &at("pressure"))
        .unwrap()
        .view("cell")
        .unwrap()[0];
    assert!(dkr > 0.0, "dkr/dp {dkr}");
}
