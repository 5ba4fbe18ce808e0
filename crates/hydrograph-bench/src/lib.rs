//! Benchmark profiles for the Hydrograph framework.
//!
//! - [`chain_profile`]: a linear chain of product evaluators over one
//!   primary field
//! - [`fan_profile`]: many evaluators reading the same primary field
//! - [`richards_profile`]: a set-up Richards kernel on a uniform column

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use hydrograph_core::{FieldShape, Key, KeyTag, ParameterList, StateError, Tag};
use hydrograph_evaluators::default_factory;
use hydrograph_mesh::{ColumnMesh, SurfaceMesh};
use hydrograph_pk::{KernelError, ProcessKernel, Richards};
use hydrograph_state::StateStore;

/// Name of link `i` in the profiles.
pub fn link_key(i: usize) -> KeyTag {
    Key::from(format!("f{i}")).at(&Tag::NEXT)
}

/// A unit column of `ncells` cells with a one-cell surface on top.
fn column_store(ncells: usize, list: ParameterList) -> StateStore {
    let column = ColumnMesh::uniform("domain", 0.0, 1.0, ncells).expect("ncells must be positive");
    let surface =
        SurfaceMesh::from_faces("surface", &column, vec![column.top_face()]).expect("top face is a boundary face");
    let mut store = StateStore::new().with_factory(default_factory()).with_evaluator_list(list);
    store.register_mesh(Arc::new(column));
    store.register_mesh(Arc::new(surface));
    store
}

fn primary_entry() -> ParameterList {
    let mut p = ParameterList::new("f0");
    p.set("field evaluator type", "primary variable");
    p
}

fn product_entry(name: &str, deps: Vec<String>) -> ParameterList {
    let mut p = ParameterList::new(name);
    p.set("field evaluator type", "multiplicative")
        .set("evaluator dependencies", deps)
        .set("coefficient", 1.0001);
    p
}

/// `f0 -> f1 -> ... -> f{depth}` on `ncells` cells, set up with `f0 = 1`.
pub fn chain_profile(depth: usize, ncells: usize) -> Result<StateStore, StateError> {
    let mut list = ParameterList::new("field evaluators");
    list.set_sublist("f0", primary_entry());
    for i in 1..=depth {
        let name = format!("f{i}");
        list.set_sublist(name.as_str(), product_entry(&name, vec![format!("f{}", i - 1)]));
    }
    let mut store = column_store(ncells, list);
    store.require(link_key(depth), FieldShape::cells("domain"), None)?;
    store.setup()?;
    store.set_scalar(&link_key(0), 1.0)?;
    Ok(store)
}

/// `f1 ... f{width}` each reading `f0`, plus `f{width + 1}` reading all of
/// them, set up with `f0 = 1`.
pub fn fan_profile(width: usize, ncells: usize) -> Result<StateStore, StateError> {
    let mut list = ParameterList::new("field evaluators");
    list.set_sublist("f0", primary_entry());
    for i in 1..=width {
        let name = format!("f{i}");
        list.set_sublist(name.as_str(), product_entry(&name, vec!["f0".to_string()]));
    }
    let top = format!("f{}", width + 1);
    let deps = (1..=width).map(|i| format!("f{i}")).collect();
    list.set_sublist(top.as_str(), product_entry(&top, deps));

    let mut store = column_store(ncells, list);
    store.require(link_key(width + 1), FieldShape::cells("domain"), None)?;
    store.setup()?;
    store.set_scalar(&link_key(0), 1.0)?;
    Ok(store)
}

const RICHARDS_FIELDS: &str = r#"{
    "water_content": {"field evaluator type": "primary variable"},
    "relative_permeability": {"field evaluator type": "constant", "value": 1.0},
    "molar_density_liquid": {"field evaluator type": "constant", "value": 55000.0},
    "viscosity_liquid": {"field evaluator type": "constant", "value": 8.9e-4},
    "mass_density_liquid": {"field evaluator type": "constant", "value": 1000.0},
    "permeability": {"field evaluator type": "constant", "value": 1.0e-12},
    "surface-pressure": {"field evaluator type": "primary variable"}
}"#;

const RICHARDS_CONFIG: &str = r#"{
    "initial condition": {"water table elevation": 0.5, "density": 1000.0},
    "boundary conditions": {"pressure": {"bottom": {"boundary": "bottom", "value": 106228.0}}}
}"#;

/// A Richards kernel on a column of `ncells` cells, set up and
/// initialized at a hydrostatic water table.
pub fn richards_profile(ncells: usize) -> Result<(StateStore, Richards), KernelError> {
    let list = ParameterList::from_json("field evaluators", RICHARDS_FIELDS)?;
    let mut store = column_store(ncells, list);
    let plist = ParameterList::from_json("flow", RICHARDS_CONFIG)?;
    let mut pk = Richards::new(&plist, &store)?;
    pk.setup(&mut store)?;
    store.setup()?;
    store.set_scalar(&Key::from("water_content").at(&Tag::NEXT), 1000.0)?;
    pk.initialize(&mut store)?;
    Ok((store, pk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_profile_resolves() {
        let mut store = chain_profile(5, 4).unwrap();
        let v = store.get_field(&link_key(5)).unwrap().view("cell").unwrap()[0];
        assert!((v - 1.0001f64.powi(5)).abs() < 1e-12);
    }

    #[test]
    fn fan_profile_resolves() {
        let mut store = fan_profile(3, 2).unwrap();
        let v = store.get_field(&link_key(4)).unwrap().view("cell").unwrap()[0];
        assert!((v - 1.0001f64.powi(4)).abs() < 1e-12);
    }

    #[test]
    fn richards_profile_starts_hydrostatic() {
        use hydrograph_pk::NonlinearFunction;

        let (mut store, mut pk) = richards_profile(4).unwrap();
        let u = pk.state_to_solution(&mut store, &Tag::NEXT).unwrap();
        let mut r = u.zeros_like();
        pk.fun(&mut store, 0.0, 3600.0, None, &u, &mut r).unwrap();
        assert!(r.norm_inf().is_finite());
    }
}
