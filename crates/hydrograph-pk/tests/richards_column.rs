//! Richards kernels on a column: a van Genuchten infiltration run, and a
//! head-coupled column under a storage surface.

use std::sync::Arc;

use hydrograph_core::{Key, KeyTag, ParameterList, Tag};
use hydrograph_evaluators::default_factory;
use hydrograph_mesh::{ColumnMesh, SurfaceMesh};
use hydrograph_pk::{
    Bdf1Config, Bdf1Integrator, NonlinearFunction, ProcessKernel, Richards, SurfaceSubsurfaceCoupler, TimestepConfig,
    TimestepController,
};
use hydrograph_state::StateStore;
use hydrograph_test_utils::{init_tracing, LinearStorageKernel};

fn column_store(ncells: usize, fields: &str) -> StateStore {
    init_tracing();
    let column = ColumnMesh::uniform("domain", 0.0, 1.0, ncells).unwrap();
    let surface = SurfaceMesh::from_faces("surface", &column, vec![column.top_face()]).unwrap();
    let list = ParameterList::from_json("field evaluators", fields).unwrap();
    let mut store = StateStore::new().with_factory(default_factory()).with_evaluator_list(list);
    store.register_mesh(Arc::new(column));
    store.register_mesh(Arc::new(surface));
    store
}

fn total(store: &mut StateStore, key: &str, tag: &Tag) -> f64 {
    store.get_field(&Key::from(key).at(tag)).unwrap().view("cell").unwrap().iter().sum()
}

// ── Infiltration ───────────────────────────────────────────────────

const SOIL: &str = r#"{
    "porosity": {"field evaluator type": "constant", "value": 0.25},
    "molar_density_liquid": {"field evaluator type": "constant", "value": 55000.0},
    "viscosity_liquid": {"field evaluator type": "constant", "value": 8.9e-4},
    "mass_density_liquid": {"field evaluator type": "constant", "value": 1000.0},
    "permeability": {"field evaluator type": "constant", "value": 1.0e-12}
}"#;

/// Rain of 0.01 mol m^-2 s^-1 on the top face; the base holds the
/// water table at z = 0.5.
const INFILTRATION: &str = r#"{
    "absolute error tolerance": 1.0e-6,
    "relative error tolerance": 1.0e-6,
    "water retention evaluator": {
        "van Genuchten alpha": 2.0e-4,
        "van Genuchten m": 0.5,
        "residual saturation": 0.1
    },
    "modify predictor for flux BCs": true,
    "modify predictor with consistent faces": true,
    "initial condition": {"water table elevation": 0.5, "density": 1000.0},
    "boundary conditions": {
        "mass flux": {"rain": {"boundary": "top", "value": -0.01}},
        "pressure": {"base": {"boundary": "bottom", "value": 106228.3}}
    }
}"#;

#[test]
fn van_genuchten_column_takes_up_rain() {
    let mut store = column_store(10, SOIL);
    let plist = ParameterList::from_json("flow", INFILTRATION).unwrap();
    let mut pk = Richards::new(&plist, &store).unwrap();
    assert!(pk.wrm().is_some());
    pk.setup(&mut store).unwrap();
    store.setup().unwrap();
    pk.initialize(&mut store).unwrap();

    // Unsaturated above the water table, saturated below it.
    let sat = store
        .get_field(&KeyTag::new("saturation_liquid", Tag::NEXT))
        .unwrap()
        .view("cell")
        .unwrap()
        .to_vec();
    assert_eq!(sat[0], 1.0);
    assert!(sat[9] > 0.1 && sat[9] < 1.0, "top saturation {}", sat[9]);
    let before = total(&mut store, "water_content", &Tag::PREVIOUS);

    let t_end = 21600.0;
    let config = TimestepConfig {
        initial: 100.0,
        max: 3600.0,
        ..TimestepConfig::default()
    };
    let mut controller = TimestepController::new(config, Bdf1Integrator::new(Bdf1Config::default()));
    let summary = controller.advance(&mut pk, &mut store, t_end).unwrap();
    assert!((summary.t - t_end).abs() < 1e-6);
    assert!(summary.steps > 0);

    let after = total(&mut store, "water_content", &Tag::PREVIOUS);
    let rain = 0.01 * t_end;
    let gained = after - before;
    // Some of the rain leaves through the base; none is created.
    assert!(gained > 0.25 * rain, "gained {gained} of {rain}");
    assert!(gained < 1.05 * rain, "gained {gained} of {rain}");

    let top = store
        .get_field(&KeyTag::new("saturation_liquid", Tag::NEXT))
        .unwrap()
        .view("cell")
        .unwrap()[9];
    assert!(top > sat[9], "top saturation {} -> {top}", sat[9]);
}

// ── Head coupling ──────────────────────────────────────────────────

/// Water content `1e-3 p` with unit transport coefficients.
const LINEAR_SOIL: &str = r#"{
    "water_content": {"field evaluator type": "multiplicative",
                      "evaluator dependencies": ["pressure"], "coefficient": 1.0e-3},
    "relative_permeability": {"field evaluator type": "constant", "value": 1.0},
    "molar_density_liquid": {"field evaluator type": "constant", "value": 1.0},
    "viscosity_liquid": {"field evaluator type": "constant", "value": 1.0},
    "mass_density_liquid": {"field evaluator type": "constant", "value": 1000.0},
    "permeability": {"field evaluator type": "constant", "value": 1.0}
}"#;

/// A head-coupled column of two cells under a storage surface with no
/// decay, set up and initialized at atmospheric pressure.
fn head_coupled() -> (StateStore, SurfaceSubsurfaceCoupler) {
    let mut store = column_store(2, LINEAR_SOIL);
    let flow = ParameterList::from_json(
        "flow",
        r#"{"initial condition": {"value": 101325.0}, "coupled to surface via head": true}"#,
    )
    .unwrap();
    let kernels: Vec<Box<dyn ProcessKernel>> = vec![
        Box::new(Richards::new(&flow, &store).unwrap()),
        Box::new(LinearStorageKernel::new("surface flow", "surface-pressure", 1.0, 0.0, 101325.0).on_domain("surface")),
    ];
    let list = ParameterList::from_json(
        "surface and subsurface",
        r#"{"PK name": "column", "subsurface PK name": "flow", "surface PK name": "surface flow"}"#,
    )
    .unwrap();
    let mut coupler = SurfaceSubsurfaceCoupler::new(&list, &store, kernels).unwrap();
    coupler.setup(&mut store).unwrap();
    store.setup().unwrap();
    coupler.initialize(&mut store).unwrap();
    (store, coupler)
}

/// Parent face of the single surface cell and its direction out of the
/// top column cell.
fn parent_face(store: &StateStore) -> (usize, f64) {
    let column = store.mesh("domain").unwrap();
    let top = column.boundary_faces().iter().copied().max().unwrap();
    let dir = column
        .cell_faces_and_dirs(1)
        .iter()
        .find(|(f, _)| *f == top)
        .map(|(_, d)| f64::from(*d))
        .unwrap();
    (top, dir)
}

#[test]
fn surface_residual_loses_the_exchange_flux() {
    let (mut store, mut coupler) = head_coupled();
    let (top, dir) = parent_face(&store);

    let u = coupler.state_to_solution(&mut store, &Tag::NEXT).unwrap();
    let names: Vec<_> = u.children().iter().map(|c| c.name().to_string()).collect();
    assert_eq!(names, ["flow", "surface flow"]);
    let mut r = u.zeros_like();
    coupler.fun(&mut store, 0.0, 10.0, None, &u, &mut r).unwrap();

    // Uniform pressure under gravity drains through the top face.
    let q = store
        .get_field(&KeyTag::new("darcy_flux", Tag::NEXT))
        .unwrap()
        .view("face")
        .unwrap()
        .to_vec();
    assert!(q[top].abs() > 1.0, "flux {}", q[top]);

    // Without coupling the storage surface is at rest: its residual is zero.
    let rs = r.child(1).unwrap().leaf_data().unwrap().view("cell").unwrap()[0];
    let expected = -dir * q[top];
    assert!((rs - expected).abs() <= 1e-9 * expected.abs(), "{rs} vs {expected}");
}

#[test]
fn preconditioner_moves_the_parent_face_with_the_surface() {
    let (mut store, mut coupler) = head_coupled();
    let (top, _) = parent_face(&store);
    let dt = 10.0;

    let u = coupler.state_to_solution(&mut store, &Tag::NEXT).unwrap();
    let mut r = u.zeros_like();
    coupler.fun(&mut store, 0.0, dt, None, &u, &mut r).unwrap();
    coupler.update_precon(&mut store, dt, &u, dt).unwrap();
    let mut du = u.zeros_like();
    coupler.precon(&r, &mut du).unwrap();

    let rs = r.child(1).unwrap().leaf_data().unwrap().view("cell").unwrap()[0];
    let surface_du = du.child(1).unwrap().leaf_data().unwrap().view("cell").unwrap()[0];
    // The surface block is C / dt with C = 1.
    assert!((surface_du - rs * dt).abs() <= 1e-9 * surface_du.abs());
    assert!(surface_du != 0.0);

    let face_du = du.child(0).unwrap().leaf_data().unwrap().view("face").unwrap()[top];
    assert_eq!(face_du, surface_du);
}
