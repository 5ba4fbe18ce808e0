//! Hydrograph: coupled surface and subsurface hydrology on a field
//! dependency graph.
//!
//! This is the top-level facade crate that re-exports the public API from
//! all Hydrograph sub-crates. For most users, adding `hydrograph` as a
//! single dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use hydrograph::prelude::*;
//! use hydrograph::evaluators::{default_factory, P_ATM};
//!
//! // A ten-cell column with saturation computed from pressure.
//! let column = ColumnMesh::uniform("domain", 0.0, 1.0, 10)?;
//! let list = ParameterList::from_json(
//!     "field evaluators",
//!     r#"{
//!         "pressure": {"field evaluator type": "primary variable"},
//!         "saturation_liquid": {
//!             "field evaluator type": "WRM",
//!             "van Genuchten alpha": 1.5e-4,
//!             "van Genuchten m": 0.8,
//!             "residual saturation": 0.1
//!         }
//!     }"#,
//! )?;
//! let mut store = StateStore::new()
//!     .with_factory(default_factory())
//!     .with_evaluator_list(list);
//! store.register_mesh(Arc::new(column));
//!
//! let sat = Key::from("saturation_liquid").at(&Tag::NEXT);
//! store.require(sat.clone(), FieldShape::cells("domain"), None)?;
//! store.setup()?;
//!
//! store.set_scalar(&Key::from("pressure").at(&Tag::NEXT), P_ATM)?;
//! assert!(store.update(&sat, "quick start")?);
//! assert_eq!(store.get_field(&sat)?.view("cell")?, &[1.0; 10]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in the prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `hydrograph-core` | Keys, tags, parameter lists, field data, errors |
//! | [`mesh`] | `hydrograph-mesh` | Mesh trait, column and surface meshes |
//! | [`state`] | `hydrograph-state` | State store, evaluator trait and factory |
//! | [`evaluators`] | `hydrograph-evaluators` | Constitutive relations |
//! | [`pk`] | `hydrograph-pk` | Process kernels, couplers, BDF1 and step control |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Keys, tags, parameter lists and field data (`hydrograph-core`).
///
/// Contains [`types::CompositeVector`], [`types::ParameterList`] and the
/// shared error types [`types::StateError`] and [`types::ConfigError`].
pub use hydrograph_core as types;

/// Meshes (`hydrograph-mesh`).
///
/// Provides the [`mesh::Mesh`] trait and the [`mesh::ColumnMesh`] and
/// [`mesh::SurfaceMesh`] implementations.
pub use hydrograph_mesh as mesh;

/// The field store and evaluator contract (`hydrograph-state`).
///
/// [`state::StateStore`] resolves the dependency graph;
/// [`state::Evaluator`] is the main extension point for constitutive
/// relations.
pub use hydrograph_state as state;

/// Built-in evaluators (`hydrograph-evaluators`).
///
/// [`evaluators::default_factory`] registers every one of them.
pub use hydrograph_evaluators as evaluators;

/// Process kernels and time integration (`hydrograph-pk`).
///
/// [`pk::Richards`] and [`pk::Energy`] kernels, the
/// [`pk::StrongCoupler`] and [`pk::SurfaceSubsurfaceCoupler`], and the
/// [`pk::Bdf1Integrator`] driven by a [`pk::TimestepController`].
pub use hydrograph_pk as pk;

/// Common imports for typical Hydrograph usage.
///
/// ```rust
/// use hydrograph::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use hydrograph_core::{
        CompositeVector, ConfigError, EntityKind, FieldShape, Key, KeyTag, ParameterList, StateError, Tag,
    };

    // Meshes
    pub use hydrograph_mesh::{ColumnMesh, Mesh, MeshError, SurfaceMesh};

    // State
    pub use hydrograph_state::{EvalContext, Evaluator, EvaluatorFactory, StateStore};

    // Kernels and integration
    pub use hydrograph_pk::{
        Bdf1Config, Bdf1Integrator, KernelError, NonlinearFunction, ProcessKernel, StepOutcome, StrongCoupler,
        SurfaceSubsurfaceCoupler, TimestepConfig, TimestepController, TreeVector,
    };
}
