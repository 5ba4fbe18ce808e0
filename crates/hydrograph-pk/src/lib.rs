//! Process kernels for Hydrograph.
//!
//! A process kernel (PK) turns a physical model into a nonlinear function
//! of its primary unknowns that the [`Bdf1Integrator`] can drive. This
//! crate holds:
//!
//! - the [`NonlinearFunction`] / [`ProcessKernel`] contract and the
//!   hierarchical [`TreeVector`] solution type,
//! - the discrete-operator collaborators ([`operators`], [`bc`]) and the
//!   linear-solve collaborator ([`solver`], [`precon`]),
//! - the [`Richards`] flow and [`Energy`] kernels,
//! - the [`StrongCoupler`] and [`SurfaceSubsurfaceCoupler`],
//! - [`Bdf1Integrator`] and [`TimestepController`].

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod bc;
pub mod bdf;
pub mod controller;
pub mod coupler;
pub mod energy;
pub mod error;
pub mod kernel;
pub mod operators;
pub mod precon;
pub mod richards;
pub mod solver;
pub mod tree_vector;

pub use bc::{BcKind, BcValue, BoundaryConditions};
pub use bdf::{Bdf1Config, Bdf1Integrator};
pub use controller::{AdvanceSummary, TimestepConfig, TimestepController};
pub use coupler::{CouplerPrecon, StrongCoupler, SurfaceSubsurfaceCoupler};
pub use energy::Energy;
pub use error::{KernelError, SolverError, StepFailure, StepOutcome};
pub use kernel::{KernelState, NonlinearFunction, PhysicalBase, ProcessKernel};
pub use precon::{AssembledPrecon, PreconMode};
pub use richards::{FluxUpdateMode, KrelMethod, Richards, SurfaceCoupling};
pub use solver::{DiagonalSolver, DirectSolver, LinearSolver};
pub use tree_vector::TreeVector;
