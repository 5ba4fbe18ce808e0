//! Discrete operators on the hybrid cell/face unknowns.
//!
//! These stand in for a full mesh-discretization library: enough to run
//! the kernels end to end on the meshes in `hydrograph-mesh`.

pub mod advection;
pub mod diffusion;

pub use advection::UpwindAdvection;
pub use diffusion::MfdDiffusion;
