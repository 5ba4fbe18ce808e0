//! Mesh topology and geometry for Hydrograph.
//!
//! The dependency-graph engine and the process kernels consume meshes
//! only through the [`Mesh`] trait: entity counts, face/cell adjacency,
//! parent maps across sub-domain meshes, and geometric measures. Global
//! reductions go through the [`Communicator`] the mesh carries.
//!
//! Two concrete meshes are provided: [`ColumnMesh`], a vertical column of
//! stacked cells, and [`SurfaceMesh`], a surface domain built from faces
//! of a parent mesh.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod column;
pub mod comm;
pub mod error;
pub mod mesh;
pub mod surface;

pub use column::ColumnMesh;
pub use comm::{Communicator, SerialComm};
pub use error::MeshError;
pub use mesh::{boundary_face_index, Mesh, Parallel, Point};
pub use surface::SurfaceMesh;
