//! The [`Mesh`] trait.

use hydrograph_core::EntityKind;
use smallvec::SmallVec;

use crate::comm::Communicator;

/// A point or vector in physical space.
pub type Point = [f64; 3];

/// Which entities of a partition to count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallel {
    /// Entities owned by this rank.
    Owned,
    /// Owned plus ghost entities.
    Used,
}

/// Topology and geometry of one computational domain.
///
/// Faces carry a fixed orientation given by [`face_normal`](Mesh::face_normal).
/// The direction reported by [`cell_faces_and_dirs`](Mesh::cell_faces_and_dirs)
/// is `+1` when that normal points out of the cell and `-1` otherwise, so a
/// face flux `q_f` leaves cell `c` at rate `dir * q_f`.
///
/// # Object safety
///
/// Meshes are shared as `Arc<dyn Mesh>` between the state store and the
/// process kernels.
pub trait Mesh: Send + Sync {
    /// Domain name, e.g. `"domain"` or `"surface"`.
    fn name(&self) -> &str;

    /// Number of entities of `kind`. [`EntityKind::Global`] counts as one.
    fn num_entities(&self, kind: EntityKind, ptype: Parallel) -> usize;

    /// Cells adjacent to face `f`: one for boundary faces, two otherwise.
    fn face_cells(&self, f: usize) -> SmallVec<[usize; 2]>;

    /// Faces of cell `c` with their outward directions.
    fn cell_faces_and_dirs(&self, c: usize) -> SmallVec<[(usize, i8); 6]>;

    /// Area of face `f`.
    fn face_area(&self, f: usize) -> f64;

    /// Volume of cell `c`. Surface meshes report cell area.
    fn cell_volume(&self, c: usize) -> f64;

    /// Centroid of cell `c`.
    fn cell_centroid(&self, c: usize) -> Point;

    /// Centroid of face `f`.
    fn face_centroid(&self, f: usize) -> Point;

    /// Unit normal of face `f`, defining the sign of face fluxes.
    fn face_normal(&self, f: usize) -> Point;

    /// Face index of each boundary face, in boundary-face order.
    fn boundary_faces(&self) -> &[usize];

    /// Entity of the parent mesh this entity was extracted from.
    ///
    /// Default: no parent.
    fn entity_parent(&self, _kind: EntityKind, _id: usize) -> Option<usize> {
        None
    }

    /// Domain name of the parent mesh, if this mesh was extracted from one.
    fn parent_domain(&self) -> Option<&str> {
        None
    }

    /// Communicator used for global reductions on this mesh.
    fn comm(&self) -> &dyn Communicator;
}

/// Position of face `f` in the boundary-face ordering.
pub fn boundary_face_index(mesh: &dyn Mesh, f: usize) -> Option<usize> {
    mesh.boundary_faces().iter().position(|&bf| bf == f)
}

/// Euclidean distance between two points.
pub fn distance(a: Point, b: Point) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

/// Dot product of two vectors.
pub fn dot(a: Point, b: Point) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}
