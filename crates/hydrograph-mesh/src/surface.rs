//! Surface domains extracted from faces of a parent mesh.

use hydrograph_core::EntityKind;
use smallvec::SmallVec;

use crate::comm::{Communicator, SerialComm};
use crate::error::MeshError;
use crate::mesh::{Mesh, Parallel, Point};

/// A surface mesh whose cells are faces of a parent (subsurface) mesh.
///
/// Cell `c` of the surface corresponds to face `parent_faces[c]` of the
/// parent; [`entity_parent`](Mesh::entity_parent) exposes that map.
/// Lateral connectivity between surface cells is not represented, so the
/// surface has no faces.
#[derive(Clone, Debug)]
pub struct SurfaceMesh {
    name: String,
    parent_domain: String,
    parent_faces: Vec<usize>,
    areas: Vec<f64>,
    centroids: Vec<Point>,
    normals: Vec<Point>,
    comm: SerialComm,
}

impl SurfaceMesh {
    /// Extract a surface from `faces` of `parent`.
    ///
    /// Every face must be a boundary face of the parent.
    pub fn from_faces(
        name: impl Into<String>,
        parent: &dyn Mesh,
        faces: Vec<usize>,
    ) -> Result<Self, MeshError> {
        if faces.is_empty() {
            return Err(MeshError::EmptyMesh);
        }
        let nfaces = parent.num_entities(EntityKind::Face, Parallel::Used);
        for &f in &faces {
            if f >= nfaces {
                return Err(MeshError::UnknownEntity {
                    kind: EntityKind::Face,
                    id: f,
                });
            }
            if parent.face_cells(f).len() != 1 {
                return Err(MeshError::InvalidGeometry {
                    reason: format!("face {f} is not on the boundary of '{}'", parent.name()),
                });
            }
        }
        Ok(Self {
            name: name.into(),
            parent_domain: parent.name().to_string(),
            areas: faces.iter().map(|&f| parent.face_area(f)).collect(),
            centroids: faces.iter().map(|&f| parent.face_centroid(f)).collect(),
            normals: faces.iter().map(|&f| parent.face_normal(f)).collect(),
            parent_faces: faces,
            comm: SerialComm,
        })
    }

    /// Number of surface cells.
    pub fn ncells(&self) -> usize {
        self.parent_faces.len()
    }

    /// Outward normal of the parent face under surface cell `c`.
    pub fn cell_normal(&self, c: usize) -> Point {
        self.normals[c]
    }
}

impl Mesh for SurfaceMesh {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_entities(&self, kind: EntityKind, _ptype: Parallel) -> usize {
        match kind {
            EntityKind::Cell => self.ncells(),
            EntityKind::Face | EntityKind::BoundaryFace => 0,
            EntityKind::Global => 1,
        }
    }

    fn face_cells(&self, _f: usize) -> SmallVec<[usize; 2]> {
        SmallVec::new()
    }

    fn cell_faces_and_dirs(&self, _c: usize) -> SmallVec<[(usize, i8); 6]> {
        SmallVec::new()
    }

    fn face_area(&self, _f: usize) -> f64 {
        0.0
    }

    fn cell_volume(&self, c: usize) -> f64 {
        self.areas[c]
    }

    fn cell_centroid(&self, c: usize) -> Point {
        self.centroids[c]
    }

    fn face_centroid(&self, _f: usize) -> Point {
        [0.0; 3]
    }

    fn face_normal(&self, _f: usize) -> Point {
        [0.0; 3]
    }

    fn boundary_faces(&self) -> &[usize] {
        &[]
    }

    fn entity_parent(&self, kind: EntityKind, id: usize) -> Option<usize> {
        match kind {
            EntityKind::Cell => self.parent_faces.get(id).copied(),
            _ => None,
        }
    }

    fn parent_domain(&self) -> Option<&str> {
        Some(&self.parent_domain)
    }

    fn comm(&self) -> &dyn Communicator {
        &self.comm
    }
}
