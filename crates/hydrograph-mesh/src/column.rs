//! A vertical column of stacked cells.

use hydrograph_core::EntityKind;
use smallvec::{smallvec, SmallVec};

use crate::comm::{Communicator, SerialComm};
use crate::error::MeshError;
use crate::mesh::{Mesh, Parallel, Point};

/// A one-dimensional vertical column.
///
/// Faces are numbered bottom to top, `0..=n`; cell `i` lies between faces
/// `i` and `i + 1`. All face normals point up (`+z`), so face `0` is the
/// bottom boundary and face `n` the top (surface) boundary.
#[derive(Clone, Debug)]
pub struct ColumnMesh {
    name: String,
    z_faces: Vec<f64>,
    area: f64,
    boundary: [usize; 2],
    comm: SerialComm,
}

impl ColumnMesh {
    /// Build a column from face elevations (strictly increasing) and a
    /// horizontal cross-section area.
    pub fn new(name: impl Into<String>, z_faces: Vec<f64>, area: f64) -> Result<Self, MeshError> {
        if z_faces.len() < 2 {
            return Err(MeshError::EmptyMesh);
        }
        if !(area.is_finite() && area > 0.0) {
            return Err(MeshError::InvalidGeometry {
                reason: format!("cross-section area must be positive, got {area}"),
            });
        }
        if let Some(w) = z_faces.windows(2).find(|w| !(w[1] > w[0])) {
            return Err(MeshError::InvalidGeometry {
                reason: format!("face elevations must increase, got {} then {}", w[0], w[1]),
            });
        }
        let top = z_faces.len() - 1;
        Ok(Self {
            name: name.into(),
            z_faces,
            area,
            boundary: [0, top],
            comm: SerialComm,
        })
    }

    /// `ncells` equal cells between `z_bottom` and `z_top`, unit area.
    pub fn uniform(
        name: impl Into<String>,
        z_bottom: f64,
        z_top: f64,
        ncells: usize,
    ) -> Result<Self, MeshError> {
        if ncells == 0 {
            return Err(MeshError::EmptyMesh);
        }
        let dz = (z_top - z_bottom) / ncells as f64;
        let z = (0..=ncells).map(|i| z_bottom + dz * i as f64).collect();
        Self::new(name, z, 1.0)
    }

    /// Number of cells.
    pub fn ncells(&self) -> usize {
        self.z_faces.len() - 1
    }

    /// Index of the bottom boundary face.
    pub fn bottom_face(&self) -> usize {
        0
    }

    /// Index of the top boundary face.
    pub fn top_face(&self) -> usize {
        self.ncells()
    }
}

impl Mesh for ColumnMesh {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_entities(&self, kind: EntityKind, _ptype: Parallel) -> usize {
        match kind {
            EntityKind::Cell => self.ncells(),
            EntityKind::Face => self.z_faces.len(),
            EntityKind::BoundaryFace => 2,
            EntityKind::Global => 1,
        }
    }

    fn face_cells(&self, f: usize) -> SmallVec<[usize; 2]> {
        let n = self.ncells();
        if f == 0 {
            smallvec![0]
        } else if f == n {
            smallvec![n - 1]
        } else if f < n {
            smallvec![f - 1, f]
        } else {
            SmallVec::new()
        }
    }

    fn cell_faces_and_dirs(&self, c: usize) -> SmallVec<[(usize, i8); 6]> {
        if c >= self.ncells() {
            return SmallVec::new();
        }
        smallvec![(c, -1), (c + 1, 1)]
    }

    fn face_area(&self, _f: usize) -> f64 {
        self.area
    }

    fn cell_volume(&self, c: usize) -> f64 {
        (self.z_faces[c + 1] - self.z_faces[c]) * self.area
    }

    fn cell_centroid(&self, c: usize) -> Point {
        [0.0, 0.0, 0.5 * (self.z_faces[c] + self.z_faces[c + 1])]
    }

    fn face_centroid(&self, f: usize) -> Point {
        [0.0, 0.0, self.z_faces[f]]
    }

    fn face_normal(&self, _f: usize) -> Point {
        [0.0, 0.0, 1.0]
    }

    fn boundary_faces(&self) -> &[usize] {
        &self.boundary
    }

    fn comm(&self) -> &dyn Communicator {
        &self.comm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_column_geometry() {
        let m = ColumnMesh::uniform("domain", -2.0, 0.0, 4).unwrap();
        assert_eq!(m.num_entities(EntityKind::Cell, Parallel::Owned), 4);
        assert_eq!(m.num_entities(EntityKind::Face, Parallel::Owned), 5);
        assert!((m.cell_volume(0) - 0.5).abs() < 1e-12);
        assert_eq!(m.cell_centroid(3)[2], -0.25);
        assert_eq!(m.top_face(), 4);
    }

    #[test]
    fn boundary_faces_have_one_cell() {
        let m = ColumnMesh::uniform("domain", 0.0, 1.0, 3).unwrap();
        for &f in m.boundary_faces() {
            assert_eq!(m.face_cells(f).len(), 1);
        }
        assert_eq!(m.face_cells(1).as_slice(), &[0, 1]);
    }

    #[test]
    fn dirs_point_outward() {
        let m = ColumnMesh::uniform("domain", 0.0, 1.0, 2).unwrap();
        assert_eq!(m.cell_faces_and_dirs(1).as_slice(), &[(1, -1), (2, 1)]);
    }

    #[test]
    fn rejects_non_increasing_faces() {
        match ColumnMesh::new("domain", vec![0.0, 1.0, 1.0], 1.0) {
            Err(MeshError::InvalidGeometry { .. }) => {}
            other => panic!("expected InvalidGeometry, got {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_column() {
        assert!(matches!(
            ColumnMesh::uniform("domain", 0.0, 1.0, 0),
            Err(MeshError::EmptyMesh)
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn volumes_sum_to_column_height(ncells in 1usize..64, height in 0.1f64..100.0) {
                let m = ColumnMesh::uniform("domain", -height, 0.0, ncells).unwrap();
                let total: f64 = (0..ncells).map(|c| m.cell_volume(c)).sum();
                prop_assert!((total - height).abs() < 1e-9 * height.max(1.0));
            }

            #[test]
            fn every_face_touches_one_or_two_cells(ncells in 1usize..32) {
                let m = ColumnMesh::uniform("domain", 0.0, 1.0, ncells).unwrap();
                for f in 0..=ncells {
                    let n = m.face_cells(f).len();
                    prop_assert!(n == 1 || n == 2);
                }
            }
        }
    }
}
