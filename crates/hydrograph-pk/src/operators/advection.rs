//! First-order upwind advection of a cell quantity by face fluxes.

use std::sync::Arc;

use hydrograph_core::{EntityKind, StateError};
use hydrograph_mesh::{Mesh, Parallel};

use crate::bc::{BcKind, BoundaryConditions};

/// Net advective inflow per cell.
///
/// For each face flux `q_f` (along the face normal) the carried value is
/// taken from the upwind side: the cell the flux leaves, or on inflow
/// boundary faces the Dirichlet value of `bcs` (the interior cell's own
/// value where none is set).
pub struct UpwindAdvection {
    mesh: Arc<dyn Mesh>,
    ncells: usize,
    nfaces: usize,
}

impl std::fmt::Debug for UpwindAdvection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpwindAdvection")
            .field("mesh", &self.mesh.name())
            .finish()
    }
}

impl UpwindAdvection {
    /// An operator on `mesh`.
    pub fn new(mesh: Arc<dyn Mesh>) -> Self {
        Self {
            ncells: mesh.num_entities(EntityKind::Cell, Parallel::Used),
            nfaces: mesh.num_entities(EntityKind::Face, Parallel::Used),
            mesh,
        }
    }

    /// Write `sum_f (inflow - outflow)` of `flux * field` into `out`.
    pub fn apply(
        &self,
        flux: &[f64],
        field: &[f64],
        bcs: Option<&BoundaryConditions>,
        out: &mut [f64],
    ) -> Result<(), StateError> {
        if flux.len() != self.nfaces || field.len() != self.ncells || out.len() != self.ncells {
            return Err(StateError::ShapeMismatch {
                reason: format!(
                    "advection on {} cells / {} faces got flux {}, field {}, output {}",
                    self.ncells,
                    self.nfaces,
                    flux.len(),
                    field.len(),
                    out.len()
                ),
            });
        }
        out.fill(0.0);
        for (c, out_c) in out.iter_mut().enumerate() {
            for (f, dir) in self.mesh.cell_faces_and_dirs(c) {
                let outflow = f64::from(dir) * flux[f];
                if outflow >= 0.0 {
                    *out_c -= outflow * field[c];
                    continue;
                }
                let cells = self.mesh.face_cells(f);
                let upwind = match cells.iter().find(|&&other| other != c) {
                    Some(&other) => field[other],
                    None => match bcs {
                        Some(b) if b.kind(f) == BcKind::Dirichlet => b.value(f),
                        _ => field[c],
                    },
                };
                *out_c -= outflow * upwind;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrograph_mesh::ColumnMesh;

    #[test]
    fn interior_transfer_conserves() {
        let mesh: Arc<dyn Mesh> = Arc::new(ColumnMesh::uniform("domain", 0.0, 2.0, 2).unwrap());
        let op = UpwindAdvection::new(mesh);
        // Upward flux through the middle face only.
        let mut out = [0.0; 2];
        op.apply(&[0.0, 2.0, 0.0], &[3.0, 5.0], None, &mut out).unwrap();
        assert_eq!(out, [-6.0, 6.0]);
    }

    #[test]
    fn inflow_boundary_uses_dirichlet_value() {
        let mesh: Arc<dyn Mesh> = Arc::new(ColumnMesh::uniform("domain", 0.0, 1.0, 1).unwrap());
        let op = UpwindAdvection::new(mesh);
        let mut bcs = BoundaryConditions::new(2);
        bcs.set_dirichlet(0, 7.0);
        let mut out = [0.0; 1];
        // Upward flux through both faces: in at the bottom, out at the top.
        op.apply(&[1.0, 1.0], &[2.0], Some(&bcs), &mut out).unwrap();
        assert_eq!(out, [7.0 - 2.0]);
    }
}
