//! Hybrid cell/face diffusion with a diagonal inner product and gravity.
//!
//! Each cell `c` and face `f` of that cell form a half-face with
//! transmissibility `T_cf = A_f / |x_f - x_c|`. The flux leaving `c`
//! through `f` is
//!
//! ```text
//! q_cf = k_cf * K_c * T_cf * ((u_c - u_f) + rho_c * g . (x_f - x_c))
//! ```
//!
//! where `K_c` is a cell coefficient (absolute permeability, thermal
//! conductivity), `k_cf` a half-face coefficient (upwinded relative
//! mobility, or one) and the gravity term is present only when a density
//! is set.
//!
//! Residual rows, in flat `[cells, faces]` order:
//!
//! | row | value |
//! |-----|-------|
//! | cell `c` | `sum_f q_cf` (net outflow) |
//! | face, interior or Neumann | `N_f * A_f - sum_c q_cf` |
//! | face, Dirichlet | `u_f - v_f` |
//!
//! Boundary faces marked [`BcKind::None`] behave as Neumann zero.

use std::sync::Arc;

use hydrograph_core::{CompositeVector, EntityKind, StateError};
use hydrograph_mesh::mesh::{distance, dot};
use hydrograph_mesh::{Mesh, Parallel, Point};
use nalgebra::{DMatrix, DVector};
use smallvec::SmallVec;

use crate::bc::{BcKind, BoundaryConditions};

/// Standard gravity, pointing down.
pub const GRAVITY: Point = [0.0, 0.0, -9.80665];

#[derive(Clone, Debug)]
struct HalfFace {
    cell: usize,
    face: usize,
    /// `+1` when the face normal points out of the cell.
    dir: f64,
    trans: f64,
    /// `g . (x_f - x_c)`, zero without gravity.
    g_dx: f64,
}

fn length_error(what: &str, expected: usize, got: usize) -> StateError {
    StateError::ShapeMismatch {
        reason: format!("{what}: expected {expected} values, got {got}"),
    }
}

/// The diffusion operator for one mesh.
pub struct MfdDiffusion {
    mesh: Arc<dyn Mesh>,
    ncells: usize,
    nfaces: usize,
    halves: Vec<HalfFace>,
    face_halves: Vec<SmallVec<[usize; 2]>>,
    cell_coef: Vec<f64>,
    half_coef: Vec<f64>,
    density: Option<Vec<f64>>,
}

impl std::fmt::Debug for MfdDiffusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfdDiffusion")
            .field("mesh", &self.mesh.name())
            .field("ncells", &self.ncells)
            .field("nfaces", &self.nfaces)
            .finish()
    }
}

impl MfdDiffusion {
    /// Build the half-face geometry of `mesh`. With `gravity`, fluxes
    /// include the `rho g . dx` term once a density is set.
    pub fn new(mesh: Arc<dyn Mesh>, gravity: Option<Point>) -> Self {
        let ncells = mesh.num_entities(EntityKind::Cell, Parallel::Used);
        let nfaces = mesh.num_entities(EntityKind::Face, Parallel::Used);
        let mut halves = Vec::new();
        let mut face_halves = vec![SmallVec::new(); nfaces];
        for c in 0..ncells {
            let xc = mesh.cell_centroid(c);
            for (f, dir) in mesh.cell_faces_and_dirs(c) {
                let xf = mesh.face_centroid(f);
                let dx = [xf[0] - xc[0], xf[1] - xc[1], xf[2] - xc[2]];
                face_halves[f].push(halves.len());
                halves.push(HalfFace {
                    cell: c,
                    face: f,
                    dir: f64::from(dir),
                    trans: mesh.face_area(f) / distance(xf, xc),
                    g_dx: gravity.map_or(0.0, |g| dot(g, dx)),
                });
            }
        }
        let nhalves = halves.len();
        Self {
            mesh,
            ncells,
            nfaces,
            halves,
            face_halves,
            cell_coef: vec![1.0; ncells],
            half_coef: vec![1.0; nhalves],
            density: None,
        }
    }

    /// The mesh.
    pub fn mesh(&self) -> &Arc<dyn Mesh> {
        &self.mesh
    }

    /// Number of cells.
    pub fn ncells(&self) -> usize {
        self.ncells
    }

    /// Number of faces.
    pub fn nfaces(&self) -> usize {
        self.nfaces
    }

    /// Set `K_c`.
    pub fn set_cell_coefficients(&mut self, k: &[f64]) -> Result<(), StateError> {
        if k.len() != self.ncells {
            return Err(length_error("cell coefficients", self.ncells, k.len()));
        }
        self.cell_coef.copy_from_slice(k);
        Ok(())
    }

    /// Set `k_cf` from a function of `(cell, face)`.
    pub fn set_half_face_coefficients(&mut self, k: impl Fn(usize, usize) -> f64) {
        for (coef, h) in self.half_coef.iter_mut().zip(&self.halves) {
            *coef = k(h.cell, h.face);
        }
    }

    /// Set `k_cf = k_f` on both sides of each face.
    pub fn set_face_coefficients(&mut self, k: &[f64]) -> Result<(), StateError> {
        if k.len() != self.nfaces {
            return Err(length_error("face coefficients", self.nfaces, k.len()));
        }
        self.set_half_face_coefficients(|_, f| k[f]);
        Ok(())
    }

    /// Set every `k_cf` to one.
    pub fn set_unit_face_coefficients(&mut self) {
        self.half_coef.fill(1.0);
    }

    /// Cell densities for the gravity term, or `None` to drop it.
    pub fn set_density(&mut self, rho: Option<&[f64]>) -> Result<(), StateError> {
        match rho {
            Some(r) if r.len() != self.ncells => Err(length_error("density", self.ncells, r.len())),
            Some(r) => {
                self.density = Some(r.to_vec());
                Ok(())
            }
            None => {
                self.density = None;
                Ok(())
            }
        }
    }

    /// Conductance of half-face `i`: `k_cf K_c T_cf`.
    fn conductance(&self, i: usize) -> f64 {
        let h = &self.halves[i];
        self.half_coef[i] * self.cell_coef[h.cell] * h.trans
    }

    fn gravity_head(&self, i: usize) -> f64 {
        let h = &self.halves[i];
        self.density.as_ref().map_or(0.0, |rho| rho[h.cell] * h.g_dx)
    }

    fn half_flux(&self, i: usize, uc: &[f64], uf: &[f64]) -> f64 {
        let h = &self.halves[i];
        self.conductance(i) * ((uc[h.cell] - uf[h.face]) + self.gravity_head(i))
    }

    /// Overwrite `r` with the diffusion residual of `u`.
    pub fn residual(
        &self,
        u: &CompositeVector,
        bcs: &BoundaryConditions,
        r: &mut CompositeVector,
    ) -> Result<(), StateError> {
        let uc = u.view("cell")?;
        let uf = if self.nfaces > 0 { u.view("face")? } else { &[] };

        let rc = r.view_mut("cell")?;
        rc.fill(0.0);
        for i in 0..self.halves.len() {
            rc[self.halves[i].cell] += self.half_flux(i, uc, uf);
        }
        if self.nfaces == 0 {
            return Ok(());
        }

        let rf = r.view_mut("face")?;
        for (f, rf) in rf.iter_mut().enumerate() {
            *rf = match bcs.kind(f) {
                BcKind::Dirichlet => uf[f] - bcs.value(f),
                kind => {
                    let out: f64 = self.face_halves[f]
                        .iter()
                        .map(|&i| self.half_flux(i, uc, uf))
                        .sum();
                    let imposed = if kind == BcKind::Neumann {
                        bcs.value(f) * self.mesh.face_area(f)
                    } else {
                        0.0
                    };
                    imposed - out
                }
            };
        }
        Ok(())
    }

    /// Outward flux through boundary face `f` for cell value `uc`, face
    /// value `uf` and face coefficient `k`, with the current cell
    /// coefficient and density. `None` unless `f` has exactly one cell.
    pub fn boundary_flux(&self, f: usize, uc: f64, uf: f64, k: f64) -> Option<f64> {
        let [i] = self.face_halves.get(f)?.as_slice() else {
            return None;
        };
        let h = &self.halves[*i];
        Some(k * self.cell_coef[h.cell] * h.trans * ((uc - uf) + self.gravity_head(*i)))
    }

    /// Face fluxes along each face normal.
    ///
    /// Interior faces average the two one-sided fluxes, which agree once
    /// the face rows are satisfied.
    pub fn flux(&self, u: &CompositeVector) -> Result<Vec<f64>, StateError> {
        let uc = u.view("cell")?;
        let uf = if self.nfaces > 0 { u.view("face")? } else { &[] };
        let mut flux = vec![0.0; self.nfaces];
        for (f, q) in flux.iter_mut().enumerate() {
            let halves = &self.face_halves[f];
            if halves.is_empty() {
                continue;
            }
            let sum: f64 = halves
                .iter()
                .map(|&i| self.halves[i].dir * self.half_flux(i, uc, uf))
                .sum();
            *q = sum / halves.len() as f64;
        }
        Ok(flux)
    }

    /// The local Jacobian for fixed coefficients, flat `[cells, faces]`,
    /// with `accumulation[c]` added to each cell diagonal.
    ///
    /// Faces with zero total conductance get a unit diagonal.
    pub fn jacobian(&self, bcs: &BoundaryConditions, accumulation: &[f64]) -> Result<DMatrix<f64>, StateError> {
        if accumulation.len() != self.ncells {
            return Err(length_error("accumulation", self.ncells, accumulation.len()));
        }
        let nc = self.ncells;
        let n = nc + self.nfaces;
        let mut a = DMatrix::zeros(n, n);
        for (c, acc) in accumulation.iter().enumerate() {
            a[(c, c)] += acc;
        }
        for (i, h) in self.halves.iter().enumerate() {
            let k = self.conductance(i);
            let (c, f) = (h.cell, nc + h.face);
            a[(c, c)] += k;
            a[(c, f)] -= k;
            if bcs.kind(h.face) != BcKind::Dirichlet {
                a[(f, c)] -= k;
                a[(f, f)] += k;
            }
        }
        for f in 0..self.nfaces {
            let row = nc + f;
            if bcs.kind(f) == BcKind::Dirichlet || a[(row, row)] == 0.0 {
                a[(row, row)] = 1.0;
            }
        }
        Ok(a)
    }

    /// Face values consistent with fixed cell values: the unweighted
    /// average of adjacent cells, then the exact local solve of each face
    /// row with the current coefficients.
    pub fn update_consistent_faces(
        &self,
        u: &mut CompositeVector,
        bcs: &BoundaryConditions,
    ) -> Result<(), StateError> {
        if self.nfaces == 0 {
            return Ok(());
        }
        let uc = u.view("cell")?.to_vec();
        let mut uf = u.view("face")?.to_vec();
        for (f, value) in uf.iter_mut().enumerate() {
            let halves = &self.face_halves[f];
            if halves.is_empty() {
                continue;
            }
            *value = halves.iter().map(|&i| uc[self.halves[i].cell]).sum::<f64>() / halves.len() as f64;
        }
        for (f, value) in uf.iter_mut().enumerate() {
            match bcs.kind(f) {
                BcKind::Dirichlet => *value = bcs.value(f),
                kind => {
                    let mut diag = 0.0;
                    let mut rhs = 0.0;
                    for &i in &self.face_halves[f] {
                        let k = self.conductance(i);
                        diag += k;
                        rhs += k * (uc[self.halves[i].cell] + self.gravity_head(i));
                    }
                    if kind == BcKind::Neumann {
                        rhs -= bcs.value(f) * self.mesh.face_area(f);
                    }
                    if diag > 0.0 {
                        *value = rhs / diag;
                    }
                }
            }
        }
        u.view_mut("face")?.copy_from_slice(&uf);
        Ok(())
    }
}

// ── Schur complement ───────────────────────────────────────────────

/// Cell-only system left after eliminating the diagonal face block of a
/// flat `[cells, faces]` matrix.
#[derive(Clone, Debug)]
pub struct SchurComplement {
    ncells: usize,
    a_cf: DMatrix<f64>,
    a_fc: DMatrix<f64>,
    d_inv: DVector<f64>,
    /// `A_cc - A_cf D^-1 A_fc`.
    pub matrix: DMatrix<f64>,
}

impl SchurComplement {
    /// Eliminate the faces of `a`. Only the diagonal of the face block is
    /// used; zero entries are treated as one.
    pub fn new(a: &DMatrix<f64>, ncells: usize) -> Self {
        let n = a.nrows();
        let nf = n - ncells;
        let a_cc = a.view((0, 0), (ncells, ncells)).clone_owned();
        let a_cf = a.view((0, ncells), (ncells, nf)).clone_owned();
        let a_fc = a.view((ncells, 0), (nf, ncells)).clone_owned();
        let d_inv = DVector::from_iterator(
            nf,
            (0..nf).map(|f| {
                let d = a[(ncells + f, ncells + f)];
                if d.abs() > f64::EPSILON {
                    1.0 / d
                } else {
                    1.0
                }
            }),
        );
        let scaled = DMatrix::from_fn(nf, ncells, |f, c| d_inv[f] * a_fc[(f, c)]);
        let matrix = a_cc - &a_cf * scaled;
        Self {
            ncells,
            a_cf,
            a_fc,
            d_inv,
            matrix,
        }
    }

    /// Reduced right-hand side `r_c - A_cf D^-1 r_f`.
    pub fn reduce(&self, r: &DVector<f64>) -> DVector<f64> {
        let rc = r.rows(0, self.ncells);
        let rf = r.rows(self.ncells, r.len() - self.ncells);
        let scaled = rf.component_mul(&self.d_inv);
        rc - &self.a_cf * scaled
    }

    /// Full solution from the cell solution: `du_f = D^-1 (r_f - A_fc du_c)`.
    pub fn expand(&self, r: &DVector<f64>, du_c: &DVector<f64>) -> DVector<f64> {
        let nf = r.len() - self.ncells;
        let rf = r.rows(self.ncells, nf);
        let du_f = (rf - &self.a_fc * du_c).component_mul(&self.d_inv);
        let mut out = DVector::zeros(r.len());
        out.rows_mut(0, self.ncells).copy_from(du_c);
        out.rows_mut(self.ncells, nf).copy_from(&du_f);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrograph_core::FieldShape;
    use hydrograph_mesh::ColumnMesh;

    fn column(n: usize) -> Arc<dyn Mesh> {
        Arc::new(ColumnMesh::uniform("domain", 0.0, n as f64, n).unwrap())
    }

    fn cell_face(mesh: &dyn Mesh, cells: f64, faces: f64) -> CompositeVector {
        let mut u = CompositeVector::zeros(FieldShape::cells_and_faces("domain"), |k| {
            mesh.num_entities(k, Parallel::Used)
        });
        u.view_mut("cell").unwrap().fill(cells);
        u.view_mut("face").unwrap().fill(faces);
        u
    }

    #[test]
    fn uniform_state_has_zero_residual() {
        let mesh = column(3);
        let op = MfdDiffusion::new(mesh.clone(), None);
        let u = cell_face(mesh.as_ref(), 2.0, 2.0);
        let mut r = u.zeros_like();
        op.residual(&u, &BoundaryConditions::new(op.nfaces()), &mut r).unwrap();
        assert!(r.norm_inf() < 1e-14);
    }

    #[test]
    fn hydrostatic_state_has_zero_residual() {
        let mesh = column(4);
        let mut op = MfdDiffusion::new(mesh.clone(), Some(GRAVITY));
        let rho = 1000.0;
        op.set_density(Some(&[rho; 4])).unwrap();
        let p = |z: f64| 101325.0 + rho * 9.80665 * (4.0 - z);
        let mut u = cell_face(mesh.as_ref(), 0.0, 0.0);
        for (c, v) in u.view_mut("cell").unwrap().iter_mut().enumerate() {
            *v = p(mesh.cell_centroid(c)[2]);
        }
        for (f, v) in u.view_mut("face").unwrap().iter_mut().enumerate() {
            *v = p(mesh.face_centroid(f)[2]);
        }
        let mut r = u.zeros_like();
        op.residual(&u, &BoundaryConditions::new(op.nfaces()), &mut r).unwrap();
        assert!(r.norm_inf() < 1e-6, "residual {}", r.norm_inf());
    }

    #[test]
    fn dirichlet_row_is_constraint() {
        let mesh = column(2);
        let op = MfdDiffusion::new(mesh.clone(), None);
        let u = cell_face(mesh.as_ref(), 1.0, 1.0);
        let mut bcs = BoundaryConditions::new(op.nfaces());
        bcs.set_dirichlet(0, 3.0);
        let mut r = u.zeros_like();
        op.residual(&u, &bcs, &mut r).unwrap();
        assert_eq!(r.view("face").unwrap()[0], -2.0);
    }

    #[test]
    fn jacobian_matches_residual_difference() {
        let mesh = column(3);
        let mut op = MfdDiffusion::new(mesh.clone(), None);
        op.set_cell_coefficients(&[1.0, 2.0, 0.5]).unwrap();
        let mut bcs = BoundaryConditions::new(op.nfaces());
        bcs.set_dirichlet(3, 1.0);
        bcs.set_neumann(0, 0.25);

        let mut u = cell_face(mesh.as_ref(), 0.0, 0.0);
        let flat: Vec<f64> = (0..u.len()).map(|i| (i as f64 * 0.37).sin()).collect();
        u.read_flat(&flat).unwrap();
        let a = op.jacobian(&bcs, &[0.0; 3]).unwrap();

        let mut r0 = u.zeros_like();
        op.residual(&u, &bcs, &mut r0).unwrap();
        for j in 0..u.len() {
            let mut up = flat.clone();
            up[j] += 1.0;
            let mut u1 = u.clone();
            u1.read_flat(&up).unwrap();
            let mut r1 = u.zeros_like();
            op.residual(&u1, &bcs, &mut r1).unwrap();
            for (i, (a1, a0)) in r1.values().zip(r0.values()).enumerate() {
                assert!((a1 - a0 - a[(i, j)]).abs() < 1e-12, "entry ({i},{j})");
            }
        }
    }

    #[test]
    fn schur_solve_matches_full_solve() {
        let mesh = column(3);
        let op = MfdDiffusion::new(mesh, None);
        let mut bcs = BoundaryConditions::new(op.nfaces());
        bcs.set_dirichlet(0, 0.0);
        let a = op.jacobian(&bcs, &[1.0, 1.0, 1.0]).unwrap();
        let r = DVector::from_fn(a.nrows(), |i, _| 1.0 + i as f64);
        let full = a.clone().lu().solve(&r).unwrap();

        let s = SchurComplement::new(&a, 3);
        let du_c = s.matrix.clone().lu().solve(&s.reduce(&r)).unwrap();
        let du = s.expand(&r, &du_c);
        assert!((du - full).amax() < 1e-10);
    }

    #[test]
    fn consistent_faces_solve_face_rows() {
        let mesh = column(3);
        let op = MfdDiffusion::new(mesh.clone(), None);
        let mut u = cell_face(mesh.as_ref(), 0.0, 0.0);
        u.view_mut("cell").unwrap().copy_from_slice(&[1.0, 2.0, 4.0]);
        let mut bcs = BoundaryConditions::new(op.nfaces());
        bcs.set_dirichlet(3, 10.0);
        op.update_consistent_faces(&mut u, &bcs).unwrap();
        assert_eq!(u.view("face").unwrap(), &[1.0, 1.5, 3.0, 10.0]);

        let mut r = u.zeros_like();
        op.residual(&u, &bcs, &mut r).unwrap();
        assert!(r.view("face").unwrap().iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn flux_sign_follows_normal() {
        let mesh = column(2);
        let op = MfdDiffusion::new(mesh.clone(), None);
        let mut u = cell_face(mesh.as_ref(), 0.0, 0.0);
        u.view_mut("cell").unwrap().copy_from_slice(&[2.0, 1.0]);
        u.view_mut("face").unwrap().copy_from_slice(&[2.0, 1.5, 1.0]);
        let q = op.flux(&u).unwrap();
        // Upward normals, higher value below: positive flux.
        assert!(q[1] > 0.0);
        assert!(q[0].abs() < 1e-14 && q[2].abs() < 1e-14);
    }
}
