//! The linear-solve collaborator behind every preconditioner.
//!
//! Kernels assemble a dense approximate Jacobian, hand it to a
//! [`LinearSolver`] once per [`update_precon`](crate::kernel::NonlinearFunction::update_precon),
//! then call [`solve`](LinearSolver::solve) once per Newton iteration.

use nalgebra::{DMatrix, DVector, LU};

use crate::error::SolverError;

/// Factor once, solve many times.
///
/// # Object safety
///
/// Kernels hold solvers as `Box<dyn LinearSolver>` so the choice can come
/// from configuration.
pub trait LinearSolver: Send {
    /// Solver name for logging.
    fn name(&self) -> &str;

    /// Factor `a`, replacing any previous factorization.
    fn factor(&mut self, a: &DMatrix<f64>) -> Result<(), SolverError>;

    /// Solve the factored system for `b`.
    fn solve(&self, b: &DVector<f64>) -> Result<DVector<f64>, SolverError>;
}

/// Dense LU with partial pivoting.
#[derive(Default)]
pub struct DirectSolver {
    lu: Option<LU<f64, nalgebra::Dyn, nalgebra::Dyn>>,
    size: usize,
}

impl DirectSolver {
    /// An unfactored solver.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for DirectSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectSolver")
            .field("size", &self.size)
            .field("factored", &self.lu.is_some())
            .finish()
    }
}

impl LinearSolver for DirectSolver {
    fn name(&self) -> &str {
        "direct"
    }

    fn factor(&mut self, a: &DMatrix<f64>) -> Result<(), SolverError> {
        if a.nrows() != a.ncols() {
            return Err(SolverError::DimensionMismatch {
                expected: a.nrows(),
                got: a.ncols(),
            });
        }
        let lu = a.clone().lu();
        if !lu.is_invertible() {
            self.lu = None;
            return Err(SolverError::Singular { size: a.nrows() });
        }
        self.size = a.nrows();
        self.lu = Some(lu);
        Ok(())
    }

    fn solve(&self, b: &DVector<f64>) -> Result<DVector<f64>, SolverError> {
        let lu = self.lu.as_ref().ok_or(SolverError::NotFactored)?;
        if b.len() != self.size {
            return Err(SolverError::DimensionMismatch {
                expected: self.size,
                got: b.len(),
            });
        }
        lu.solve(b).ok_or(SolverError::Singular { size: self.size })
    }
}

/// Jacobi: divides by the diagonal.
#[derive(Debug, Default)]
pub struct DiagonalSolver {
    inv_diag: Option<DVector<f64>>,
}

impl DiagonalSolver {
    /// An unfactored solver.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinearSolver for DiagonalSolver {
    fn name(&self) -> &str {
        "diagonal"
    }

    fn factor(&mut self, a: &DMatrix<f64>) -> Result<(), SolverError> {
        let d = a.diagonal();
        if d.iter().any(|v| *v == 0.0 || !v.is_finite()) {
            self.inv_diag = None;
            return Err(SolverError::Singular { size: d.len() });
        }
        self.inv_diag = Some(d.map(|v| 1.0 / v));
        Ok(())
    }

    fn solve(&self, b: &DVector<f64>) -> Result<DVector<f64>, SolverError> {
        let inv = self.inv_diag.as_ref().ok_or(SolverError::NotFactored)?;
        if b.len() != inv.len() {
            return Err(SolverError::DimensionMismatch {
                expected: inv.len(),
                got: b.len(),
            });
        }
        Ok(b.component_mul(inv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_solves_small_system() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 2.0, 3.0]);
        let mut s = DirectSolver::new();
        s.factor(&a).unwrap();
        let x = s.solve(&DVector::from_vec(vec![1.0, 2.0])).unwrap();
        let r = &a * &x - DVector::from_vec(vec![1.0, 2.0]);
        assert!(r.amax() < 1e-12);
    }

    #[test]
    fn singular_matrix_is_reported() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        match DirectSolver::new().factor(&a) {
            Err(SolverError::Singular { size }) => assert_eq!(size, 2),
            other => panic!("expected Singular, got {other:?}"),
        }
    }

    #[test]
    fn solve_before_factor_fails() {
        let s = DiagonalSolver::new();
        assert_eq!(
            s.solve(&DVector::zeros(1)).unwrap_err(),
            SolverError::NotFactored
        );
    }

    #[test]
    fn diagonal_divides() {
        let a = DMatrix::from_diagonal(&DVector::from_vec(vec![2.0, 4.0]));
        let mut s = DiagonalSolver::new();
        s.factor(&a).unwrap();
        let x = s.solve(&DVector::from_vec(vec![1.0, 1.0])).unwrap();
        assert_eq!(x.as_slice(), &[0.5, 0.25]);
    }
}
