//! Assembled preconditioners: factor once in `update_precon`, apply in
//! `precon`.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use crate::error::SolverError;
use crate::operators::diffusion::SchurComplement;
use crate::solver::{DiagonalSolver, DirectSolver, LinearSolver};

/// How much of the local Jacobian is inverted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreconMode {
    /// The whole `[cells, faces]` matrix.
    Global,
    /// The cell Schur complement, with face back-substitution.
    Schur,
    /// The diagonal only.
    Diagonal,
}

/// A factored approximate Jacobian.
pub struct AssembledPrecon {
    mode: PreconMode,
    solver: Box<dyn LinearSolver>,
    schur: Option<SchurComplement>,
    size: usize,
}

impl std::fmt::Debug for AssembledPrecon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssembledPrecon")
            .field("mode", &self.mode)
            .field("solver", &self.solver.name())
            .field("size", &self.size)
            .finish()
    }
}

impl AssembledPrecon {
    /// An empty preconditioner. [`PreconMode::Diagonal`] uses the Jacobi
    /// solver, the other modes a direct solver.
    pub fn new(mode: PreconMode) -> Self {
        let solver: Box<dyn LinearSolver> = match mode {
            PreconMode::Diagonal => Box::new(DiagonalSolver::new()),
            PreconMode::Global | PreconMode::Schur => Box::new(DirectSolver::new()),
        };
        Self {
            mode,
            solver,
            schur: None,
            size: 0,
        }
    }

    /// Use `solver` for the factored system.
    pub fn with_solver(mut self, solver: Box<dyn LinearSolver>) -> Self {
        self.solver = solver;
        self
    }

    /// The configured mode.
    pub fn mode(&self) -> PreconMode {
        self.mode
    }

    /// Factor `a`, a flat `[cells, faces]` matrix with `ncells` cell rows.
    pub fn rebuild(&mut self, a: &DMatrix<f64>, ncells: usize) -> Result<(), SolverError> {
        self.size = a.nrows();
        match self.mode {
            PreconMode::Schur if ncells < a.nrows() => {
                let s = SchurComplement::new(a, ncells);
                self.solver.factor(&s.matrix)?;
                self.schur = Some(s);
            }
            _ => {
                self.solver.factor(a)?;
                self.schur = None;
            }
        }
        trace!(mode = ?self.mode, size = self.size, "preconditioner rebuilt");
        Ok(())
    }

    /// Apply the approximate inverse to `r`.
    pub fn apply(&self, r: &DVector<f64>) -> Result<DVector<f64>, SolverError> {
        if r.len() != self.size {
            return Err(SolverError::DimensionMismatch {
                expected: self.size,
                got: r.len(),
            });
        }
        match &self.schur {
            Some(s) => {
                let du_c = self.solver.solve(&s.reduce(r))?;
                Ok(s.expand(r, &du_c))
            }
            None => self.solver.solve(r),
        }
    }
}
