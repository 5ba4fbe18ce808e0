//! Error and outcome types for process kernels and time integration.
//!
//! Two channels: [`KernelError`] is fatal and propagates with `?`;
//! [`StepOutcome::Failed`] is a recoverable numerical failure that the
//! [`TimestepController`](crate::controller::TimestepController) answers
//! with a smaller step.

use std::error::Error;
use std::fmt;

use hydrograph_core::{ConfigError, StateError};
use hydrograph_mesh::MeshError;

// ── SolverError ────────────────────────────────────────────────────

/// Failures of the linear-solve collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum SolverError {
    /// The matrix has no inverse.
    Singular {
        /// Dimension of the matrix.
        size: usize,
    },
    /// A vector or matrix does not match the factored system.
    DimensionMismatch {
        /// Expected length.
        expected: usize,
        /// Length received.
        got: usize,
    },
    /// [`solve`](crate::solver::LinearSolver::solve) was called before
    /// [`factor`](crate::solver::LinearSolver::factor).
    NotFactored,
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Singular { size } => write!(f, "{size}x{size} system is singular"),
            Self::DimensionMismatch { expected, got } => {
                write!(f, "expected a vector of length {expected}, got {got}")
            }
            Self::NotFactored => write!(f, "solve called before factor"),
        }
    }
}

impl Error for SolverError {}

// ── KernelError ────────────────────────────────────────────────────

/// Fatal errors from kernels, couplers and the integrator.
#[derive(Debug)]
pub enum KernelError {
    /// The state store rejected an operation.
    State(StateError),
    /// Invalid or conflicting configuration.
    Config(ConfigError),
    /// A mesh query failed.
    Mesh(MeshError),
    /// The linear solver failed outside a Newton iteration.
    Solver(SolverError),
    /// The controller cut the step below its floor.
    TimestepTooSmall {
        /// The step size that was rejected.
        dt: f64,
        /// Configured minimum.
        min: f64,
    },
    /// Too many consecutive step failures.
    TooManyFailures {
        /// Number of consecutive failures.
        count: u32,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(e) => write!(f, "state error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Mesh(e) => write!(f, "mesh error: {e}"),
            Self::Solver(e) => write!(f, "linear solver error: {e}"),
            Self::TimestepTooSmall { dt, min } => {
                write!(f, "timestep {dt:e} fell below the minimum {min:e}")
            }
            Self::TooManyFailures { count } => {
                write!(f, "{count} consecutive step failures")
            }
        }
    }
}

impl Error for KernelError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::State(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Mesh(e) => Some(e),
            Self::Solver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StateError> for KernelError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Config(c) => Self::Config(c),
            other => Self::State(other),
        }
    }
}

impl From<ConfigError> for KernelError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<MeshError> for KernelError {
    fn from(e: MeshError) -> Self {
        Self::Mesh(e)
    }
}

impl From<SolverError> for KernelError {
    fn from(e: SolverError) -> Self {
        Self::Solver(e)
    }
}

// ── Step outcomes ──────────────────────────────────────────────────

/// Why a nonlinear step was rejected.
#[derive(Clone, Debug, PartialEq)]
pub enum StepFailure {
    /// The error norm stayed above tolerance or grew.
    Diverged {
        /// Iterations performed.
        iterations: u32,
        /// Error norm at the last iteration.
        enorm: f64,
    },
    /// The trial solution failed the admissibility gate.
    Inadmissible {
        /// Iteration at which the trial was rejected.
        iteration: u32,
    },
    /// Applying the preconditioner failed.
    LinearSolve {
        /// Description from the solver.
        reason: String,
    },
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diverged { iterations, enorm } => {
                write!(f, "diverged after {iterations} iterations (enorm {enorm:e})")
            }
            Self::Inadmissible { iteration } => {
                write!(f, "inadmissible solution at iteration {iteration}")
            }
            Self::LinearSolve { reason } => write!(f, "linear solve failed: {reason}"),
        }
    }
}

/// Result of one attempted time step.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// The step met the nonlinear tolerance.
    Converged {
        /// Newton updates applied.
        iterations: u32,
        /// Final error norm.
        enorm: f64,
    },
    /// The step must be retried with a smaller `dt`.
    Failed(StepFailure),
}

impl StepOutcome {
    /// Whether the step converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrograph_core::KeyTag;

    #[test]
    fn config_inside_state_error_is_unwrapped() {
        let err: KernelError = StateError::Config(ConfigError::Conflict {
            reason: "both".into(),
        })
        .into();
        assert!(matches!(err, KernelError::Config(ConfigError::Conflict { .. })));
    }

    #[test]
    fn state_error_is_source() {
        let err: KernelError = StateError::UnknownField {
            field: KeyTag::new("pressure", hydrograph_core::Tag::NEXT),
        }
        .into();
        assert!(err.source().is_some());
        assert!(err.to_string().contains("pressure"));
    }

    #[test]
    fn failure_display() {
        let f = StepFailure::Inadmissible { iteration: 2 };
        assert_eq!(f.to_string(), "inadmissible solution at iteration 2");
    }
}
