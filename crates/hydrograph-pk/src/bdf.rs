//! Backward Euler (BDF1) with a preconditioned Newton-like iteration.
//!
//! The integrator owns no physics. It forms a predictor, then repeats
//! `fun -> enorm -> update_precon -> precon -> u -= du` until the kernel's
//! error norm drops below the tolerance, the trial leaves the admissible
//! set, or the iteration diverges.

use std::collections::VecDeque;

use hydrograph_core::{ConfigError, ParameterList, Tag};
use hydrograph_state::StateStore;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{KernelError, StepFailure, StepOutcome};
use crate::kernel::{KernelState, ProcessKernel};
use crate::tree_vector::TreeVector;

/// Nonlinear-iteration options.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Bdf1Config {
    /// Newton updates allowed per step. Default: 20.
    #[serde(rename = "limit iterations")]
    pub limit_iterations: u32,
    /// Converged when `enorm` falls below this. Default: 1.0.
    #[serde(rename = "nonlinear tolerance")]
    pub nonlinear_tolerance: f64,
    /// Iterations a preconditioner may be reused before rebuilding.
    /// Default: 0, rebuild every iteration.
    #[serde(rename = "max preconditioner lag iterations")]
    pub max_precon_lag: u32,
    /// Extrapolate the predictor from the last two accepted steps.
    /// Default: true.
    #[serde(rename = "extrapolate initial guess")]
    pub extrapolate_initial_guess: bool,
    /// Consecutive iterations with a growing error tolerated. Default: 3.
    #[serde(rename = "max divergent iterations")]
    pub max_divergent_iterations: u32,
    /// Growth of the error over the first iteration's that counts as
    /// divergence. Default: 1e10.
    #[serde(rename = "divergence factor")]
    pub divergence_factor: f64,
}

impl Default for Bdf1Config {
    fn default() -> Self {
        Self {
            limit_iterations: 20,
            nonlinear_tolerance: 1.0,
            max_precon_lag: 0,
            extrapolate_initial_guess: true,
            max_divergent_iterations: 3,
            divergence_factor: 1e10,
        }
    }
}

impl Bdf1Config {
    /// Read and validate the options in `plist`.
    pub fn from_plist(plist: &ParameterList) -> Result<Self, ConfigError> {
        let config: Self = plist.deserialize()?;
        config.validate(plist)?;
        Ok(config)
    }

    fn validate(&self, plist: &ParameterList) -> Result<(), ConfigError> {
        if self.limit_iterations == 0 {
            return Err(plist.invalid("limit iterations", "must be at least 1"));
        }
        if !(self.nonlinear_tolerance > 0.0) {
            return Err(plist.invalid("nonlinear tolerance", "must be positive"));
        }
        if !(self.divergence_factor > 1.0) {
            return Err(plist.invalid("divergence factor", "must exceed 1"));
        }
        Ok(())
    }
}

/// A time-stamped accepted solution.
#[derive(Clone, Debug)]
struct Accepted {
    t: f64,
    u: TreeVector,
}

/// Drives one kernel through implicit steps.
#[derive(Debug)]
pub struct Bdf1Integrator {
    config: Bdf1Config,
    history: VecDeque<Accepted>,
    precon_age: u32,
}

impl Bdf1Integrator {
    /// An integrator with no history.
    pub fn new(config: Bdf1Config) -> Self {
        Self {
            config,
            history: VecDeque::with_capacity(2),
            precon_age: 0,
        }
    }

    /// The options.
    pub fn config(&self) -> &Bdf1Config {
        &self.config
    }

    /// Forget accepted solutions, e.g. after a restart.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    /// Linear extrapolation to `t_new` from the two most recent accepted
    /// solutions, if the newest sits at `t`.
    fn extrapolate(&self, t: f64, t_new: f64) -> Option<TreeVector> {
        if !self.config.extrapolate_initial_guess {
            return None;
        }
        let [a, b] = [self.history.front()?, self.history.back()?];
        let same_time = (b.t - t).abs() <= 1e-12 * t.abs().max(1.0);
        if self.history.len() < 2 || !same_time || b.t <= a.t {
            return None;
        }
        let w = (t_new - b.t) / (b.t - a.t);
        let mut u = b.u.clone();
        // u = (1 + w) b - w a
        u.update(-w, &a.u, 1.0 + w).ok()?;
        Some(u)
    }

    fn accept(&mut self, t: f64, u: TreeVector) {
        if self.history.len() == 2 {
            self.history.pop_front();
        }
        self.history.push_back(Accepted { t, u });
    }

    /// Attempt one step of length `dt` from `t`.
    ///
    /// A step that does not converge is reported as
    /// [`StepOutcome::Failed`]; the store's `next` tag is left at the last
    /// trial. Errors are reserved for problems a smaller step cannot fix.
    pub fn step(
        &mut self,
        kernel: &mut dyn ProcessKernel,
        store: &mut StateStore,
        t: f64,
        dt: f64,
    ) -> Result<StepOutcome, KernelError> {
        if !(dt > 0.0) {
            return Err(KernelError::TimestepTooSmall { dt, min: 0.0 });
        }
        let t_new = t + dt;
        let u_old = kernel.state_to_solution(store, &Tag::PREVIOUS)?;

        kernel.set_state(KernelState::PredictorPending);
        let mut u = match self.extrapolate(t, t_new) {
            Some(u) if kernel.is_admissible(&u) => u,
            Some(_) => {
                debug!(kernel = kernel.name(), "extrapolated predictor inadmissible, using previous solution");
                u_old.clone()
            }
            None => u_old.clone(),
        };
        if kernel.modify_predictor(store, dt, &mut u)? {
            kernel.changed_solution(store)?;
        }

        kernel.set_state(KernelState::Iterating);
        // The first iteration of every step rebuilds.
        self.precon_age = self.config.max_precon_lag + 1;
        let mut r = u.zeros_like();
        let mut du = u.zeros_like();
        let mut first_enorm = None;
        let mut last_enorm = f64::INFINITY;
        let mut divergent = 0;

        for iteration in 0..=self.config.limit_iterations {
            kernel.solution_to_state(store, &u, &Tag::NEXT)?;
            if !kernel.is_admissible(&u) {
                return Ok(self.fail(kernel, StepFailure::Inadmissible { iteration }));
            }
            kernel.fun(store, t, t_new, Some(&u_old), &u, &mut r)?;
            let enorm = kernel.enorm(&u, &r);
            trace!(kernel = kernel.name(), iteration, enorm, "nonlinear iteration");

            if enorm < self.config.nonlinear_tolerance {
                kernel.set_state(KernelState::Converged);
                debug!(kernel = kernel.name(), t = t_new, dt, iterations = iteration, enorm, "step converged");
                self.accept(t_new, u);
                return Ok(StepOutcome::Converged {
                    iterations: iteration,
                    enorm,
                });
            }
            if !enorm.is_finite() {
                return Ok(self.fail(kernel, StepFailure::Diverged { iterations: iteration, enorm }));
            }
            let first = *first_enorm.get_or_insert(enorm);
            if enorm > self.config.divergence_factor * first {
                return Ok(self.fail(kernel, StepFailure::Diverged { iterations: iteration, enorm }));
            }
            divergent = if enorm > last_enorm { divergent + 1 } else { 0 };
            if divergent > self.config.max_divergent_iterations {
                return Ok(self.fail(kernel, StepFailure::Diverged { iterations: iteration, enorm }));
            }
            last_enorm = enorm;
            if iteration == self.config.limit_iterations {
                break;
            }

            if self.precon_age > self.config.max_precon_lag {
                match kernel.update_precon(store, t_new, &u, dt) {
                    Ok(()) => self.precon_age = 0,
                    Err(KernelError::Solver(e)) => {
                        return Ok(self.fail(kernel, StepFailure::LinearSolve { reason: e.to_string() }));
                    }
                    Err(e) => return Err(e),
                }
            }
            self.precon_age += 1;

            if let Err(e) = kernel.precon(&r, &mut du) {
                return Ok(self.fail(kernel, StepFailure::LinearSolve { reason: e.to_string() }));
            }
            u.update(-1.0, &du, 1.0)?;
            kernel.changed_solution(store)?;
        }

        Ok(self.fail(
            kernel,
            StepFailure::Diverged {
                iterations: self.config.limit_iterations,
                enorm: last_enorm,
            },
        ))
    }

    fn fail(&self, kernel: &mut dyn ProcessKernel, failure: StepFailure) -> StepOutcome {
        debug!(kernel = kernel.name(), %failure, "step failed");
        kernel.set_state(KernelState::Failed);
        StepOutcome::Failed(failure)
    }
}
