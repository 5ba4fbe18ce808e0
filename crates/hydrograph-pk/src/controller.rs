//! Step-size control around the [`Bdf1Integrator`].
//!
//! The controller owns the `previous`/`next` bookkeeping of the store:
//! it stamps both times before a step, commits `next` into `previous`
//! after a converged step and restores `next` from `previous` after a
//! failed one.

use hydrograph_core::{ConfigError, ParameterList, Tag};
use hydrograph_state::StateStore;
use serde::Deserialize;
use tracing::{info, warn};

use crate::bdf::Bdf1Integrator;
use crate::error::{KernelError, StepOutcome};
use crate::kernel::ProcessKernel;

/// Step-size options.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimestepConfig {
    /// First step attempted. Default: 1.0.
    #[serde(rename = "initial timestep")]
    pub initial: f64,
    /// Upper bound. Default: `f64::MAX`.
    #[serde(rename = "max timestep")]
    pub max: f64,
    /// Steps below this are fatal. Default: 1e-10.
    #[serde(rename = "min timestep")]
    pub min: f64,
    /// Growth after an easy step. Default: 1.25.
    #[serde(rename = "timestep increase factor")]
    pub increase_factor: f64,
    /// Cut after a failed or hard step. Default: 0.5.
    #[serde(rename = "timestep reduction factor")]
    pub reduction_factor: f64,
    /// Grow when a step took fewer iterations than this. Default: 5.
    #[serde(rename = "min iterations")]
    pub min_iterations: u32,
    /// Shrink when a step took more iterations than this. Default: 10.
    #[serde(rename = "max iterations")]
    pub max_iterations: u32,
    /// Consecutive failures before giving up. Default: 10.
    #[serde(rename = "max consecutive failures")]
    pub max_consecutive_failures: u32,
}

impl Default for TimestepConfig {
    fn default() -> Self {
        Self {
            initial: 1.0,
            max: f64::MAX,
            min: 1e-10,
            increase_factor: 1.25,
            reduction_factor: 0.5,
            min_iterations: 5,
            max_iterations: 10,
            max_consecutive_failures: 10,
        }
    }
}

impl TimestepConfig {
    /// Read and validate the options in `plist`.
    pub fn from_plist(plist: &ParameterList) -> Result<Self, ConfigError> {
        let c: Self = plist.deserialize()?;
        if !(c.min > 0.0 && c.min <= c.initial && c.initial <= c.max) {
            return Err(plist.invalid(
                "initial timestep",
                format!("need 0 < min ({}) <= initial ({}) <= max ({})", c.min, c.initial, c.max),
            ));
        }
        if !(c.increase_factor >= 1.0) {
            return Err(plist.invalid("timestep increase factor", "must be at least 1"));
        }
        if !(c.reduction_factor > 0.0 && c.reduction_factor < 1.0) {
            return Err(plist.invalid("timestep reduction factor", "must lie in (0, 1)"));
        }
        if c.min_iterations > c.max_iterations {
            return Err(ConfigError::Conflict {
                reason: format!(
                    "min iterations ({}) exceeds max iterations ({})",
                    c.min_iterations, c.max_iterations
                ),
            });
        }
        Ok(c)
    }

    /// Step size after a converged step that took `iterations`.
    pub fn adapt(&self, dt: f64, iterations: u32) -> f64 {
        let next = if iterations < self.min_iterations {
            dt * self.increase_factor
        } else if iterations > self.max_iterations {
            dt * self.reduction_factor
        } else {
            dt
        };
        next.clamp(self.min, self.max)
    }
}

/// What [`TimestepController::advance`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AdvanceSummary {
    /// Accepted steps.
    pub steps: u64,
    /// Rejected attempts.
    pub failures: u64,
    /// Time reached.
    pub t: f64,
}

/// Advances a kernel to a target time with adaptive steps.
#[derive(Debug)]
pub struct TimestepController {
    config: TimestepConfig,
    integrator: Bdf1Integrator,
    dt: f64,
}

impl TimestepController {
    /// A controller starting at the configured initial step.
    pub fn new(config: TimestepConfig, integrator: Bdf1Integrator) -> Self {
        let dt = config.initial;
        Self {
            config,
            integrator,
            dt,
        }
    }

    /// Step size the next attempt will use.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// The integrator.
    pub fn integrator(&self) -> &Bdf1Integrator {
        &self.integrator
    }

    /// Advance from the store's `previous` time (0 if unset) to `t_end`.
    ///
    /// The last step is shortened to land on `t_end` without disturbing
    /// the adapted step size.
    pub fn advance(
        &mut self,
        kernel: &mut dyn ProcessKernel,
        store: &mut StateStore,
        t_end: f64,
    ) -> Result<AdvanceSummary, KernelError> {
        let mut t = store.time(&Tag::PREVIOUS).unwrap_or(0.0);
        let mut summary = AdvanceSummary { t, ..AdvanceSummary::default() };
        let mut consecutive = 0u32;
        let eps = 1e-12 * t_end.abs().max(1.0);

        while t_end - t > eps {
            let dt = self.dt.min(t_end - t);
            store.set_time(&Tag::PREVIOUS, t);
            store.set_time(&Tag::NEXT, t + dt);

            match self.integrator.step(kernel, store, t, dt)? {
                StepOutcome::Converged { iterations, .. } => {
                    kernel.commit_state(store, dt)?;
                    store.commit_tag(&Tag::NEXT, &Tag::PREVIOUS)?;
                    store.advance_cycle();
                    t += dt;
                    store.set_time(&Tag::PREVIOUS, t);
                    kernel.calculate_diagnostics(store)?;
                    consecutive = 0;
                    summary.steps += 1;
                    // A step clipped to t_end says little about the next one.
                    if dt == self.dt {
                        self.dt = self.config.adapt(dt, iterations);
                    }
                    info!(kernel = kernel.name(), cycle = store.cycle(), t, dt, iterations, "step accepted");
                }
                StepOutcome::Failed(failure) => {
                    summary.failures += 1;
                    consecutive += 1;
                    store.commit_tag(&Tag::PREVIOUS, &Tag::NEXT)?;
                    let cut = dt * self.config.reduction_factor;
                    warn!(kernel = kernel.name(), t, dt, next_dt = cut, %failure, "step failed, cutting timestep");
                    if consecutive >= self.config.max_consecutive_failures {
                        return Err(KernelError::TooManyFailures { count: consecutive });
                    }
                    if cut < self.config.min {
                        return Err(KernelError::TimestepTooSmall {
                            dt: cut,
                            min: self.config.min,
                        });
                    }
                    self.dt = cut;
                }
            }
        }
        summary.t = t;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapt_follows_iteration_count() {
        let c = TimestepConfig {
            max: 10.0,
            ..TimestepConfig::default()
        };
        assert_eq!(c.adapt(2.0, 1), 2.5);
        assert_eq!(c.adapt(2.0, 7), 2.0);
        assert_eq!(c.adapt(2.0, 11), 1.0);
        assert_eq!(c.adapt(9.0, 0), 10.0);
    }

    #[test]
    fn options_are_read_and_checked() {
        let p = ParameterList::from_json(
            "timestep controller",
            r#"{"initial timestep": 0.1, "min timestep": 1e-4, "max timestep": 100.0}"#,
        )
        .unwrap();
        let c = TimestepConfig::from_plist(&p).unwrap();
        assert_eq!(c.initial, 0.1);
        assert_eq!(c.reduction_factor, 0.5);

        let bad = ParameterList::from_json("tc", r#"{"initial timestep": 1e-12}"#).unwrap();
        assert!(matches!(
            TimestepConfig::from_plist(&bad),
            Err(ConfigError::InvalidValue { .. })
        ));

        let bad = ParameterList::from_json("tc", r#"{"min iterations": 12}"#).unwrap();
        assert!(matches!(TimestepConfig::from_plist(&bad), Err(ConfigError::Conflict { .. })));
    }
}
