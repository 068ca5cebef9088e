//! # Forward Model
//!
//! Integrates the SEIR-SEI system with a given discrepancy draw from an
//! initial state across a sequence of output times and returns the dense
//! trajectory.
//!
//! Failures are never swallowed here. A solver failure or an aborted
//! runaway comes back as a [`ForwardError`] carrying the failing time, the
//! last accepted state and the rows completed so far; the likelihood and QoI
//! layers decide what to do with it.

use crate::config::{ModelConfig, PreconditionError};
use crate::discrepancy::DiscrepancyParams;
use crate::dynamics::{CUMULATIVE_INCIDENCE, DiseaseRates, SEIR_SEI_SPECIES, SeirSei};
use crate::ode::{IntegratorOptions, Rkf45Driver, StepFailure};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What to do when the guarded channel crosses its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunawayAction {
    /// Keep integrating silently.
    Ignore,
    /// Keep integrating, log once per trajectory.
    #[default]
    Warn,
    /// Stop and report [`ForwardError::Runaway`].
    Abort,
}

/// Sanity bound on one state channel, checked after every accepted step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunawayGuard {
    pub channel: usize,
    pub bound: f64,
    pub action: RunawayAction,
}

impl Default for RunawayGuard {
    fn default() -> Self {
        Self {
            channel: CUMULATIVE_INCIDENCE,
            bound: 3.0e9,
            action: RunawayAction::Warn,
        }
    }
}

impl RunawayGuard {
    /// The offending value when the watched channel is above the bound.
    pub fn exceeded(&self, state: &[f64]) -> Option<f64> {
        state
            .get(self.channel)
            .copied()
            .filter(|&value| value > self.bound)
    }
}

/// Output of one forward solve: `times[k]` pairs with row `k` of `states`.
/// Row 0 is the initial condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    times: Vec<f64>,
    states: Array2<f64>,
}

impl Trajectory {
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> ArrayView2<'_, f64> {
        self.states.view()
    }

    pub fn rows(&self) -> usize {
        self.states.nrows()
    }

    pub fn dim(&self) -> usize {
        self.states.ncols()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.states.row(index)
    }

    pub fn channel(&self, channel: usize) -> ArrayView1<'_, f64> {
        self.states.column(channel)
    }

    /// The last channel, cumulative human incidence.
    pub fn cumulative_incidence(&self) -> ArrayView1<'_, f64> {
        self.states.column(self.states.ncols() - 1)
    }

    /// Rows after the initial condition, flattened time-major.
    pub fn output_rows_flat(&self) -> Vec<f64> {
        self.states.slice(s![1.., ..]).iter().copied().collect()
    }
}

/// Diagnostic payload of a failed integration.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationFailure {
    /// Time of the last accepted step.
    pub time: f64,
    /// State at `time`.
    pub last_state: Vec<f64>,
    pub reason: StepFailure,
    /// Rows completed before the failure, initial condition included.
    pub partial: Trajectory,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForwardError {
    #[error("invalid forward model input: {0}")]
    Precondition(#[from] PreconditionError),
    #[error("integration failed at t = {}: {}", .0.time, .0.reason)]
    Integration(Box<IntegrationFailure>),
    #[error("channel {channel} reached {value:e} at t = {time}, above the runaway bound {bound:e}")]
    Runaway {
        time: f64,
        channel: usize,
        value: f64,
        bound: f64,
        state: Vec<f64>,
        partial: Box<Trajectory>,
    },
}

impl ForwardError {
    /// Rows completed before a numerical failure. `None` for preconditions.
    pub fn partial(&self) -> Option<&Trajectory> {
        match self {
            Self::Precondition(_) => None,
            Self::Integration(failure) => Some(&failure.partial),
            Self::Runaway { partial, .. } => Some(partial),
        }
    }
}

/// The SEIR-SEI forward model with its fixed constants.
///
/// A `ForwardModel` holds no per-evaluation state; `solve` takes `&self` and
/// may run concurrently from any number of threads.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardModel {
    config: ModelConfig,
    rates: DiseaseRates,
    options: IntegratorOptions,
    guard: RunawayGuard,
    start_time: f64,
}

impl ForwardModel {
    pub fn new(config: ModelConfig) -> Result<Self, PreconditionError> {
        if config.species_count() != SEIR_SEI_SPECIES {
            return Err(PreconditionError::UnsupportedSpeciesCount {
                expected: SEIR_SEI_SPECIES,
                found: config.species_count(),
            });
        }
        Ok(Self {
            config,
            rates: DiseaseRates::default(),
            options: IntegratorOptions::default(),
            guard: RunawayGuard::default(),
            start_time: 0.0,
        })
    }

    pub fn with_rates(mut self, rates: DiseaseRates) -> Self {
        self.rates = rates;
        self
    }

    pub fn with_options(mut self, options: IntegratorOptions) -> Result<Self, PreconditionError> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    pub fn with_guard(mut self, guard: RunawayGuard) -> Result<Self, PreconditionError> {
        if guard.channel >= self.config.state_dim() {
            return Err(PreconditionError::GuardChannelOutOfRange {
                channel: guard.channel,
                dim: self.config.state_dim(),
            });
        }
        self.guard = guard;
        Ok(self)
    }

    /// Time of the initial condition (default 0).
    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn rates(&self) -> &DiseaseRates {
        &self.rates
    }

    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    pub fn guard(&self) -> &RunawayGuard {
        &self.guard
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Checks the inputs of a solve without integrating.
    pub fn validate_inputs(&self, initial: &[f64], times: &[f64]) -> Result<(), PreconditionError> {
        let dim = self.config.state_dim();
        if initial.len() != dim {
            return Err(PreconditionError::StateLengthMismatch {
                expected: dim,
                found: initial.len(),
            });
        }
        if let Some((index, &value)) = initial.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(PreconditionError::NonFiniteState { index, value });
        }
        if times.is_empty() {
            return Err(PreconditionError::EmptyTimes);
        }
        if times.len() != self.config.time_step_count() {
            return Err(PreconditionError::TimeCountMismatch {
                expected: self.config.time_step_count(),
                found: times.len(),
            });
        }
        let mut previous = self.start_time;
        for (index, &current) in times.iter().enumerate() {
            // Written so that NaN times fail the check.
            if !(current > previous) || !current.is_finite() {
                return Err(PreconditionError::NonMonotonicTimes {
                    index,
                    previous,
                    current,
                });
            }
            previous = current;
        }
        Ok(())
    }

    /// Integrates from `initial` at the start time through every entry of
    /// `times`, returning `times.len() + 1` rows.
    pub fn solve(
        &self,
        initial: &[f64],
        times: &[f64],
        params: &DiscrepancyParams,
    ) -> Result<Trajectory, ForwardError> {
        if params.formulation() != self.config.formulation() {
            return Err(PreconditionError::FormulationMismatch {
                expected: self.config.formulation(),
                found: params.formulation(),
            }
            .into());
        }
        if params.values().len() != self.config.param_count() {
            return Err(PreconditionError::ParamLengthMismatch {
                formulation: params.formulation(),
                expected: self.config.param_count(),
                found: params.values().len(),
            }
            .into());
        }
        self.validate_inputs(initial, times)?;

        let mut all_times = Vec::with_capacity(times.len() + 1);
        all_times.push(self.start_time);
        all_times.extend_from_slice(times);

        let dim = self.config.state_dim();
        let mut states = Array2::<f64>::zeros((times.len() + 1, dim));
        states.row_mut(0).assign(&ArrayView1::from(initial));

        let system = SeirSei::new(&self.rates, params);
        let mut driver = Rkf45Driver::new(&system, &self.options);
        let mut y = initial.to_vec();
        let mut t = self.start_time;
        let mut warned = false;

        for (k, &target) in times.iter().enumerate() {
            while t < target {
                if let Err(reason) = driver.step_toward(&mut t, target, &mut y) {
                    log::debug!("integration stopped at t = {t}: {reason}");
                    return Err(ForwardError::Integration(Box::new(IntegrationFailure {
                        time: t,
                        last_state: y,
                        reason,
                        partial: truncated(&all_times, &states, k + 1),
                    })));
                }
                if let Some(value) = self.guard.exceeded(&y) {
                    match self.guard.action {
                        RunawayAction::Ignore => {}
                        RunawayAction::Warn => {
                            if !warned {
                                log::warn!(
                                    "channel {} reached {:e} at t = {:.3}, above the runaway bound {:e}",
                                    self.guard.channel,
                                    value,
                                    t,
                                    self.guard.bound
                                );
                                warned = true;
                            }
                        }
                        RunawayAction::Abort => {
                            return Err(ForwardError::Runaway {
                                time: t,
                                channel: self.guard.channel,
                                value,
                                bound: self.guard.bound,
                                state: y,
                                partial: Box::new(truncated(&all_times, &states, k + 1)),
                            });
                        }
                    }
                }
            }
            states.row_mut(k + 1).assign(&ArrayView1::from(&y[..]));
        }

        log::trace!(
            "forward solve finished: {} output times, {} step attempts",
            times.len(),
            driver.attempts()
        );
        Ok(Trajectory {
            times: all_times,
            states,
        })
    }
}

fn truncated(times: &[f64], states: &Array2<f64>, rows: usize) -> Trajectory {
    Trajectory {
        times: times[..rows].to_vec(),
        states: states.slice_axis(Axis(0), (0..rows).into()).to_owned(),
    }
}
