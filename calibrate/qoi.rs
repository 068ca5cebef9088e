//! Quantity-of-interest extraction for forward uncertainty propagation.
//!
//! The QoI of a draw is the full multi-channel trajectory at the output
//! times, flattened time-major. Unlike the likelihood there is no penalty
//! value: a failed draw is reported as such, together with whatever part of
//! the trajectory was completed.

use crate::config::PreconditionError;
use crate::forward::{ForwardError, ForwardModel, IntegrationFailure, Trajectory};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QoiError {
    #[error("invalid QoI input: {0}")]
    Precondition(#[from] PreconditionError),
    #[error("integration failed at t = {}: {}", .0.time, .0.reason)]
    Integration(Box<IntegrationFailure>),
    #[error("runaway trajectory: channel {channel} reached {value:e} at t = {time}")]
    Runaway {
        time: f64,
        channel: usize,
        value: f64,
        partial: Box<Trajectory>,
    },
}

impl From<ForwardError> for QoiError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Precondition(e) => Self::Precondition(e),
            ForwardError::Integration(failure) => Self::Integration(failure),
            ForwardError::Runaway {
                time,
                channel,
                value,
                partial,
                ..
            } => Self::Runaway {
                time,
                channel,
                value,
                partial,
            },
        }
    }
}

impl QoiError {
    pub fn partial(&self) -> Option<&Trajectory> {
        match self {
            Self::Precondition(_) => None,
            Self::Integration(failure) => Some(&failure.partial),
            Self::Runaway { partial, .. } => Some(partial),
        }
    }
}

/// A fixed-size QoI sample. Rows the integrator never reached are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct QoiSample {
    pub values: Vec<f64>,
    /// Output rows actually produced, out of `time_step_count`.
    pub completed_rows: usize,
}

impl QoiSample {
    pub fn is_complete(&self, time_step_count: usize) -> bool {
        self.completed_rows == time_step_count
    }
}

#[derive(Debug, Clone)]
pub struct QoiExtractor {
    model: ForwardModel,
    initial: Vec<f64>,
    times: Vec<f64>,
}

impl QoiExtractor {
    pub fn new(
        model: ForwardModel,
        initial: Vec<f64>,
        times: Vec<f64>,
    ) -> Result<Self, PreconditionError> {
        model.validate_inputs(&initial, &times)?;
        Ok(Self {
            model,
            initial,
            times,
        })
    }

    pub fn model(&self) -> &ForwardModel {
        &self.model
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// `time_step_count * (species_count + 1)`.
    pub fn output_len(&self) -> usize {
        self.times.len() * self.model.config().state_dim()
    }

    /// Runs one draw and returns rows 1..=N of the trajectory, row-major.
    pub fn evaluate(&self, param_values: &[f64]) -> Result<Vec<f64>, QoiError> {
        let trajectory = self.trajectory(param_values)?;
        Ok(trajectory.output_rows_flat())
    }

    /// Runs one draw and returns the trajectory including the initial row.
    pub fn trajectory(&self, param_values: &[f64]) -> Result<Trajectory, QoiError> {
        let params = self.model.config().discrepancy_params(param_values)?;
        Ok(self.model.solve(&self.initial, &self.times, &params)?)
    }

    /// Like [`evaluate`](Self::evaluate), but numerical failures still yield
    /// an `output_len()` sample. Precondition violations remain errors.
    pub fn evaluate_or_nan(&self, param_values: &[f64]) -> Result<QoiSample, QoiError> {
        match self.evaluate(param_values) {
            Ok(values) => Ok(QoiSample {
                values,
                completed_rows: self.times.len(),
            }),
            Err(QoiError::Precondition(err)) => Err(QoiError::Precondition(err)),
            Err(err) => {
                let mut values = vec![f64::NAN; self.output_len()];
                let completed_rows = match err.partial() {
                    Some(partial) => {
                        let done = partial.output_rows_flat();
                        values[..done.len()].copy_from_slice(&done);
                        partial.rows().saturating_sub(1)
                    }
                    None => 0,
                };
                log::debug!("QoI draw incomplete after {completed_rows} rows: {err}");
                Ok(QoiSample {
                    values,
                    completed_rows,
                })
            }
        }
    }
}
