//! # Gaussian Log-Likelihood of Cumulative Incidence
//!
//! Compares the model's cumulative-incidence channel with observed cumulative
//! case counts under independent Gaussian errors of fixed variance.
//!
//! The evaluator is total over numerical failures: a draw whose integration
//! fails or runs away scores a large finite penalty so a sampler can reject it
//! through the ordinary acceptance test. Only calling-contract violations are
//! returned as errors.

use crate::config::PreconditionError;
use crate::data::ObservedData;
use crate::forward::{ForwardError, ForwardModel};
use std::fmt;
use thiserror::Error;

/// Misfit assigned to a draw whose forward solve did not complete.
pub const FAILURE_MISFIT: f64 = 1_000_000.0;

/// Derivative information a sampler may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivativeKind {
    Gradient,
    DirectionalDerivative,
    Hessian,
}

impl fmt::Display for DerivativeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gradient => "gradient",
            Self::DirectionalDerivative => "directional derivative",
            Self::Hessian => "Hessian",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LikelihoodError {
    #[error("invalid likelihood input: {0}")]
    Precondition(#[from] PreconditionError),
    #[error("the likelihood does not provide a {0}")]
    Unsupported(DerivativeKind),
}

/// Log-likelihood evaluator for one data set and one initial state.
#[derive(Debug, Clone)]
pub struct Likelihood {
    model: ForwardModel,
    initial: Vec<f64>,
    observed: ObservedData,
    variance: f64,
}

impl Likelihood {
    /// Checks every input that does not depend on the parameter draw, so that
    /// `evaluate` can only fail on the draw itself.
    pub fn new(
        model: ForwardModel,
        initial: Vec<f64>,
        observed: ObservedData,
        variance: f64,
    ) -> Result<Self, PreconditionError> {
        if !(variance.is_finite() && variance > 0.0) {
            return Err(PreconditionError::InvalidVariance(variance));
        }
        model.validate_inputs(&initial, observed.times())?;
        Ok(Self {
            model,
            initial,
            observed,
            variance,
        })
    }

    pub fn model(&self) -> &ForwardModel {
        &self.model
    }

    pub fn observed(&self) -> &ObservedData {
        &self.observed
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// Sum of squared residuals over the variance, or [`FAILURE_MISFIT`] when
    /// the forward solve fails.
    pub fn misfit(&self, param_values: &[f64]) -> Result<f64, LikelihoodError> {
        let params = self.model.config().discrepancy_params(param_values)?;
        match self
            .model
            .solve(&self.initial, self.observed.times(), &params)
        {
            Ok(trajectory) => {
                let simulated = trajectory.cumulative_incidence();
                let misfit = simulated
                    .iter()
                    .skip(1)
                    .zip(self.observed.cumulative_cases())
                    .map(|(c, observed)| {
                        let diff = c - observed;
                        diff * diff / self.variance
                    })
                    .sum();
                Ok(misfit)
            }
            Err(ForwardError::Precondition(err)) => Err(err.into()),
            Err(err) => {
                log::debug!("penalising parameter draw: {err}");
                Ok(FAILURE_MISFIT)
            }
        }
    }

    /// `-0.5 * misfit`.
    pub fn evaluate(&self, param_values: &[f64]) -> Result<f64, LikelihoodError> {
        Ok(-0.5 * self.misfit(param_values)?)
    }

    /// The likelihood is not differentiated. Arguments are accepted for
    /// parity with [`Likelihood::evaluate`] and ignored.
    pub fn gradient(&self, param_values: &[f64]) -> Result<Vec<f64>, LikelihoodError> {
        let _ = param_values;
        Err(LikelihoodError::Unsupported(DerivativeKind::Gradient))
    }

    /// Unsupported, like [`Likelihood::gradient`]; both arguments are ignored.
    pub fn directional_derivative(
        &self,
        param_values: &[f64],
        direction: &[f64],
    ) -> Result<f64, LikelihoodError> {
        let _ = (param_values, direction);
        Err(LikelihoodError::Unsupported(
            DerivativeKind::DirectionalDerivative,
        ))
    }

    /// Unsupported; the argument is ignored.
    pub fn hessian(&self, param_values: &[f64]) -> Result<Vec<Vec<f64>>, LikelihoodError> {
        let _ = param_values;
        Err(LikelihoodError::Unsupported(DerivativeKind::Hessian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::InitialConditions;
    use crate::discrepancy::DiscrepancyFormulation;
    use crate::forward::{RunawayAction, RunawayGuard};
    use crate::ode::IntegratorOptions;
    use approx::assert_relative_eq;

    fn setup(weeks: usize) -> (ForwardModel, Vec<f64>, Vec<f64>) {
        let config = ModelConfig::new(7, weeks, DiscrepancyFormulation::Linear).unwrap();
        let model = ForwardModel::new(config).unwrap();
        let initial = InitialConditions::default().state(1.0);
        let times = (1..=weeks).map(|w| 7.0 * w as f64).collect();
        (model, initial, times)
    }

    #[test]
    fn perfect_data_has_zero_misfit() {
        let (model, initial, times) = setup(6);
        let params = model.config().zero_params();
        let trajectory = model.solve(&initial, &times, &params).unwrap();
        let cases = trajectory.cumulative_incidence().iter().skip(1).copied().collect();
        let observed = ObservedData::new(times, cases).unwrap();
        let likelihood = Likelihood::new(model, initial, observed, 25.0e6).unwrap();
        assert_eq!(likelihood.evaluate(&[0.0; 14]).unwrap(), 0.0);
    }

    #[test]
    fn misfit_scales_with_inverse_variance() {
        let (model, initial, times) = setup(4);
        let params = model.config().zero_params();
        let trajectory = model.solve(&initial, &times, &params).unwrap();
        // Every observation sits 5000 cases below the model.
        let cases: Vec<f64> = trajectory
            .cumulative_incidence()
            .iter()
            .skip(1)
            .map(|c| c - 5000.0)
            .collect();
        let observed = ObservedData::new(times, cases).unwrap();
        let likelihood = Likelihood::new(model, initial, observed, 25.0e6).unwrap();
        assert_relative_eq!(
            likelihood.evaluate(&[0.0; 14]).unwrap(),
            -0.5 * 4.0 * 1.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn wrong_parameter_length_is_an_error_not_a_penalty() {
        let (model, initial, times) = setup(2);
        let observed = ObservedData::new(times, vec![8201.0, 8300.0]).unwrap();
        let likelihood = Likelihood::new(model, initial, observed, 25.0e6).unwrap();
        assert!(matches!(
            likelihood.evaluate(&[0.0; 13]),
            Err(LikelihoodError::Precondition(
                PreconditionError::ParamLengthMismatch {
                    expected: 14,
                    found: 13,
                    ..
                }
            ))
        ));
    }

    #[test]
    fn solver_failure_scores_the_fixed_penalty() {
        let (model, initial, times) = setup(3);
        let model = model
            .with_options(IntegratorOptions {
                max_steps: 3,
                ..IntegratorOptions::default()
            })
            .unwrap();
        let observed = ObservedData::new(times, vec![1.0, 2.0, 3.0]).unwrap();
        let likelihood = Likelihood::new(model, initial, observed, 25.0e6).unwrap();
        assert_eq!(likelihood.evaluate(&[0.0; 14]).unwrap(), -500_000.0);
    }

    #[test]
    fn runaway_abort_scores_the_fixed_penalty() {
        let (model, initial, times) = setup(20);
        let model = model
            .with_guard(RunawayGuard {
                bound: 10_000.0,
                action: RunawayAction::Abort,
                ..RunawayGuard::default()
            })
            .unwrap();
        let cases = vec![8201.0; 20];
        let observed = ObservedData::new(times, cases).unwrap();
        let likelihood = Likelihood::new(model, initial, observed, 25.0e6).unwrap();
        assert_eq!(likelihood.evaluate(&[0.0; 14]).unwrap(), -500_000.0);
    }

    #[test]
    fn derivatives_are_unsupported() {
        let (model, initial, times) = setup(1);
        let observed = ObservedData::new(times, vec![9000.0]).unwrap();
        let likelihood = Likelihood::new(model, initial, observed, 25.0e6).unwrap();
        let params = [0.0; 14];
        assert_eq!(
            likelihood.gradient(&params),
            Err(LikelihoodError::Unsupported(DerivativeKind::Gradient))
        );
        assert_eq!(
            likelihood.directional_derivative(&params, &params),
            Err(LikelihoodError::Unsupported(
                DerivativeKind::DirectionalDerivative
            ))
        );
        assert_eq!(
            likelihood.hessian(&params),
            Err(LikelihoodError::Unsupported(DerivativeKind::Hessian))
        );
    }

    #[test]
    fn invalid_variance_is_rejected() {
        let (model, initial, times) = setup(1);
        let observed = ObservedData::new(times, vec![9000.0]).unwrap();
        assert_eq!(
            Likelihood::new(model, initial, observed, 0.0).unwrap_err(),
            PreconditionError::InvalidVariance(0.0)
        );
    }
}
