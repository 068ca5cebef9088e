//! Run configuration for the forward model.
//!
//! [`ModelConfig`] is the small, immutable description the evaluators work
//! from. [`RunConfig`] is the human-editable TOML document that carries every
//! constant of a calibration run; an empty file yields the reference setup.

use crate::data::InitialConditions;
use crate::discrepancy::{DiscrepancyFormulation, DiscrepancyParams};
use crate::dynamics::{DiseaseRates, SEIR_SEI_SPECIES};
use crate::forward::RunawayGuard;
use crate::ode::IntegratorOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Violations of a calling contract. These are never recovered from: the
/// caller handed the model something it cannot interpret.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreconditionError {
    #[error("species count must be positive")]
    ZeroSpecies,
    #[error("time step count must be positive")]
    ZeroTimeSteps,
    #[error(
        "the SEIR-SEI right-hand side has {expected} compartments, but the configuration declares {found}"
    )]
    UnsupportedSpeciesCount { expected: usize, found: usize },
    #[error(
        "discrepancy parameter vector has {found} entries, but the {formulation:?} formulation needs {expected}"
    )]
    ParamLengthMismatch {
        formulation: DiscrepancyFormulation,
        expected: usize,
        found: usize,
    },
    #[error("parameters were built for the {found:?} formulation, but the model uses {expected:?}")]
    FormulationMismatch {
        expected: DiscrepancyFormulation,
        found: DiscrepancyFormulation,
    },
    #[error("initial state has {found} entries, expected {expected}")]
    StateLengthMismatch { expected: usize, found: usize },
    #[error("initial state entry {index} is not finite ({value})")]
    NonFiniteState { index: usize, value: f64 },
    #[error("no output times were requested")]
    EmptyTimes,
    #[error("expected {expected} output times, found {found}")]
    TimeCountMismatch { expected: usize, found: usize },
    #[error("output time {index} ({current}) does not come after {previous}")]
    NonMonotonicTimes {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("integrator option `{name}` must be finite and positive (found {value})")]
    InvalidIntegratorOption { name: &'static str, value: f64 },
    #[error("observation variance must be finite and positive (found {0})")]
    InvalidVariance(f64),
    #[error("runaway guard watches channel {channel}, but the state has only {dim} entries")]
    GuardChannelOutOfRange { channel: usize, dim: usize },
}

/// Shape of the model and the discrepancy formulation in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    species_count: usize,
    time_step_count: usize,
    formulation: DiscrepancyFormulation,
}

impl ModelConfig {
    pub fn new(
        species_count: usize,
        time_step_count: usize,
        formulation: DiscrepancyFormulation,
    ) -> Result<Self, PreconditionError> {
        if species_count == 0 {
            return Err(PreconditionError::ZeroSpecies);
        }
        if time_step_count == 0 {
            return Err(PreconditionError::ZeroTimeSteps);
        }
        Ok(Self {
            species_count,
            time_step_count,
            formulation,
        })
    }

    pub fn species_count(&self) -> usize {
        self.species_count
    }

    pub fn time_step_count(&self) -> usize {
        self.time_step_count
    }

    pub fn formulation(&self) -> DiscrepancyFormulation {
        self.formulation
    }

    pub fn params_per_species(&self) -> usize {
        self.formulation.params_per_species(self.species_count)
    }

    /// Length of the discrepancy parameter vector.
    pub fn param_count(&self) -> usize {
        self.formulation.param_count(self.species_count)
    }

    /// Compartments plus the cumulative-incidence channel.
    pub fn state_dim(&self) -> usize {
        self.species_count + 1
    }

    /// Validates `values` against this configuration and takes a private copy.
    pub fn discrepancy_params(&self, values: &[f64]) -> Result<DiscrepancyParams, PreconditionError> {
        DiscrepancyParams::new(self.formulation, self.species_count, values.to_vec())
    }

    pub fn zero_params(&self) -> DiscrepancyParams {
        DiscrepancyParams::zeros(self.formulation, self.species_count)
    }
}

/// Observation model constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    /// Variance of the Gaussian error on cumulative case counts.
    pub variance: f64,
    /// Multiplier applied to observed counts and the initial incidence;
    /// `10/9` models 10% under-reporting, `2` models 50%.
    pub reporting_factor: f64,
    /// Time of the initial condition, in days.
    pub start_time: f64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            variance: 25_000_000.0,
            reporting_factor: 1.0,
            start_time: 0.0,
        }
    }
}

/// Every tunable constant of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub species_count: usize,
    pub formulation: DiscrepancyFormulation,
    pub rates: DiseaseRates,
    pub integrator: IntegratorOptions,
    pub observation: ObservationConfig,
    pub initial: InitialConditions,
    pub guard: RunawayGuard,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            species_count: SEIR_SEI_SPECIES,
            formulation: DiscrepancyFormulation::Linear,
            rates: DiseaseRates::default(),
            integrator: IntegratorOptions::default(),
            observation: ObservationConfig::default(),
            initial: InitialConditions::default(),
            guard: RunawayGuard::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

impl RunConfig {
    /// The model shape for a run over `time_step_count` output times.
    pub fn model_config(&self, time_step_count: usize) -> Result<ModelConfig, PreconditionError> {
        ModelConfig::new(self.species_count, time_step_count, self.formulation)
    }

    /// Initial state with the configured reporting factor applied.
    pub fn initial_state(&self) -> Vec<f64> {
        self.initial.state(self.observation.reporting_factor)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::RunawayAction;
    use tempfile::tempdir;

    #[test]
    fn model_config_rejects_empty_shapes() {
        assert_eq!(
            ModelConfig::new(0, 52, DiscrepancyFormulation::Linear),
            Err(PreconditionError::ZeroSpecies)
        );
        assert_eq!(
            ModelConfig::new(7, 0, DiscrepancyFormulation::Linear),
            Err(PreconditionError::ZeroTimeSteps)
        );
    }

    #[test]
    fn derived_sizes() {
        let config = ModelConfig::new(7, 52, DiscrepancyFormulation::LinearQuadratic).unwrap();
        assert_eq!(config.params_per_species(), 6);
        assert_eq!(config.param_count(), 42);
        assert_eq!(config.state_dim(), 8);
        assert!(config.discrepancy_params(&[0.0; 41]).is_err());
        assert_eq!(config.discrepancy_params(&[0.0; 42]).unwrap(), config.zero_params());
    }

    #[test]
    fn empty_document_is_the_reference_run() {
        let config: RunConfig = toml::from_str("").expect("empty TOML parses");
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.species_count, 7);
        assert_eq!(config.observation.variance, 25_000_000.0);
        assert_eq!(config.integrator.abs_tol, 1e-8);
        assert_eq!(config.guard.bound, 3.0e9);
    }

    #[test]
    fn partial_document_overrides_selected_fields() {
        let text = r#"
formulation = "full_quadratic_cross_term"

[observation]
reporting_factor = 2.0

[guard]
action = "abort"
"#;
        let config: RunConfig = toml::from_str(text).unwrap();
        assert_eq!(
            config.formulation,
            DiscrepancyFormulation::FullQuadraticCrossTerm
        );
        assert_eq!(config.observation.reporting_factor, 2.0);
        assert_eq!(config.observation.variance, 25_000_000.0);
        assert_eq!(config.guard.action, RunawayAction::Abort);
        assert_eq!(config.initial_state()[7], 2.0 * 8201.0);
    }

    #[test]
    fn save_then_load_preserves_configuration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let mut config = RunConfig::default();
        config.formulation = DiscrepancyFormulation::None;
        config.integrator.max_steps = 1234;
        config.save(&path).expect("save config");
        let loaded = RunConfig::load(&path).expect("load config");
        assert_eq!(loaded, config);
    }
}
