//! # Model Discrepancy Terms
//!
//! A discrepancy (model inadequacy) term is an additive correction to the
//! derivative of each compartment. The correction is calibrated against data
//! and represents structural error in the uninflected SEIR-SEI equations.
//!
//! The set of formulations is closed. Each variant owns its parameter count and
//! its right-hand-side contribution, so adding a formulation means adding a
//! variant and both match arms below, nothing else.

use crate::config::PreconditionError;
use serde::{Deserialize, Serialize};

/// Selects which discrepancy term is added to each compartment's derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyFormulation {
    /// No correction. One placeholder slot per species is still reserved so
    /// that parameter files written for this formulation keep their shape.
    None,
    /// `d0 * y_i + d1 * |f_i|` on each compartment.
    Linear,
    /// Linear terms plus `d2 * y_i^2 + d3 * f_i^2`. Slots 4 and 5 of each
    /// block are reserved for hyperparameters and never read.
    LinearQuadratic,
    /// Every compartment couples to every other through four terms per pair.
    ///
    /// Species `i` owns `4 * species_count` slots, one block of four
    /// `δ[4j..4j + 4]` per partner `j`. Seven species take 196 parameters.
    FullQuadraticCrossTerm,
}

impl DiscrepancyFormulation {
    /// Every formulation, in declaration order.
    pub const ALL: [DiscrepancyFormulation; 4] = [
        DiscrepancyFormulation::None,
        DiscrepancyFormulation::Linear,
        DiscrepancyFormulation::LinearQuadratic,
        DiscrepancyFormulation::FullQuadraticCrossTerm,
    ];

    /// Number of parameters attributed to a single species.
    pub fn params_per_species(self, species_count: usize) -> usize {
        match self {
            Self::None => 1,
            Self::Linear => 2,
            Self::LinearQuadratic => 6,
            Self::FullQuadraticCrossTerm => 4 * species_count,
        }
    }

    /// Total length of the parameter vector for `species_count` compartments.
    pub fn param_count(self, species_count: usize) -> usize {
        self.params_per_species(species_count) * species_count
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Linear => "linear",
            Self::LinearQuadratic => "linear-quadratic",
            Self::FullQuadraticCrossTerm => "full quadratic cross-term",
        }
    }
}

/// A validated discrepancy parameter vector, owned by a single evaluation.
///
/// The length invariant `values.len() == params_per_species * species_count`
/// holds for every constructed value; the forward model never sees a vector
/// that violates it.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscrepancyParams {
    formulation: DiscrepancyFormulation,
    species_count: usize,
    values: Vec<f64>,
}

impl DiscrepancyParams {
    pub fn new(
        formulation: DiscrepancyFormulation,
        species_count: usize,
        values: Vec<f64>,
    ) -> Result<Self, PreconditionError> {
        if species_count == 0 {
            return Err(PreconditionError::ZeroSpecies);
        }
        let expected = formulation.param_count(species_count);
        if values.len() != expected {
            return Err(PreconditionError::ParamLengthMismatch {
                formulation,
                expected,
                found: values.len(),
            });
        }
        Ok(Self {
            formulation,
            species_count,
            values,
        })
    }

    /// All-zero parameters, which make every formulation a no-op.
    pub fn zeros(formulation: DiscrepancyFormulation, species_count: usize) -> Self {
        Self {
            formulation,
            species_count,
            values: vec![0.0; formulation.param_count(species_count)],
        }
    }

    pub fn formulation(&self) -> DiscrepancyFormulation {
        self.formulation
    }

    pub fn species_count(&self) -> usize {
        self.species_count
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// The contiguous parameter block attributed to `species`.
    pub fn block(&self, species: usize) -> &[f64] {
        let width = self.formulation.params_per_species(self.species_count);
        &self.values[species * width..(species + 1) * width]
    }

    /// Adds the discrepancy correction to the first `species_count` entries of
    /// `dydt`.
    ///
    /// `pops` holds the zero-floored state and `structural` the unperturbed
    /// structural derivative; both must cover at least `species_count` entries.
    /// Every term reads the unperturbed derivative, so the order in which
    /// compartments are corrected does not matter.
    pub fn add_contribution(&self, pops: &[f64], structural: &[f64], dydt: &mut [f64]) {
        let n = self.species_count;
        match self.formulation {
            DiscrepancyFormulation::None => {}
            DiscrepancyFormulation::Linear => {
                for i in 0..n {
                    let d = self.block(i);
                    dydt[i] += d[0] * pops[i] + d[1] * structural[i].abs();
                }
            }
            DiscrepancyFormulation::LinearQuadratic => {
                for i in 0..n {
                    let d = self.block(i);
                    dydt[i] += d[0] * pops[i]
                        + d[1] * structural[i].abs()
                        + d[2] * pops[i] * pops[i]
                        + d[3] * structural[i] * structural[i];
                }
            }
            DiscrepancyFormulation::FullQuadraticCrossTerm => {
                for i in 0..n {
                    let block = self.block(i);
                    let mut correction = 0.0;
                    for (j, d) in block.chunks_exact(4).enumerate() {
                        correction += d[0] * pops[j]
                            + d[1] * structural[j].abs()
                            + d[2] * pops[j] * pops[j]
                            + d[3] * structural[j] * structural[j];
                    }
                    dydt[i] += correction;
                }
            }
        }
    }
}
