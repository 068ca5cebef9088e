//! SEIR-SEI transmission dynamics with an injected discrepancy term.
//!
//! State layout (eight channels):
//!
//! | index | channel |
//! |---|---|
//! | 0-3 | human susceptible, exposed, infectious, recovered |
//! | 4-6 | vector susceptible, exposed, infectious |
//! | 7 | cumulative human incidence `C` |
//!
//! Vector compartments are fractions of a population normalised to `n_v`.

use crate::discrepancy::DiscrepancyParams;
use crate::ode::OdeSystem;
use serde::{Deserialize, Serialize};

/// Number of epidemiological compartments, excluding cumulative incidence.
pub const SEIR_SEI_SPECIES: usize = 7;
/// Length of the state vector.
pub const STATE_DIM: usize = SEIR_SEI_SPECIES + 1;

pub const HUMAN_SUSCEPTIBLE: usize = 0;
pub const HUMAN_EXPOSED: usize = 1;
pub const HUMAN_INFECTIOUS: usize = 2;
pub const HUMAN_RECOVERED: usize = 3;
pub const VECTOR_SUSCEPTIBLE: usize = 4;
pub const VECTOR_EXPOSED: usize = 5;
pub const VECTOR_INFECTIOUS: usize = 6;
pub const CUMULATIVE_INCIDENCE: usize = 7;

/// Channel labels in state order, used for output headers.
pub const CHANNEL_NAMES: [&str; STATE_DIM] = ["S_h", "E_h", "I_h", "R_h", "S_v", "E_v", "I_v", "C"];

/// Disease-rate constants (per day) and population sizes. These are fixed
/// for a run, not calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiseaseRates {
    /// Human infection rate.
    pub beta_h: f64,
    /// Human incubation rate.
    pub alpha_h: f64,
    /// Human recovery rate.
    pub gamma: f64,
    /// Vector birth and mortality rate.
    pub delta: f64,
    /// Vector infection rate.
    pub beta_v: f64,
    /// Vector incubation rate.
    pub alpha_v: f64,
    pub n_h: f64,
    pub n_v: f64,
}

impl Default for DiseaseRates {
    fn default() -> Self {
        Self {
            beta_h: 1.0 / 11.3,
            alpha_h: 1.0 / 5.9,
            gamma: 1.0 / 7.9,
            delta: 1.0 / 11.0,
            beta_v: 1.0 / 8.6,
            alpha_v: 1.0 / 9.1,
            n_h: 206.0e6,
            n_v: 1.0,
        }
    }
}

impl DiseaseRates {
    /// The uninflected SEIR-SEI derivative at the (already floored) state.
    pub fn structural_derivative(&self, pops: &[f64; STATE_DIM]) -> [f64; STATE_DIM] {
        let human_infection = self.beta_h * pops[HUMAN_SUSCEPTIBLE] * pops[VECTOR_INFECTIOUS] / self.n_v;
        let vector_infection = self.beta_v * pops[VECTOR_SUSCEPTIBLE] * pops[HUMAN_INFECTIOUS] / self.n_h;
        let human_onset = self.alpha_h * pops[HUMAN_EXPOSED];

        let mut f = [0.0; STATE_DIM];
        f[HUMAN_SUSCEPTIBLE] = -human_infection;
        f[HUMAN_EXPOSED] = human_infection - human_onset;
        f[HUMAN_INFECTIOUS] = human_onset - self.gamma * pops[HUMAN_INFECTIOUS];
        f[HUMAN_RECOVERED] = self.gamma * pops[HUMAN_INFECTIOUS];
        f[VECTOR_SUSCEPTIBLE] =
            self.delta * self.n_v - vector_infection - self.delta * pops[VECTOR_SUSCEPTIBLE];
        f[VECTOR_EXPOSED] = vector_infection - (self.alpha_v + self.delta) * pops[VECTOR_EXPOSED];
        f[VECTOR_INFECTIOUS] =
            self.alpha_v * pops[VECTOR_EXPOSED] - self.delta * pops[VECTOR_INFECTIOUS];
        f[CUMULATIVE_INCIDENCE] = human_onset;
        f
    }
}

/// Negative populations are read as empty compartments. This only shields
/// the right-hand side from integrator overshoot; the stored trajectory is
/// left as the integrator produced it.
pub fn floor_at_zero(y: &[f64]) -> [f64; STATE_DIM] {
    let mut pops = [0.0; STATE_DIM];
    for (p, &v) in pops.iter_mut().zip(y) {
        *p = v.max(0.0);
    }
    pops
}

/// The SEIR-SEI system for one parameter draw.
pub struct SeirSei<'a> {
    rates: &'a DiseaseRates,
    params: &'a DiscrepancyParams,
}

impl<'a> SeirSei<'a> {
    /// `params` must describe exactly [`SEIR_SEI_SPECIES`] species; the
    /// forward model checks this before building the system.
    pub fn new(rates: &'a DiseaseRates, params: &'a DiscrepancyParams) -> Self {
        Self { rates, params }
    }
}

impl OdeSystem for SeirSei<'_> {
    fn dim(&self) -> usize {
        STATE_DIM
    }

    fn derivative(&self, y: &[f64], dydt: &mut [f64]) {
        let pops = floor_at_zero(y);
        let structural = self.rates.structural_derivative(&pops);
        dydt.copy_from_slice(&structural);
        // The incidence channel sits past the last species and is never corrected.
        self.params.add_contribution(&pops, &structural, dydt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discrepancy::DiscrepancyFormulation;
    use approx::assert_relative_eq;

    fn mid_epidemic_state() -> [f64; STATE_DIM] {
        [2.0e8, 3.0e5, 2.5e5, 5.0e6, 0.97, 0.02, 0.01, 6.0e5]
    }

    #[test]
    fn human_derivatives_sum_to_zero() {
        let rates = DiseaseRates::default();
        let f = rates.structural_derivative(&mid_epidemic_state());
        let human_total: f64 = f[..4].iter().sum();
        assert_relative_eq!(human_total, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn vector_population_is_stationary_at_full_size() {
        let rates = DiseaseRates::default();
        let f = rates.structural_derivative(&mid_epidemic_state());
        let vector_total: f64 = f[4..7].iter().sum();
        // d(S+E+I)/dt = delta * (n_v - (S+E+I)), and S+E+I = n_v here.
        assert_relative_eq!(vector_total, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn negative_states_are_floored_before_evaluation() {
        let mut y = mid_epidemic_state();
        y[HUMAN_EXPOSED] = -50.0;
        let pops = floor_at_zero(&y);
        assert_eq!(pops[HUMAN_EXPOSED], 0.0);
        assert_eq!(pops[HUMAN_SUSCEPTIBLE], y[HUMAN_SUSCEPTIBLE]);

        let rates = DiseaseRates::default();
        let params = DiscrepancyParams::zeros(DiscrepancyFormulation::None, SEIR_SEI_SPECIES);
        let system = SeirSei::new(&rates, &params);
        let mut dydt = [0.0; STATE_DIM];
        system.derivative(&y, &mut dydt);
        assert_eq!(dydt[CUMULATIVE_INCIDENCE], 0.0);
    }

    #[test]
    fn discrepancy_never_touches_incidence_channel() {
        let rates = DiseaseRates::default();
        let values = vec![0.05; DiscrepancyFormulation::FullQuadraticCrossTerm.param_count(7)];
        let params =
            DiscrepancyParams::new(DiscrepancyFormulation::FullQuadraticCrossTerm, 7, values)
                .unwrap();
        let system = SeirSei::new(&rates, &params);
        let y = mid_epidemic_state();
        let mut dydt = [0.0; STATE_DIM];
        system.derivative(&y, &mut dydt);
        assert_eq!(dydt[CUMULATIVE_INCIDENCE], rates.alpha_h * y[HUMAN_EXPOSED]);
        assert!(dydt[HUMAN_SUSCEPTIBLE] > 0.0);
    }
}
