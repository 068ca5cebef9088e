//! Batch evaluation of parameter draws.
//!
//! Draws are independent, so a batch is spread over the rayon pool and the
//! results are returned in draw order. Every evaluator is shared by reference
//! across workers; each draw owns its parameters, workspace and trajectory.

use crate::likelihood::{FAILURE_MISFIT, Likelihood, LikelihoodError};
use crate::qoi::{QoiError, QoiExtractor, QoiSample};
use rayon::prelude::*;
use std::time::Instant;

/// Log-likelihood of every draw. `on_done` runs once per finished draw, from
/// whichever worker finished it.
pub fn batch_log_likelihood<P>(
    likelihood: &Likelihood,
    draws: &[Vec<f64>],
    on_done: P,
) -> Result<Vec<f64>, LikelihoodError>
where
    P: Fn() + Sync,
{
    let start = Instant::now();
    let values = draws
        .par_iter()
        .map(|draw| {
            let value = likelihood.evaluate(draw);
            on_done();
            value
        })
        .collect::<Result<Vec<_>, _>>()?;

    let penalised = values
        .iter()
        .filter(|&&v| v == -0.5 * FAILURE_MISFIT)
        .count();
    log::info!(
        "Evaluated {} likelihood draws in {:.2?} ({} penalised)",
        values.len(),
        start.elapsed(),
        penalised
    );
    if penalised > 0 {
        log::warn!("{penalised} of {} draws failed to integrate and were penalised", values.len());
    }
    Ok(values)
}

/// QoI sample of every draw. Failed draws keep their completed rows and are
/// NaN-filled past them.
pub fn batch_qoi<P>(
    extractor: &QoiExtractor,
    draws: &[Vec<f64>],
    on_done: P,
) -> Result<Vec<QoiSample>, QoiError>
where
    P: Fn() + Sync,
{
    let start = Instant::now();
    let samples = draws
        .par_iter()
        .map(|draw| {
            let sample = extractor.evaluate_or_nan(draw);
            on_done();
            sample
        })
        .collect::<Result<Vec<_>, _>>()?;

    let steps = extractor.times().len();
    let incomplete = samples.iter().filter(|s| !s.is_complete(steps)).count();
    log::info!(
        "Propagated {} draws in {:.2?}",
        samples.len(),
        start.elapsed()
    );
    if incomplete > 0 {
        log::warn!("{incomplete} of {} QoI draws stopped early", samples.len());
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::data::{InitialConditions, ObservedData};
    use crate::discrepancy::DiscrepancyFormulation;
    use crate::forward::ForwardModel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn model(weeks: usize) -> ForwardModel {
        let config = ModelConfig::new(7, weeks, DiscrepancyFormulation::Linear).unwrap();
        ForwardModel::new(config).unwrap()
    }

    fn draws() -> Vec<Vec<f64>> {
        (0..6)
            .map(|k| {
                let mut draw = vec![0.0; 14];
                draw[0] = -0.01 * k as f64;
                draw
            })
            .collect()
    }

    #[test]
    fn batch_likelihood_matches_serial_evaluation_in_order() {
        let times: Vec<f64> = (1..=3).map(|w| 7.0 * w as f64).collect();
        let observed = ObservedData::new(times, vec![9000.0, 12000.0, 15000.0]).unwrap();
        let likelihood = Likelihood::new(
            model(3),
            InitialConditions::default().state(1.0),
            observed,
            25.0e6,
        )
        .unwrap();
        let draws = draws();
        let done = AtomicUsize::new(0);
        let batch = batch_log_likelihood(&likelihood, &draws, || {
            done.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(done.load(Ordering::Relaxed), draws.len());
        for (draw, value) in draws.iter().zip(&batch) {
            assert_eq!(*value, likelihood.evaluate(draw).unwrap());
        }
    }

    #[test]
    fn batch_likelihood_stops_on_a_malformed_draw() {
        let times = vec![7.0];
        let observed = ObservedData::new(times, vec![9000.0]).unwrap();
        let likelihood = Likelihood::new(
            model(1),
            InitialConditions::default().state(1.0),
            observed,
            25.0e6,
        )
        .unwrap();
        let mut draws = draws();
        draws[3].pop();
        assert!(batch_log_likelihood(&likelihood, &draws, || {}).is_err());
    }

    #[test]
    fn batch_qoi_keeps_draw_order() {
        let times: Vec<f64> = (1..=2).map(|w| 7.0 * w as f64).collect();
        let extractor =
            QoiExtractor::new(model(2), InitialConditions::default().state(1.0), times).unwrap();
        let draws = draws();
        let samples = batch_qoi(&extractor, &draws, || {}).unwrap();
        assert_eq!(samples.len(), draws.len());
        for (draw, sample) in draws.iter().zip(&samples) {
            assert_eq!(sample.values, extractor.evaluate(draw).unwrap());
        }
    }
}
