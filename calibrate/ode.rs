//! # Embedded Runge-Kutta-Fehlberg 4(5) Integrator
//!
//! An explicit adaptive stepper for autonomous systems `dy/dt = f(y)`.
//!
//! - Each attempted step evaluates six stages and forms both a fourth and a
//!   fifth order solution. The fifth-order solution is propagated and the
//!   difference between the two is the local error estimate.
//! - Step control follows the classic "standard control" rule: with
//!   `D_i = atol + rtol * |y_i|` and `r = max_i |err_i| / D_i`, a step is
//!   rejected when `r > 1.1` and the step shrinks by `0.9 * r^(-1/5)` (never
//!   below a fifth); when `r < 0.5` the next step grows by `0.9 * r^(-1/6)`
//!   (never above five times).
//! - There is no maximum step size. The only caps are the attempt budget and
//!   the optional wall-clock budget, which keep a runaway trajectory from
//!   stalling a whole sampling run.
//!
//! The driver never steps past a requested output time, so states at output
//! times are produced by the integrator itself rather than interpolated.

use crate::config::PreconditionError;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Right-hand side of an autonomous ODE system.
pub trait OdeSystem {
    /// Number of state variables.
    fn dim(&self) -> usize;

    /// Writes `f(y)` into `dydt`. Both slices have length `dim()`.
    fn derivative(&self, y: &[f64], dydt: &mut [f64]);
}

/// Tolerances and budgets for the adaptive driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorOptions {
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub initial_step: f64,
    /// Proposed steps below this size are treated as a solver failure.
    pub min_step: f64,
    /// Maximum number of attempted steps (accepted or rejected) per solve.
    pub max_steps: usize,
    /// Optional wall-clock budget per solve, in seconds.
    pub max_wall_seconds: Option<f64>,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            abs_tol: 1e-8,
            rel_tol: 1e-8,
            initial_step: 1e-10,
            min_step: 1e-14,
            max_steps: 1_000_000,
            max_wall_seconds: None,
        }
    }
}

impl IntegratorOptions {
    pub fn validate(&self) -> Result<(), PreconditionError> {
        let checks = [
            ("abs_tol", self.abs_tol),
            ("rel_tol", self.rel_tol),
            ("initial_step", self.initial_step),
            ("min_step", self.min_step),
            ("max_steps", self.max_steps as f64),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value <= 0.0 {
                return Err(PreconditionError::InvalidIntegratorOption { name, value });
            }
        }
        if let Some(seconds) = self.max_wall_seconds {
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(PreconditionError::InvalidIntegratorOption {
                    name: "max_wall_seconds",
                    value: seconds,
                });
            }
        }
        Ok(())
    }
}

/// Why the driver gave up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepFailure {
    #[error("step size {step:e} fell below the minimum usable step")]
    StepSizeUnderflow { step: f64 },
    #[error("the right-hand side produced a non-finite derivative")]
    NonFiniteDerivative,
    #[error("step budget of {steps} attempts exhausted")]
    StepBudgetExhausted { steps: usize },
    #[error("wall-clock budget exceeded after {elapsed_seconds:.3} s")]
    WallClockExceeded { elapsed_seconds: f64 },
}

// Fehlberg tableau.
const A21: f64 = 1.0 / 4.0;
const A31: f64 = 3.0 / 32.0;
const A32: f64 = 9.0 / 32.0;
const A41: f64 = 1932.0 / 2197.0;
const A42: f64 = -7200.0 / 2197.0;
const A43: f64 = 7296.0 / 2197.0;
const A51: f64 = 439.0 / 216.0;
const A52: f64 = -8.0;
const A53: f64 = 3680.0 / 513.0;
const A54: f64 = -845.0 / 4104.0;
const A61: f64 = -8.0 / 27.0;
const A62: f64 = 2.0;
const A63: f64 = -3544.0 / 2565.0;
const A64: f64 = 1859.0 / 4104.0;
const A65: f64 = -11.0 / 40.0;

// Fifth-order weights.
const B1: f64 = 16.0 / 135.0;
const B3: f64 = 6656.0 / 12825.0;
const B4: f64 = 28561.0 / 56430.0;
const B5: f64 = -9.0 / 50.0;
const B6: f64 = 2.0 / 55.0;

// Fifth minus fourth order weights.
const E1: f64 = 1.0 / 360.0;
const E3: f64 = -128.0 / 4275.0;
const E4: f64 = -2197.0 / 75240.0;
const E5: f64 = 1.0 / 50.0;
const E6: f64 = 2.0 / 55.0;

const SAFETY: f64 = 0.9;
const ORDER: f64 = 5.0;
const REJECT_RATIO: f64 = 1.1;
const GROW_RATIO: f64 = 0.5;
const MAX_SHRINK: f64 = 0.2;
const MAX_GROWTH: f64 = 5.0;

/// Stage buffers, sized once per solve.
struct Workspace {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    ytmp: Vec<f64>,
    ynew: Vec<f64>,
}

impl Workspace {
    fn new(n: usize) -> Self {
        Self {
            k1: vec![0.0; n],
            k2: vec![0.0; n],
            k3: vec![0.0; n],
            k4: vec![0.0; n],
            k5: vec![0.0; n],
            k6: vec![0.0; n],
            ytmp: vec![0.0; n],
            ynew: vec![0.0; n],
        }
    }
}

/// Adaptive RKF45 driver for one integration.
///
/// The driver remembers its step size between calls, so a trajectory split
/// over many output times pays the step-size ramp-up only once.
pub struct Rkf45Driver<'a, S: OdeSystem> {
    system: &'a S,
    options: &'a IntegratorOptions,
    workspace: Workspace,
    step: f64,
    attempts: usize,
    started: Instant,
}

impl<'a, S: OdeSystem> Rkf45Driver<'a, S> {
    /// `options` are expected to have passed [`IntegratorOptions::validate`].
    pub fn new(system: &'a S, options: &'a IntegratorOptions) -> Self {
        Self {
            system,
            options,
            workspace: Workspace::new(system.dim()),
            step: options.initial_step,
            attempts: 0,
            started: Instant::now(),
        }
    }

    /// Step attempts made so far, rejected ones included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Takes one accepted step from `*t` towards `target`, retrying with
    /// smaller steps as long as the error estimate rejects them.
    ///
    /// On success `*t` and `y` hold the new point; the step ends exactly on
    /// `target` when it would otherwise overshoot. On failure both are left
    /// at the last accepted point.
    pub fn step_toward(&mut self, t: &mut f64, target: f64, y: &mut [f64]) -> Result<(), StepFailure> {
        if *t >= target {
            return Ok(());
        }
        let ws = &mut self.workspace;
        self.system.derivative(y, &mut ws.k1);
        if ws.k1.iter().any(|v| !v.is_finite()) {
            return Err(StepFailure::NonFiniteDerivative);
        }

        loop {
            if self.attempts >= self.options.max_steps {
                return Err(StepFailure::StepBudgetExhausted {
                    steps: self.attempts,
                });
            }
            if let Some(limit) = self.options.max_wall_seconds {
                let elapsed_seconds = self.started.elapsed().as_secs_f64();
                if elapsed_seconds > limit {
                    return Err(StepFailure::WallClockExceeded { elapsed_seconds });
                }
            }

            let remaining = target - *t;
            let clamped = self.step >= remaining;
            let h = if clamped { remaining } else { self.step };
            if self.step < self.options.min_step || *t + h == *t {
                return Err(StepFailure::StepSizeUnderflow { step: self.step });
            }

            self.attempts += 1;
            let ratio = trial_step(self.system, ws, y, h, self.options);

            if !ratio.is_finite() || ratio > REJECT_RATIO {
                // A non-finite trial is an overly ambitious step, not yet a failure.
                let factor = if ratio.is_finite() {
                    (SAFETY / ratio.powf(1.0 / ORDER)).max(MAX_SHRINK)
                } else {
                    MAX_SHRINK
                };
                self.step = h * factor;
                continue;
            }

            *t = if clamped { target } else { *t + h };
            y.copy_from_slice(&ws.ynew);

            if ratio < GROW_RATIO {
                let growth = if ratio == 0.0 {
                    MAX_GROWTH
                } else {
                    (SAFETY / ratio.powf(1.0 / (ORDER + 1.0))).clamp(1.0, MAX_GROWTH)
                };
                self.step = self.step.max(h * growth);
            }
            return Ok(());
        }
    }
}

/// Evaluates the six stages for a step of size `h` from `y` (with `k1`
/// already holding `f(y)`), writes the fifth-order solution to `ynew` and
/// returns the scaled error ratio. NaN signals a non-finite stage.
fn trial_step<S: OdeSystem>(
    system: &S,
    ws: &mut Workspace,
    y: &[f64],
    h: f64,
    options: &IntegratorOptions,
) -> f64 {
    let n = y.len();

    for i in 0..n {
        ws.ytmp[i] = y[i] + h * A21 * ws.k1[i];
    }
    system.derivative(&ws.ytmp, &mut ws.k2);

    for i in 0..n {
        ws.ytmp[i] = y[i] + h * (A31 * ws.k1[i] + A32 * ws.k2[i]);
    }
    system.derivative(&ws.ytmp, &mut ws.k3);

    for i in 0..n {
        ws.ytmp[i] = y[i] + h * (A41 * ws.k1[i] + A42 * ws.k2[i] + A43 * ws.k3[i]);
    }
    system.derivative(&ws.ytmp, &mut ws.k4);

    for i in 0..n {
        ws.ytmp[i] =
            y[i] + h * (A51 * ws.k1[i] + A52 * ws.k2[i] + A53 * ws.k3[i] + A54 * ws.k4[i]);
    }
    system.derivative(&ws.ytmp, &mut ws.k5);

    for i in 0..n {
        ws.ytmp[i] = y[i]
            + h * (A61 * ws.k1[i]
                + A62 * ws.k2[i]
                + A63 * ws.k3[i]
                + A64 * ws.k4[i]
                + A65 * ws.k5[i]);
    }
    system.derivative(&ws.ytmp, &mut ws.k6);

    let mut ratio: f64 = 0.0;
    for i in 0..n {
        ws.ynew[i] = y[i]
            + h * (B1 * ws.k1[i] + B3 * ws.k3[i] + B4 * ws.k4[i] + B5 * ws.k5[i] + B6 * ws.k6[i]);
        let err = h
            * (E1 * ws.k1[i] + E3 * ws.k3[i] + E4 * ws.k4[i] + E5 * ws.k5[i] + E6 * ws.k6[i]);
        let scale = options.abs_tol + options.rel_tol * ws.ynew[i].abs();
        let component = err.abs() / scale;
        if !component.is_finite() {
            return f64::NAN;
        }
        ratio = ratio.max(component);
    }
    ratio
}
