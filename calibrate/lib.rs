#![deny(dead_code)]
#![deny(unused_imports)]

//! Forward-model evaluation core for calibrating a SEIR-SEI arbovirus model
//! with additive discrepancy terms.

pub mod config;
pub mod data;
pub mod discrepancy;
pub mod dynamics;
pub mod forward;
pub mod likelihood;
pub mod ode;
pub mod propagate;
pub mod qoi;
