//! Crate-wide error taxonomy (spec.md §7).
//!
//! A flat `thiserror::Error` enum plus a `Result` alias, the same
//! shape as `dos_actors::ActorError`, but the variants follow the AO
//! error taxonomy rather than the actor-channel one.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AoError {
    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("hardware initialisation failed for {device}: {reason}")]
    HardwareInit { device: String, reason: String },

    #[error("{device} timed out waiting for a frame")]
    Timeout { device: String },

    #[error("calibration failed: {reason}")]
    Calibration { reason: String },

    #[error("protocol error on {verb}: {reason}")]
    Protocol { verb: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame ring error: {reason}")]
    Ring { reason: String },

    #[error("internal invariant violated: {reason}")]
    Invariant { reason: String },

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device {0} already registered")]
    DuplicateDevice(String),
}

pub type AoResult<T> = std::result::Result<T, AoError>;

impl AoError {
    pub fn config<S: Into<String>>(reason: S) -> Self {
        AoError::Config {
            reason: reason.into(),
        }
    }
    pub fn calibration<S: Into<String>>(reason: S) -> Self {
        AoError::Calibration {
            reason: reason.into(),
        }
    }
    pub fn invariant<S: Into<String>>(reason: S) -> Self {
        AoError::Invariant {
            reason: reason.into(),
        }
    }
    pub fn protocol<S: Into<String>, T: Into<String>>(verb: S, reason: T) -> Self {
        AoError::Protocol {
            verb: verb.into(),
            reason: reason.into(),
        }
    }
}

/// Pretty-prints an error and its full `source()` chain to the log, the
/// way `dos_actors::print_error` walks `std::error::Error::source`.
pub fn log_error<S: Into<String>>(msg: S, e: &impl std::error::Error) {
    let mut chain: Vec<String> = vec![msg.into()];
    chain.push(format!("{}", e));
    let mut current = e.source();
    while let Some(cause) = current {
        chain.push(format!("{}", cause));
        current = cause.source();
    }
    log::error!("{}", chain.join("\n .after: "));
}
