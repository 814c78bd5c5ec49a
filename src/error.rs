//! Error types for drishti-io
//!
//! # Error Recovery Strategies
//!
//! ## Transient (skip and continue)
//!
//! - **`Tracker(BadCrc)`** and **`Tracker(Timeout)`**: a single polling tick
//!   failed. The acquisition loop logs a warning and skips the tick.
//!
//! ## Per-client fatal (disconnect the client, keep serving)
//!
//! - A socket send that still returns zero after the configured retries, or
//!   an unparseable message header, removes that client from the registry.
//!   Other clients are unaffected.
//!
//! ## Session fatal (abort the service)
//!
//! - **`Serial`** on open, a rejected `COMM:`, or a failed `TSTART:` at
//!   startup abort the tracker session. The supervisor decides whether to
//!   restart the daemon.
//!
//! ## Configuration (fix and restart)
//!
//! - **`Config`**: the TOML file is invalid or inconsistent.
//!
//! No error crosses a thread boundary as a panic; every thread exits by
//! returning after converting failures into a logged `Error`.

use thiserror::Error;

use crate::devices::ndi::protocol::NdiError;

/// Errors that can occur in drishti-io
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tracker error: {0}")]
    Tracker(#[from] NdiError),

    #[error("Wire protocol error: {0}")]
    Wire(String),

    #[error("Thread panic")]
    ThreadPanic,

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
