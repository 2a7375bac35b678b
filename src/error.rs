//! Candycom error types.
//!
//! Only failures of the surrounding machinery surface as errors: transport
//! I/O, configuration, port discovery. Protocol faults (unrecognized
//! tokens, buffer overflow, handler timeouts, watchdog expiry) are logged
//! and counted in [`LinkStats`](crate::protocol::LinkStats) instead, because
//! the session has to keep running through them.

use thiserror::Error;

/// Candycom errors.
#[derive(Error, Debug)]
pub enum CandyError {
    /// Transport-level failure (closed link, short write, pump died).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A blocking operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation requires a connected session.
    #[error("Not connected")]
    NotConnected,

    /// No candidate serial device answered the port probe.
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Candycom operations
pub type Result<T> = std::result::Result<T, CandyError>;
