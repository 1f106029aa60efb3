use std::fmt;

/// Error taxonomy for the control plane. Variants group failures by how a
/// caller should react, not by which module raised them.
#[derive(Debug)]
pub enum GaleError {
    /// Invalid config value or missing required field. Fatal at startup.
    Configuration(String),
    /// A single send/recv failed but the stream is still usable.
    TransportRecoverable(String),
    /// The stream itself is gone (peer cancelled, transport unavailable).
    TransportUnrecoverable(String),
    /// No healthy report arrived within the configured deadline.
    Timeout,
    /// Peer reported `ShuttingDown`; not a failure, just an orderly exit.
    ShuttingDown,
    /// The registry was asked to operate on a key it should already hold.
    InvariantViolation(String),
    Internal(String),
}

impl fmt::Display for GaleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GaleError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            GaleError::TransportRecoverable(msg) => write!(f, "transport error (recoverable): {msg}"),
            GaleError::TransportUnrecoverable(msg) => {
                write!(f, "transport error (unrecoverable): {msg}")
            }
            GaleError::Timeout => write!(f, "health check timeout"),
            GaleError::ShuttingDown => write!(f, "peer reported shutting down"),
            GaleError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            GaleError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GaleError {}
