use thiserror::Error;

/// Errors that stop the relay server itself.
///
/// Per-connection failures never surface here; they close that connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
