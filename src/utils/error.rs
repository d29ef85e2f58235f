//! Customized unified error type.

use std::fmt;
use std::io;

/// Customized error type for Conclave.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ConclaveError(pub String);

impl ConclaveError {
    /// Constructs an error from anything that can render itself as a
    /// message string.
    pub fn msg(m: impl ToString) -> Self {
        ConclaveError(m.to_string())
    }
}

impl fmt::Display for ConclaveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for ConclaveError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ConclaveError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ConclaveError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ConclaveError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);
