//! Status codes shared across the hub components.

use thiserror::Error;

/// Compact status values passed between hub components.
///
/// Components report failures with one of these values and log the
/// operational detail at the failure site. Periodic workers compare
/// against specific variants (`NoData`, `Timeout`) to decide whether a
/// failure is expected, so the set stays small and comparable.
///
/// Marked `#[non_exhaustive]` to allow new status values without breaking
/// downstream matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// Generic operational failure. Detail goes to the log.
    #[error("operation failed")]
    Failed,

    /// The operation can't be performed in the current state.
    #[error("invalid state")]
    InvalidState,

    /// The operation was given an invalid argument.
    #[error("invalid argument")]
    InvalidArg,

    /// The operation isn't supported by this component.
    #[error("not supported")]
    NotSupported,

    /// There is no data to perform the operation.
    #[error("no data")]
    NoData,

    /// The entity already exists.
    #[error("already exists")]
    Exists,

    /// The operation did not complete within its deadline.
    #[error("timeout")]
    Timeout,
}

/// Result type alias using the shared status [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
