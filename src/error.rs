//! This module defines the custom error types for the library.
//!
//! Everything that can go wrong *before* the Riemannian Staircase starts (bad
//! options, inconsistent measurements, a failed factorization while building the
//! problem) is reported through a single public error type, [`SeSyncError`].
//! Failures of the optimization itself are not errors: they are terminal
//! statuses recorded in [`crate::result::SeSyncStatus`].
//!
//! Using the [`thiserror`] crate allows us to create idiomatic error types with minimal
//! boilerplate. Note that [`faer::linalg::evd::EvdError`] and
//! [`faer::linalg::svd::SvdError`] do not implement the standard [`std::error::Error`]
//! trait, so we wrap them manually to provide a compatible error type.
use thiserror::Error;

/// Represents all possible errors that can occur while setting up or running SE-Sync.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct SeSyncError(#[from] SeSyncErrorKind);

/// The distinct kinds of errors.
///
/// The kind is public so that callers can tell configuration problems apart from
/// numerical ones; see [`SeSyncError::kind`].
#[derive(Error, Debug, PartialEq)]
pub enum SeSyncErrorKind {
    /// An options record that cannot describe a valid run (e.g. `r0 > rmax`).
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// A matrix argument (typically the initial iterate) has the wrong shape.
    #[error(
        "Dimension mismatch for {what}: expected {expected_rows}x{expected_cols}, got {actual_rows}x{actual_cols}."
    )]
    DimensionMismatch {
        what: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    /// The measurement set does not define a valid synchronization problem.
    #[error("Invalid measurements: {0}")]
    InvalidMeasurements(String),

    /// A sparse or dense factorization could not be computed.
    #[error("Factorization failed: {0}")]
    Factorization(String),

    /// Wraps an error originating from [`faer`]'s eigendecomposition module.
    #[error("A numerical error occurred during a symmetric eigendecomposition: {0:?}")]
    EvdError(faer::linalg::evd::EvdError),

    /// Wraps an error originating from [`faer`]'s singular value decomposition module.
    #[error("A numerical error occurred during a singular value decomposition: {0:?}")]
    SvdError(faer::linalg::svd::SvdError),
}

impl SeSyncError {
    /// Returns the underlying error kind.
    pub fn kind(&self) -> &SeSyncErrorKind {
        &self.0
    }

    /// Returns `true` if the error was raised while validating the caller's
    /// configuration, i.e. before any optimization work was done.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self.0,
            SeSyncErrorKind::InvalidOptions(_) | SeSyncErrorKind::DimensionMismatch { .. }
        )
    }

    pub(crate) fn invalid_options(message: impl Into<String>) -> Self {
        SeSyncErrorKind::InvalidOptions(message.into()).into()
    }

    pub(crate) fn dimension_mismatch(
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    ) -> Self {
        SeSyncErrorKind::DimensionMismatch {
            what,
            expected_rows: expected.0,
            expected_cols: expected.1,
            actual_rows: actual.0,
            actual_cols: actual.1,
        }
        .into()
    }

    pub(crate) fn invalid_measurements(message: impl Into<String>) -> Self {
        SeSyncErrorKind::InvalidMeasurements(message.into()).into()
    }

    pub(crate) fn factorization(message: impl Into<String>) -> Self {
        SeSyncErrorKind::Factorization(message.into()).into()
    }
}

impl From<faer::linalg::evd::EvdError> for SeSyncError {
    fn from(err: faer::linalg::evd::EvdError) -> Self {
        SeSyncErrorKind::EvdError(err).into()
    }
}

impl From<faer::linalg::svd::SvdError> for SeSyncError {
    fn from(err: faer::linalg::svd::SvdError) -> Self {
        SeSyncErrorKind::SvdError(err).into()
    }
}

// Manually implement PartialEq for the public error type.
// We compare the inner `SeSyncErrorKind`.
impl PartialEq for SeSyncError {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SeSyncError>;

// Unit tests to ensure error messages are formatted correctly.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_options_message() {
        let error = SeSyncError::invalid_options("r0 (10) must not exceed rmax (5)");
        assert_eq!(
            error.to_string(),
            "Invalid options: r0 (10) must not exceed rmax (5)"
        );
        assert!(error.is_configuration_error());
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let error = SeSyncError(SeSyncErrorKind::DimensionMismatch {
            what: "initial iterate Y0",
            expected_rows: 5,
            expected_cols: 12,
            actual_rows: 4,
            actual_cols: 12,
        });
        let expected_message =
            "Dimension mismatch for initial iterate Y0: expected 5x12, got 4x12.";
        assert_eq!(error.to_string(), expected_message);
        assert!(error.is_configuration_error());
    }

    #[test]
    fn test_measurement_error_is_not_configuration() {
        let error = SeSyncError::invalid_measurements("measurement graph is not connected");
        assert_eq!(
            error.to_string(),
            "Invalid measurements: measurement graph is not connected"
        );
        assert!(!error.is_configuration_error());
    }

    #[test]
    fn test_evd_error_message() {
        let error = SeSyncError::from(faer::linalg::evd::EvdError::NoConvergence);
        let expected_message =
            "A numerical error occurred during a symmetric eigendecomposition: NoConvergence";
        assert_eq!(error.to_string(), expected_message);
        assert_eq!(
            error,
            SeSyncError(SeSyncErrorKind::EvdError(
                faer::linalg::evd::EvdError::NoConvergence
            ))
        );
    }
}
