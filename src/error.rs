//! Error types and error support code.

use thiserror::Error;

use crate::context::Interrupted;

/// Error type returned by pool operations.
///
/// `E` is the error type of the pool [`Manager`](crate::Manager).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError<E> {
    /// Pool was closed by cancelling its governing context.
    #[error("pool is closed")]
    Closed,
    /// No resources are available, and waiting was not requested.
    #[error("pool is exhausted")]
    Exhausted,
    /// Operation context was cancelled while waiting.
    #[error("operation cancelled")]
    Cancelled,
    /// Operation context deadline expired while waiting.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
    /// Resource construction failed.
    #[error("unable to construct resource: {0}")]
    Construct(#[source] E),
    /// Resource validation returned an error.
    #[error("unable to validate resource: {0}")]
    Validate(#[source] E),
    /// Pool configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl<E> PoolError<E> {
    /// Whether this error is a result of the pool being closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether this error is a result of operation context being cancelled or timed out.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl<E> From<Interrupted> for PoolError<E> {
    fn from(value: Interrupted) -> Self {
        match value {
            Interrupted::Cancelled => Self::Cancelled,
            Interrupted::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

/// Error type used in pool configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Configuration loading error.
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    /// Some duration parameter is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn interrupted_conversion() {
        let err: PoolError<io::Error> = Interrupted::Cancelled.into();
        assert!(matches!(err, PoolError::Cancelled));
        assert!(err.is_interrupted());
        let err: PoolError<io::Error> = Interrupted::DeadlineExceeded.into();
        assert!(matches!(err, PoolError::DeadlineExceeded));
        assert!(!err.is_closed());
    }

    #[test]
    fn display_includes_source() {
        let err: PoolError<io::Error> =
            PoolError::Construct(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(err.to_string(), "unable to construct resource: refused");
        assert!(PoolError::<io::Error>::Closed.is_closed());
    }
}
