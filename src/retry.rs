//! Glue for [`keen_retry`], used where we retry lost compare-and-set races.
//!
//! Inside a retryable operation, these macros play the role of `?`: they
//! unwrap an `Ok`, or return early with a [`RetryResult`] that tells
//! `keen_retry` whether another attempt is worthwhile. The caller must have
//! [`IsKnownTransient`] and `tracing::debug` in scope.

use keen_retry::RetryResult;

/// Unwrap a `Result`, returning a [`RetryResult::Transient`] for errors
/// which report themselves as transient and a [`RetryResult::Fatal`] for
/// everything else.
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Retrying after transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// Unwrap a `Result`, giving up on any error.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

pub(crate) use {try_fatal, try_potentially_transient};

/// A successful attempt.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Errors which may go away if we simply try again.
///
/// Anything not explicitly marked as transient is treated as fatal.
pub trait IsKnownTransient {
    fn is_known_transient(&self) -> bool;
}
