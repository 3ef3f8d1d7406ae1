//! Service-specific error types

use thiserror::Error;

/// Fetch failures raised while a job is being processed.
///
/// These never leave the service as Rust errors: the fetch processor turns
/// them into a `ProcessError`, which the dispatcher retries or records on the
/// `Failed` job.
#[derive(Error, Debug)]
pub enum Error {
    #[error("upstream request via {resource} failed: {message}")]
    Upstream { resource: String, message: String },

    #[error("upstream returned {status} via {resource}")]
    Status { resource: String, status: u16 },

    #[error("all resources rate limited for {wait_secs}s (max wait {max_wait_secs}s)")]
    RateLimited { wait_secs: u64, max_wait_secs: u64 },

    #[error("fetch failed after {attempts} attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Rotator(#[from] rotator::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_descriptive() {
        assert_eq!(
            Error::Status {
                resource: "primary".into(),
                status: 502
            }
            .to_string(),
            "upstream returned 502 via primary"
        );
        assert_eq!(
            Error::RateLimited {
                wait_secs: 600,
                max_wait_secs: 120
            }
            .to_string(),
            "all resources rate limited for 600s (max wait 120s)"
        );
        assert!(
            Error::AttemptsExhausted {
                attempts: 3,
                last_error: "connection refused".into()
            }
            .to_string()
            .contains("connection refused")
        );
    }

    #[test]
    fn rotator_errors_pass_through() {
        let err: Error = rotator::Error::ResourceExhausted {
            available: 0,
            total: 2,
            retry_in: None,
        }
        .into();
        assert_eq!(err.to_string(), "resources exhausted: 0/2 available");
    }

    #[test]
    fn error_debug_includes_variant_name() {
        let debug = format!("{:?}", Error::Cancelled);
        assert!(debug.contains("Cancelled"), "got: {debug}");
    }
}
