use std::fmt;

use crate::RetryPolicy;

/// Which half of the decoder produced a [`DecodeFailure`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeStage {
    /// Schema-driven `simd-json` decode.
    Fast,
    /// Lenient `serde_json` parse followed by field remapping.
    Fallback,
}

impl fmt::Display for DecodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => f.write_str("fast"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// Response body could not be decoded into the requested shape.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("decode failed at {stage} stage: {cause}")]
pub struct DecodeFailure {
    /// Last stage that was attempted.
    pub stage: DecodeStage,
    /// Parser or remapping error text from that stage.
    pub cause: String,
}

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Non-success HTTP status code with raw response body.
    #[error("http error {status}: {body}")]
    Status { status: u16, body: String },
    /// Retryable failures persisted until the attempt ceiling.
    #[error("gave up after {attempts} attempt(s): {last}")]
    RetryExhausted {
        /// Number of attempts that were made.
        attempts: u32,
        /// Failure of the final attempt.
        last: Box<FetchError>,
    },
    /// Response decoding error.
    #[error(transparent)]
    Decode(#[from] DecodeFailure),
    /// The caller's overall deadline passed before another attempt could start.
    #[error("deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },
    /// The fetch was cancelled by the caller or by fetcher shutdown.
    #[error("fetch cancelled")]
    Cancelled,
    /// The fetcher is not enabled (before `on_enable` or after `on_disable`).
    #[error("fetcher is not enabled")]
    Disabled,
    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Local file error from the resource cache.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Returns the HTTP status carried by this error, looking through
    /// [`FetchError::RetryExhausted`].
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            Self::RetryExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Number of attempts the fetch made before failing, when known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } | Self::DeadlineExceeded { attempts } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    /// Whether the failure is transient in nature.
    ///
    /// Uses the default classes of [`crate::RetryPolicy`]: transport errors,
    /// deadlines and the statuses 429, 502, 503 and 504, looking through
    /// [`FetchError::RetryExhausted`]. A caller with a custom policy should use
    /// [`FetchError::is_retryable_under`] instead.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::DeadlineExceeded { .. } => true,
            Self::Status { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            Self::RetryExhausted { last, .. } => last.is_transient(),
            _ => false,
        }
    }

    /// Whether `policy` would retry this failure, looking through
    /// [`FetchError::RetryExhausted`].
    pub fn is_retryable_under(&self, policy: &RetryPolicy) -> bool {
        match self {
            Self::Transport(err) => policy.is_retryable_transport(err),
            Self::Status { status, .. } => policy.retryable_statuses.contains(status),
            Self::RetryExhausted { last, .. } => last.is_retryable_under(policy),
            _ => false,
        }
    }
}
