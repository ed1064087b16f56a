use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tonic::{Code, Status};

/// Hook invoked by the subscriber for every non-fatal but notable condition:
/// reconnect causes, permanent per-message failures, callback panics, and
/// ordering violations. Network failures never surface anywhere else.
pub(crate) type ErrorHook = Arc<dyn Fn(SubscriberError) + Send + Sync>;

/// Which unary path an acknowledgement-side error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// An acknowledge request.
    Acknowledge,
    /// A modify-ack-deadline request carrying the given deadline in seconds.
    /// A deadline of zero is a nack.
    ModifyDeadline(i32),
}

impl std::fmt::Display for AckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckKind::Acknowledge => write!(f, "acknowledge"),
            AckKind::ModifyDeadline(seconds) => {
                write!(f, "modify_ack_deadline({}s)", seconds)
            }
        }
    }
}

/// Per-identifier failure classification reported by brokers with
/// exactly-once delivery. Brokers without it never populate these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckIdFailure {
    /// The broker rejected this identifier for good; retrying cannot help.
    /// Carries the broker's reason string.
    Permanent(String),
    /// The broker asked for this identifier to be retried.
    Transient,
}

/// Error returned by [`crate::AckService`] calls.
///
/// `failures` optionally partitions the batch per identifier; identifiers a
/// partial-failure response does not name are treated as delivered.
#[derive(Debug, Error)]
#[error("{status}")]
pub struct AckError {
    pub status: Status,
    pub failures: HashMap<String, AckIdFailure>,
}

impl AckError {
    /// An error with no per-identifier detail; the whole batch is classified
    /// by the status code alone.
    pub fn from_status(status: Status) -> Self {
        Self {
            status,
            failures: HashMap::new(),
        }
    }
}

impl From<Status> for AckError {
    fn from(status: Status) -> Self {
        Self::from_status(status)
    }
}

/// Everything the error hook can be told about.
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// The bidirectional stream failed; a reconnect is already underway.
    #[error("stream disconnected, reconnecting: {status}")]
    StreamDisconnected { status: Status },

    /// The broker closed the stream without an error while the subscriber was
    /// still running; treated like a transient failure and reconnected.
    #[error("stream ended unexpectedly, reconnecting")]
    StreamEnded,

    /// An acknowledgement-side request failed permanently for the given
    /// identifiers. They are dropped; the broker redelivers the affected
    /// messages once their lease expires.
    #[error("{kind} failed permanently for {} message(s): {status}", .ack_ids.len())]
    PermanentAckFailure {
        kind: AckKind,
        status: Status,
        ack_ids: Vec<String>,
    },

    /// An acknowledgement-side request kept failing transiently until the
    /// retry budget ran out. The identifiers are dropped and redelivered on
    /// lease expiry.
    #[error("{kind} retries exhausted for {} message(s): {last_status}", .ack_ids.len())]
    RetriesExhausted {
        kind: AckKind,
        last_status: Status,
        ack_ids: Vec<String>,
    },

    /// A user callback panicked. The message was released and will be
    /// redelivered.
    #[error("callback panicked while handling message {message_id}")]
    CallbackPanicked { message_id: String },

    /// A delivery failure broke the strict order for a key; the key is
    /// suspended until [`crate::SubscriberHandle::resume_ordering_key`].
    #[error("ordered delivery halted for ordering key {ordering_key:?}")]
    OrderedDeliveryHalted { ordering_key: String },
}

/// Stream-level codes that trigger a transparent reconnect without being
/// worth more than a warning.
pub(crate) fn is_transient_stream_error(code: Code) -> bool {
    matches!(
        code,
        Code::Cancelled
            | Code::DeadlineExceeded
            | Code::Internal
            | Code::ResourceExhausted
            | Code::Unavailable
            | Code::Unauthenticated
    )
}

/// Acknowledgement-side codes that are retried under the bounded backoff
/// policy. Everything else is permanent.
pub(crate) fn is_transient_ack_error(code: Code) -> bool {
    matches!(
        code,
        Code::Cancelled | Code::DeadlineExceeded | Code::Internal | Code::ResourceExhausted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_splits_the_code_space() {
        for code in [
            Code::Cancelled,
            Code::DeadlineExceeded,
            Code::Internal,
            Code::ResourceExhausted,
        ] {
            assert!(is_transient_ack_error(code));
            assert!(is_transient_stream_error(code));
        }

        // The stream survives auth churn and overload; the unary paths treat
        // them as permanent and lean on redelivery instead.
        assert!(is_transient_stream_error(Code::Unavailable));
        assert!(is_transient_stream_error(Code::Unauthenticated));
        assert!(!is_transient_ack_error(Code::Unauthenticated));

        assert!(!is_transient_stream_error(Code::InvalidArgument));
        assert!(!is_transient_ack_error(Code::PermissionDenied));
    }

    #[test]
    fn ack_error_from_status_has_no_partitions() {
        let err = AckError::from_status(Status::internal("boom"));
        assert!(err.failures.is_empty());
        assert_eq!(err.status.code(), Code::Internal);
    }
}
