//! Error taxonomy for call orchestration.
//!
//! `FailureKind` classifies what went wrong during a call so the degradation
//! policy can pick between retrying, dropping a tier, or ending the call.
//! `SessionError` covers faults of the session registry itself (unknown ids,
//! capacity) and is the only error `handle_event` surfaces to the transport.

use thiserror::Error;

/// A failure observed while serving a call, classified for policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum FailureKind {
    /// Caller produced no input within the capture window.
    #[error("caller input timed out")]
    InputTimeout,
    /// Language-model backend unreachable, erroring, or over deadline.
    #[error("language-model backend unavailable")]
    BackendUnavailable,
    /// Speech synthesis failed after its internal retry.
    #[error("speech synthesis unavailable")]
    SynthesisUnavailable,
    /// The telephony side hung up or dropped the connection.
    #[error("telephony transport closed")]
    TransportClosed,
    /// Malformed or out-of-order frames on the media stream.
    #[error("media stream protocol violation")]
    StreamProtocolError,
    /// Realtime backend refused the session outright.
    #[error("realtime backend rejected the session")]
    RealtimeRejected,
}

impl FailureKind {
    /// Transient failures are worth retrying at the current tier;
    /// the rest skip straight to a tier decision.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::InputTimeout
                | FailureKind::BackendUnavailable
                | FailureKind::SynthesisUnavailable
        )
    }

    /// Stable label for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::InputTimeout => "input_timeout",
            FailureKind::BackendUnavailable => "backend_unavailable",
            FailureKind::SynthesisUnavailable => "synthesis_unavailable",
            FailureKind::TransportClosed => "transport_closed",
            FailureKind::StreamProtocolError => "stream_protocol_error",
            FailureKind::RealtimeRejected => "realtime_rejected",
        }
    }
}

/// Faults of the session registry, surfaced to webhook handlers.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown call id: {0}")]
    UnknownCall(String),
    #[error("call {0} already ended")]
    CallEnded(String),
    #[error("session registry at capacity ({0} active calls)")]
    AtCapacity(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(FailureKind::InputTimeout.is_transient());
        assert!(FailureKind::BackendUnavailable.is_transient());
        assert!(FailureKind::SynthesisUnavailable.is_transient());
    }

    #[test]
    fn terminal_and_tier_kinds_are_not_transient() {
        assert!(!FailureKind::TransportClosed.is_transient());
        assert!(!FailureKind::StreamProtocolError.is_transient());
        assert!(!FailureKind::RealtimeRejected.is_transient());
    }

    #[test]
    fn metric_labels_are_snake_case() {
        for kind in [
            FailureKind::InputTimeout,
            FailureKind::BackendUnavailable,
            FailureKind::SynthesisUnavailable,
            FailureKind::TransportClosed,
            FailureKind::StreamProtocolError,
            FailureKind::RealtimeRejected,
        ] {
            let label = kind.as_str();
            assert!(!label.is_empty());
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn session_errors_name_the_call() {
        let err = SessionError::UnknownCall("CA123".into());
        assert!(err.to_string().contains("CA123"));
    }
}
