//! Degradation policy: retry, step a tier down, or end the call.
//!
//! Pure decision logic over the session snapshot. The manager increments
//! `failure_count` before asking for a verdict and applies whatever comes
//! back, so every transition is decided in one place and the rules stay
//! testable without any backend in the loop.

use crate::config::Config;
use crate::error::FailureKind;
use crate::session::{CallSession, Tier};

/// What the session should do about the failure it just observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Stay on the current tier and reprompt the caller.
    Retry,
    /// Move to the given lower tier and greet again from there.
    Downgrade(Tier),
    /// Say goodbye and end the call.
    Terminate,
}

/// A decision plus the rule that produced it, for the logs.
#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: &'static str,
}

impl Verdict {
    fn new(decision: Decision, reason: &'static str) -> Self {
        Self { decision, reason }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DegradationPolicy {
    retry_threshold: u32,
    max_downgrades: u32,
}

impl DegradationPolicy {
    pub fn new(retry_threshold: u32, max_downgrades: u32) -> Self {
        Self {
            retry_threshold,
            max_downgrades,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.session.retry_threshold,
            config.session.max_downgrades,
        )
    }

    /// Decide on a failure that has already been counted into the session.
    ///
    /// Transient kinds are retried while the count is under the threshold.
    /// Once at or past it, or on a kind that retrying cannot fix, the call
    /// steps down a tier. Tiers only ever move down; when there is no tier
    /// left or the downgrade budget is spent, the call ends.
    pub fn decide(&self, session: &CallSession, kind: FailureKind) -> Verdict {
        match kind {
            FailureKind::TransportClosed => {
                // The carrier leg is gone; nothing to retry against.
                Verdict::new(Decision::Terminate, "transport leg closed")
            }
            FailureKind::StreamProtocolError | FailureKind::RealtimeRejected => {
                // The current tier itself is broken for this call.
                self.downgrade_or_terminate(session, "tier unusable for this call")
            }
            _ if kind.is_transient() => {
                if session.failure_count < self.retry_threshold {
                    Verdict::new(Decision::Retry, "within retry budget")
                } else {
                    self.downgrade_or_terminate(session, "retry budget exhausted")
                }
            }
            _ => self.downgrade_or_terminate(session, "unretryable failure"),
        }
    }

    fn downgrade_or_terminate(&self, session: &CallSession, reason: &'static str) -> Verdict {
        if session.downgrades_used >= self.max_downgrades {
            return Verdict::new(Decision::Terminate, "downgrade budget exhausted");
        }
        match session.tier.next_lower() {
            Some(next) => Verdict::new(Decision::Downgrade(next), reason),
            None => Verdict::new(Decision::Terminate, "no lower tier left"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locale::Locale;

    fn session_on(tier: Tier) -> CallSession {
        CallSession::new("CA1".into(), None, tier, Locale::En)
    }

    fn policy() -> DegradationPolicy {
        DegradationPolicy::new(2, 2)
    }

    #[test]
    fn first_transient_failure_retries() {
        let mut s = session_on(Tier::RecordRespond);
        s.failure_count = 1;
        let v = policy().decide(&s, FailureKind::InputTimeout);
        assert_eq!(v.decision, Decision::Retry);
    }

    #[test]
    fn second_transient_failure_steps_down() {
        let mut s = session_on(Tier::Realtime);
        s.failure_count = 2;
        let v = policy().decide(&s, FailureKind::BackendUnavailable);
        assert_eq!(v.decision, Decision::Downgrade(Tier::RecordRespond));
    }

    #[test]
    fn at_or_past_threshold_never_retries() {
        let p = policy();
        for count in 2..6 {
            let mut s = session_on(Tier::Realtime);
            s.failure_count = count;
            let v = p.decide(&s, FailureKind::InputTimeout);
            assert_ne!(
                v.decision,
                Decision::Retry,
                "retried at failure_count {count}"
            );
        }
    }

    #[test]
    fn bottom_tier_terminates_instead_of_degrading() {
        let mut s = session_on(Tier::TextOnly);
        s.failure_count = 2;
        let v = policy().decide(&s, FailureKind::BackendUnavailable);
        assert_eq!(v.decision, Decision::Terminate);
    }

    #[test]
    fn spent_downgrade_budget_terminates() {
        let mut s = session_on(Tier::Realtime);
        s.failure_count = 2;
        s.downgrades_used = 2;
        let v = policy().decide(&s, FailureKind::InputTimeout);
        assert_eq!(v.decision, Decision::Terminate);
    }

    #[test]
    fn transport_closed_terminates_immediately() {
        let s = session_on(Tier::Realtime);
        let v = policy().decide(&s, FailureKind::TransportClosed);
        assert_eq!(v.decision, Decision::Terminate);
    }

    #[test]
    fn protocol_error_skips_the_retry_budget() {
        let mut s = session_on(Tier::Realtime);
        s.failure_count = 1;
        let v = policy().decide(&s, FailureKind::StreamProtocolError);
        assert_eq!(v.decision, Decision::Downgrade(Tier::RecordRespond));
    }

    #[test]
    fn realtime_rejection_falls_back_to_record_respond() {
        let s = session_on(Tier::Realtime);
        let v = policy().decide(&s, FailureKind::RealtimeRejected);
        assert_eq!(v.decision, Decision::Downgrade(Tier::RecordRespond));
    }

    #[test]
    fn tiers_walk_down_monotonically() {
        let p = policy();
        let mut s = session_on(Tier::Realtime);

        s.failure_count = 2;
        let v = p.decide(&s, FailureKind::InputTimeout);
        assert_eq!(v.decision, Decision::Downgrade(Tier::RecordRespond));
        s.downgrade_to(Tier::RecordRespond);
        assert_eq!(s.failure_count, 0);

        s.failure_count = 2;
        let v = p.decide(&s, FailureKind::InputTimeout);
        assert_eq!(v.decision, Decision::Downgrade(Tier::TextOnly));
        s.downgrade_to(Tier::TextOnly);

        s.failure_count = 2;
        let v = p.decide(&s, FailureKind::InputTimeout);
        assert_eq!(v.decision, Decision::Terminate);
    }
}
