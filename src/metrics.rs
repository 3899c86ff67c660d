//! Process-wide counters, exported in Prometheus text format at `/metrics`.
//!
//! One registry per process, built at startup and shared behind an `Arc`.
//! Counters are fire-and-forget from the hot paths; nothing here blocks.

use anyhow::Context;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::FailureKind;
use crate::session::Tier;

pub struct Metrics {
    registry: Registry,
    pub calls_started: IntCounter,
    pub calls_active: IntGauge,
    pub turns_completed: IntCounter,
    pub tier_downgrades: IntCounterVec,
    pub backend_failures: IntCounterVec,
    pub synthesis_cache_hits: IntCounter,
    pub synthesis_cache_misses: IntCounter,
    pub relay_frames: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let calls_started = IntCounter::with_opts(Opts::new(
            "switchboard_calls_started_total",
            "Calls accepted by the gateway",
        ))?;
        let calls_active = IntGauge::with_opts(Opts::new(
            "switchboard_calls_active",
            "Calls currently tracked, ended grace included",
        ))?;
        let turns_completed = IntCounter::with_opts(Opts::new(
            "switchboard_turns_completed_total",
            "Conversational turns that produced a reply",
        ))?;
        let tier_downgrades = IntCounterVec::new(
            Opts::new(
                "switchboard_tier_downgrades_total",
                "Tier downgrades by target tier",
            ),
            &["tier"],
        )?;
        let backend_failures = IntCounterVec::new(
            Opts::new(
                "switchboard_backend_failures_total",
                "Failures counted into degradation, by kind",
            ),
            &["kind"],
        )?;
        let synthesis_cache_hits = IntCounter::with_opts(Opts::new(
            "switchboard_synthesis_cache_hits_total",
            "Synthesis requests served from the artifact cache",
        ))?;
        let synthesis_cache_misses = IntCounter::with_opts(Opts::new(
            "switchboard_synthesis_cache_misses_total",
            "Synthesis requests that went to the backend",
        ))?;
        let relay_frames = IntCounterVec::new(
            Opts::new(
                "switchboard_relay_frames_total",
                "Media frames moved by the relay, by direction",
            ),
            &["direction"],
        )?;

        registry.register(Box::new(calls_started.clone()))?;
        registry.register(Box::new(calls_active.clone()))?;
        registry.register(Box::new(turns_completed.clone()))?;
        registry.register(Box::new(tier_downgrades.clone()))?;
        registry.register(Box::new(backend_failures.clone()))?;
        registry.register(Box::new(synthesis_cache_hits.clone()))?;
        registry.register(Box::new(synthesis_cache_misses.clone()))?;
        registry.register(Box::new(relay_frames.clone()))?;

        Ok(Self {
            registry,
            calls_started,
            calls_active,
            turns_completed,
            tier_downgrades,
            backend_failures,
            synthesis_cache_hits,
            synthesis_cache_misses,
            relay_frames,
        })
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.backend_failures.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_downgrade(&self, to: Tier) {
        self.tier_downgrades.with_label_values(&[to.as_str()]).inc();
    }

    pub fn add_relay_frames(&self, inbound: u64, outbound: u64) {
        self.relay_frames
            .with_label_values(&["inbound"])
            .inc_by(inbound);
        self.relay_frames
            .with_label_values(&["outbound"])
            .inc_by(outbound);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("encoding metrics")?;
        String::from_utf8(buf).context("metrics output was not utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_exports_every_family() {
        let m = Metrics::new().unwrap();
        m.calls_started.inc();
        m.calls_active.inc();
        m.record_failure(FailureKind::InputTimeout);
        m.record_downgrade(Tier::TextOnly);
        m.add_relay_frames(3, 2);

        let text = m.export().unwrap();
        assert!(text.contains("switchboard_calls_started_total 1"));
        assert!(text.contains("switchboard_calls_active 1"));
        assert!(text.contains("kind=\"input_timeout\""));
        assert!(text.contains("tier=\"text_only\""));
        assert!(text.contains("direction=\"inbound\""));
    }

    #[test]
    fn failure_kinds_use_stable_labels() {
        let m = Metrics::new().unwrap();
        for kind in [
            FailureKind::InputTimeout,
            FailureKind::BackendUnavailable,
            FailureKind::SynthesisUnavailable,
            FailureKind::TransportClosed,
            FailureKind::StreamProtocolError,
        ] {
            m.record_failure(kind);
        }
        let text = m.export().unwrap();
        assert!(text.contains("backend_unavailable"));
        assert!(text.contains("stream_protocol_error"));
    }
}
