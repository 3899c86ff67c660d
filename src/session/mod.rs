//! Call session state: one record per active call.
//!
//! ## State machine
//!
//! ```text
//!            ┌──────────┐
//!  started ─▶│ Greeting │─▶ Listening ─▶ Thinking ─▶ Speaking ─┐
//!            └──────────┘      ▲                               │
//!                 │            └───────────────────────────────┘
//!                 ▼ (realtime tier)
//!             Streaming ──backend lost──▶ Degrading ──▶ Greeting (lower tier)
//!                 │                           │
//!                 └──────── hangup ──────────▶ Ended
//! ```
//!
//! Tier moves are monotonic: Realtime → RecordRespond → TextOnly, never up.

pub mod manager;
pub mod phrases;
pub mod policy;
pub mod turn;

pub use manager::SessionManager;
pub use phrases::PhraseBook;
pub use policy::{Decision, DegradationPolicy};
pub use turn::TurnController;

use crate::backend::ChatTurn;
use crate::locale::Locale;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

// ── Tiers ──────────────────────────────────────────────────────────

/// Transport tiers, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Full-duplex media stream bridged to the realtime backend.
    Realtime,
    /// Half-duplex: capture an utterance, synthesize a reply, play it.
    RecordRespond,
    /// Static localized responses, no conversational backend.
    TextOnly,
}

impl Tier {
    /// The next tier down, if any. There is no way back up.
    pub fn next_lower(self) -> Option<Tier> {
        match self {
            Tier::Realtime => Some(Tier::RecordRespond),
            Tier::RecordRespond => Some(Tier::TextOnly),
            Tier::TextOnly => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Realtime => "realtime",
            Tier::RecordRespond => "record_respond",
            Tier::TextOnly => "text_only",
        }
    }
}

// ── States ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Greeting,
    Listening,
    Thinking,
    Speaking,
    Streaming,
    Degrading,
    Ended,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Greeting => "greeting",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Streaming => "streaming",
            SessionState::Degrading => "degrading",
            SessionState::Ended => "ended",
        }
    }
}

// ── Session record ─────────────────────────────────────────────────

/// Everything the orchestrator tracks for one call. Plain data; all
/// coordination lives in the manager.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Platform call id, the registry key.
    pub id: String,
    /// Caller number, logs only.
    pub caller: Option<String>,
    pub state: SessionState,
    pub tier: Tier,
    pub locale: Locale,
    /// Conversation turns. Index 0 is always the single system turn,
    /// regenerated before each backend call.
    pub history: Vec<ChatTurn>,
    /// Artifact key of audio queued or playing, pinned against the reaper.
    pub pending_audio_ref: Option<String>,
    /// Consecutive failures at the current tier. Reset by success and by
    /// every downgrade.
    pub failure_count: u32,
    pub downgrades_used: u32,
    /// Static replies served so far on the text-only tier.
    pub static_replies: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub ended_at: Option<Instant>,
}

impl CallSession {
    pub fn new(id: String, caller: Option<String>, tier: Tier, locale: Locale) -> Self {
        Self {
            id,
            caller,
            state: SessionState::Greeting,
            tier,
            locale,
            history: vec![ChatTurn::system(String::new())],
            pending_audio_ref: None,
            failure_count: 0,
            downgrades_used: 0,
            static_replies: 0,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            ended_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_ended(&self) -> bool {
        self.state == SessionState::Ended
    }

    pub fn mark_ended(&mut self) {
        self.state = SessionState::Ended;
        self.ended_at = Some(Instant::now());
    }

    /// Move to a lower tier: failure and static-reply counters start over,
    /// the call re-enters Greeting.
    pub fn downgrade_to(&mut self, tier: Tier) {
        self.tier = tier;
        self.failure_count = 0;
        self.static_replies = 0;
        self.state = SessionState::Greeting;
        self.downgrades_used += 1;
    }

    pub fn age_secs(&self) -> u64 {
        (Utc::now() - self.created_at).num_seconds().max(0) as u64
    }
}
