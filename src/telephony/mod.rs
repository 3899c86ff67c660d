//! Telephony platform surface.
//!
//! The platform talks to the orchestrator two ways:
//! - form-encoded webhooks for call lifecycle and captured speech, answered
//!   with TwiML documents rendered from exactly one [`Instruction`];
//! - a WebSocket media stream (see [`stream`]) for the realtime tier.
//!
//! ## Flow
//!
//! ```text
//! platform ──POST /voice──────────▶ CallEvent::Started ─▶ Instruction
//! platform ──POST /voice/collect──▶ Utterance / InputTimeout ─▶ Instruction
//! platform ──POST /voice/status───▶ CallEvent::Ended
//! platform ══WS /media════════════▶ StreamFrame pump (media relay)
//! ```

pub mod stream;
pub mod twiml;

pub use stream::StreamFrame;
pub use twiml::{say_voice, TwimlContext};

use crate::locale::Locale;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

// ── Events ─────────────────────────────────────────────────────────

/// Transport-facing call lifecycle events fed to the session manager.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// New call, or re-entry of a known call after a stream verb finished.
    Started {
        call_id: String,
        caller: Option<String>,
    },
    /// Caller speech captured by the platform's recognizer.
    Utterance { call_id: String, text: String },
    /// The capture window elapsed without usable input.
    InputTimeout { call_id: String },
    /// One media-stream frame, routed to the call's relay.
    MediaFrame { call_id: String, frame: StreamFrame },
    /// The platform reports the call is over.
    Ended { call_id: String },
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::Started { call_id, .. }
            | CallEvent::Utterance { call_id, .. }
            | CallEvent::InputTimeout { call_id }
            | CallEvent::MediaFrame { call_id, .. }
            | CallEvent::Ended { call_id } => call_id,
        }
    }
}

// ── Instructions ───────────────────────────────────────────────────

/// What the transport should do next. At most one per event.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Speak `text` with the platform's own TTS.
    Speak {
        text: String,
        voice: String,
        locale: Locale,
        /// Whether to capture caller speech afterwards.
        expects_reply: bool,
    },
    /// Play a synthesized artifact from the content-addressed cache.
    PlayAudio {
        artifact_key: String,
        expects_reply: bool,
    },
    /// Open the duplex media stream for realtime conversation.
    OpenDuplexStream { endpoint: String },
    /// Send the call to another webhook target.
    Redirect { target: String },
    /// End the call.
    Hangup,
}

impl Instruction {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Speak { .. } => "speak",
            Instruction::PlayAudio { .. } => "play_audio",
            Instruction::OpenDuplexStream { .. } => "open_duplex_stream",
            Instruction::Redirect { .. } => "redirect",
            Instruction::Hangup => "hangup",
        }
    }
}

// ── Webhook payloads ───────────────────────────────────────────────

/// Form body of the platform's voice webhooks. Field names follow the
/// platform's `PascalCase` convention; everything unknown is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceWebhook {
    #[serde(rename = "CallSid")]
    pub call_sid: String,
    #[serde(rename = "From", default)]
    pub from: Option<String>,
    #[serde(rename = "SpeechResult", default)]
    pub speech_result: Option<String>,
    #[serde(rename = "Digits", default)]
    pub digits: Option<String>,
    #[serde(rename = "CallStatus", default)]
    pub call_status: Option<String>,
}

impl VoiceWebhook {
    /// Speech first, DTMF as fallback; empty strings count as no input.
    pub fn captured_input(&self) -> Option<String> {
        let speech = self
            .speech_result
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let digits = self
            .digits
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        speech.or(digits).map(str::to_string)
    }

    /// Statuses after which no further events should be produced.
    pub fn is_terminal_status(&self) -> bool {
        matches!(
            self.call_status.as_deref(),
            Some("completed") | Some("failed") | Some("busy") | Some("no-answer") | Some("canceled")
        )
    }
}

// ── Signature check ────────────────────────────────────────────────

type HmacSha256 = Hmac<Sha256>;

/// Verify the hex HMAC-SHA256 of the raw webhook body against the shared
/// secret. Comparison is constant-time via the mac's own verifier.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Sign a body the way `verify_signature` expects. Test and tooling helper.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}
