//! Conversational backends: chat completions, speech synthesis, and the
//! realtime voice socket.
//!
//! Each concern sits behind a trait so the session manager and the media
//! relay can be exercised with in-memory fakes. Production implementations
//! target OpenAI-compatible APIs and are built once at startup, never per
//! call.

pub mod chat;
pub mod realtime;
pub mod speech;

pub use chat::OpenAiChat;
pub use realtime::{
    OpenAiRealtime, RealtimeCommand, RealtimeEvent, RealtimeHandle, RealtimeSessionConfig,
};
pub use speech::OpenAiSpeech;

use crate::locale::Locale;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a backend call failed.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("backend returned HTTP {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("malformed backend response: {0}")]
    Protocol(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Who said a turn. Wire names are the chat-completions roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[serde(rename = "user")]
    Caller,
    Assistant,
}

impl Role {
    pub fn as_wire(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Caller => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
        }
    }

    pub fn caller(text: impl Into<String>) -> Self {
        Self {
            role: Role::Caller,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Text-in, text-out completion over a full prompt window.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String, BackendError>;
}

/// Text to spoken audio bytes.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        locale: Locale,
    ) -> Result<Vec<u8>, BackendError>;
}

/// Opens a realtime duplex voice session; returns the channel pair the
/// media relay pumps against.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(
        &self,
        config: RealtimeSessionConfig,
    ) -> Result<RealtimeHandle, BackendError>;
}
