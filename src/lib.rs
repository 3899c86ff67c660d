//! switchboard - Inbound call orchestration for small businesses.
//!
//! Telephony webhooks and media streams on one side; realtime voice,
//! chat, and speech-synthesis backends on the other. Every call runs on
//! the richest tier its backends can sustain and steps down, never up,
//! when they cannot.

pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod locale;
pub mod metrics;
pub mod relay;
pub mod session;
pub mod synthesis;
pub mod telephony;

pub use config::Config;
pub use error::{FailureKind, SessionError};
pub use locale::Locale;
pub use session::{SessionManager, SessionState, Tier};
