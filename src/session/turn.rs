//! Turn control: history discipline, prompt assembly, closing intent.
//!
//! The system turn is regenerated before every backend call so date, time,
//! business facts, and the session language are always current. History
//! holds exactly one system turn at index 0; caller and assistant turns
//! alternate after it. The outbound prompt is a window (system turn plus
//! the most recent turns), never the unbounded history.
//!
//! Closing phrases ("goodbye", "adiós", "au revoir"...) are detected
//! locally so a farewell costs zero backend calls.

use crate::backend::{BackendError, ChatBackend, ChatTurn, Role};
use crate::config::Config;
use crate::locale::{normalize, LanguageDetector, Locale};
use crate::session::CallSession;
use aho_corasick::AhoCorasick;
use chrono::{DateTime, Local};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TurnError {
    /// Caller said a closing phrase; hang up without a backend call.
    #[error("caller signalled the end of the conversation")]
    ClosingIntent,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Word-boundary closing phrases across all supported locales.
fn closing_phrases() -> Vec<String> {
    [
        // en
        "goodbye", "bye bye", "bye now", "that s all", "that is all", "thank you goodbye",
        "thanks goodbye", "hang up", "nothing else thanks",
        // es
        "adiós", "adios", "hasta luego", "eso es todo", "nada más",
        // fr
        "au revoir", "c est tout", "rien d autre",
        // de
        "auf wiedersehen", "tschüss", "das ist alles", "das wäre alles",
        // it
        "arrivederci", "è tutto", "nient altro",
        // pt
        "tchau", "até logo", "é tudo", "mais nada",
    ]
    .iter()
    .map(|p| format!(" {p} "))
    .collect()
}

pub struct TurnController {
    detector: Arc<LanguageDetector>,
    chat: Arc<dyn ChatBackend>,
    closing: AhoCorasick,
    history_window: usize,
    business_name: String,
    business_facts: Vec<String>,
}

impl TurnController {
    pub fn new(
        config: &Config,
        detector: Arc<LanguageDetector>,
        chat: Arc<dyn ChatBackend>,
    ) -> anyhow::Result<Self> {
        let closing = AhoCorasick::new(closing_phrases())?;
        Ok(Self {
            detector,
            chat,
            closing,
            history_window: config.session.history_window,
            business_name: config.business.name.clone(),
            business_facts: config.business.facts.clone(),
        })
    }

    /// Local closing-intent check, no backend involved.
    pub fn is_closing(&self, text: &str) -> bool {
        self.closing.is_match(&normalize(text))
    }

    /// Model instructions carrying the wall clock, the business facts, and
    /// the language directive. Shared with the realtime stream setup.
    pub fn system_instructions(&self, locale: Locale, now: DateTime<Local>) -> String {
        let mut out = format!(
            "You are the voice assistant answering phone calls for {}.\n\
             Today is {} and the local time is {}.\n\
             Respond only in {}. Keep replies short and speakable, one or two sentences.\n\
             If the caller asks for something you cannot do, say so briefly.",
            self.business_name,
            now.format("%A, %B %-d, %Y"),
            now.format("%H:%M"),
            locale.display_name(),
        );
        if !self.business_facts.is_empty() {
            out.push_str("\nKey facts:");
            for fact in &self.business_facts {
                out.push_str("\n- ");
                out.push_str(fact);
            }
        }
        out
    }

    /// Rewrite the single system turn in place.
    pub fn refresh_system_turn(&self, session: &mut CallSession) {
        let text = self.system_instructions(session.locale, Local::now());
        match session.history.first_mut() {
            Some(first) if first.role == Role::System => first.text = text,
            _ => session.history.insert(0, ChatTurn::system(text)),
        }
    }

    /// System turn plus the trailing window; oldest exchanges fall off first.
    fn prompt_window(&self, history: &[ChatTurn]) -> Vec<ChatTurn> {
        if history.len() <= 1 {
            return history.to_vec();
        }
        let tail = &history[1..];
        let keep = tail.len().min(self.history_window);
        let mut prompt = Vec::with_capacity(keep + 1);
        prompt.push(history[0].clone());
        prompt.extend_from_slice(&tail[tail.len() - keep..]);
        prompt
    }

    /// Run one conversational turn. On success the caller and assistant
    /// turns are appended and the failure count resets; on backend failure
    /// history is left exactly as it was.
    pub async fn next_turn(
        &self,
        session: &mut CallSession,
        utterance: &str,
    ) -> Result<String, TurnError> {
        if self.is_closing(utterance) {
            tracing::info!(call_id = %session.id, "closing intent detected locally");
            return Err(TurnError::ClosingIntent);
        }

        if let Some(new_locale) = self.detector.switch_for(session.locale, utterance) {
            tracing::info!(
                call_id = %session.id,
                from = %session.locale,
                to = %new_locale,
                "session language switched"
            );
            session.locale = new_locale;
        }

        self.refresh_system_turn(session);
        session.history.push(ChatTurn::caller(utterance));
        let prompt = self.prompt_window(&session.history);

        match self.chat.complete(&prompt).await {
            Ok(reply) => {
                session.history.push(ChatTurn::assistant(reply.clone()));
                session.failure_count = 0;
                Ok(reply)
            }
            Err(e) => {
                session.history.pop();
                Err(TurnError::Backend(e))
            }
        }
    }
}
