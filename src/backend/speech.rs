//! Speech synthesis client.
//!
//! POSTs to an OpenAI-compatible `/audio/speech` endpoint and returns mp3
//! bytes for the artifact cache. The language is passed as a steering
//! instruction since the endpoint itself is voice-addressed, not
//! locale-addressed.

use super::{BackendError, SpeechBackend};
use crate::config::SynthesisConfig;
use crate::locale::Locale;
use async_trait::async_trait;
use std::time::Duration;

pub struct OpenAiSpeech {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    timeout_ms: u64,
}

impl OpenAiSpeech {
    pub fn new(config: &SynthesisConfig, api_key: String) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| BackendError::Transport(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
            timeout_ms: config.timeout_ms,
        })
    }
}

#[async_trait]
impl SpeechBackend for OpenAiSpeech {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        locale: Locale,
    ) -> Result<Vec<u8>, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "voice": voice,
            "input": text,
            "response_format": "mp3",
            "instructions": format!("Speak naturally in {}.", locale.display_name()),
        });

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout_ms)
                } else {
                    BackendError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail: String = detail.trim().chars().take(200).collect();
            return Err(BackendError::Http {
                status: status.as_u16(),
                detail,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        if bytes.is_empty() {
            return Err(BackendError::Protocol("empty audio body".into()));
        }
        Ok(bytes.to_vec())
    }
}
