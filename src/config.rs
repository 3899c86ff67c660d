//! Configuration: one TOML file, env-var API keys, serde defaults.
//!
//! Resolution order for the file path: explicit `--config`, then
//! `SWITCHBOARD_CONFIG`, then the platform config dir
//! (`~/.config/switchboard/switchboard.toml` on Linux). A missing default
//! file is not an error, but validation still applies: realtime streaming
//! needs `gateway.public_url`, so a bare default config only passes with
//! realtime disabled.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub session: SessionConfig,
    pub chat: ChatConfig,
    pub synthesis: SynthesisConfig,
    pub realtime: RealtimeConfig,
    pub locales: LocalesConfig,
    pub business: BusinessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, e.g. "https://calls.example.com".
    /// Webhook actions, artifact URLs, and the media stream endpoint are
    /// built from it.
    pub public_url: String,
    /// Shared secret for webhook signature checks. Unset disables the check.
    pub webhook_secret: Option<String>,
    /// Seconds the capture verb waits for speech before posting back empty.
    pub gather_timeout_secs: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            public_url: String::new(),
            webhook_secret: None,
            gather_timeout_secs: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Failures tolerated at a tier before the policy stops retrying.
    pub retry_threshold: u32,
    /// Tier drops permitted within one call.
    pub max_downgrades: u32,
    /// Caller/assistant turns kept in the outbound prompt window.
    pub history_window: usize,
    pub idle_timeout_secs: u64,
    /// How long an ended session stays queryable before purge.
    pub ended_grace_secs: u64,
    pub max_call_secs: u64,
    pub max_active_calls: usize,
    /// Static replies served on the text-only tier before a polite goodbye.
    pub textonly_reply_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_threshold: 2,
            max_downgrades: 2,
            history_window: 12,
            idle_timeout_secs: 120,
            ended_grace_secs: 60,
            max_call_secs: 1800,
            max_active_calls: 64,
            textonly_reply_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub api_url: String,
    pub model: String,
    /// Env var holding the API key; `api_key` in the file overrides it.
    pub api_key_env: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            api_key: None,
            timeout_ms: 12_000,
            max_tokens: 256,
            temperature: 0.4,
        }
    }
}

impl ChatConfig {
    /// File value wins; falls back to the configured env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub api_url: String,
    pub model: String,
    /// Default synthesis voice; per-locale overrides keyed by language code.
    pub voice: String,
    pub voice_overrides: HashMap<String, String>,
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub reaper_interval_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/audio/speech".into(),
            model: "gpt-4o-mini-tts".into(),
            voice: "alloy".into(),
            voice_overrides: HashMap::new(),
            timeout_ms: 8_000,
            cache_ttl_secs: 600,
            reaper_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Realtime streaming is the top tier when enabled; otherwise calls
    /// start at record-and-respond.
    pub enabled: bool,
    pub ws_url: String,
    pub model: String,
    pub voice: String,
    /// Budget for closing the counterpart socket once one side ends.
    pub close_grace_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ws_url: "wss://api.openai.com/v1/realtime".into(),
            model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
            close_grace_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalesConfig {
    /// Language every call starts in ("en", "es", ...).
    pub primary: String,
    /// Marker hits required before the session language switches.
    pub min_confidence: u32,
    /// Languages the detector may switch a call to. Empty means every
    /// supported language; the primary is always allowed.
    pub enabled: Vec<String>,
}

impl Default for LocalesConfig {
    fn default() -> Self {
        Self {
            primary: "en".into(),
            min_confidence: 2,
            enabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessConfig {
    /// Name spoken in greetings and injected into model instructions.
    pub name: String,
    /// Facts restated in every regenerated system turn (hours, address...).
    pub facts: Vec<String>,
    /// Per-language phrase replacements, keyed by language code
    /// (`[business.phrases.es]`). Anything left unset keeps the built-in
    /// wording for that language.
    pub phrases: HashMap<String, PhraseOverrides>,
}

impl Default for BusinessConfig {
    fn default() -> Self {
        Self {
            name: "this office".into(),
            facts: Vec::new(),
            phrases: HashMap::new(),
        }
    }
}

/// Replacement text for one language's canned phrases. `{name}` inside
/// any value is substituted with the business name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhraseOverrides {
    pub greeting: Option<String>,
    pub reprompts: Option<Vec<String>>,
    pub downgrade_notice: Option<String>,
    pub busy: Option<String>,
    pub apology: Option<String>,
    pub farewell: Option<String>,
    pub textonly_reply: Option<String>,
}

impl Config {
    /// Load from an explicit path, `SWITCHBOARD_CONFIG`, or the platform
    /// default location. Only an explicit-but-missing path is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let explicit = path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var("SWITCHBOARD_CONFIG").ok().map(PathBuf::from));

        let (resolved, required) = match explicit {
            Some(p) => {
                let expanded = shellexpand::tilde(&p.to_string_lossy()).into_owned();
                (PathBuf::from(expanded), true)
            }
            None => (Self::default_path(), false),
        };

        if !resolved.exists() {
            if required {
                anyhow::bail!("config file not found: {}", resolved.display());
            }
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }

        let raw = std::fs::read_to_string(&resolved)
            .with_context(|| format!("reading config file {}", resolved.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", resolved.display()))?;
        config.validate()?;
        tracing::debug!(path = %resolved.display(), "configuration loaded");
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "switchboard", "switchboard")
            .map(|dirs| dirs.config_dir().join("switchboard.toml"))
            .unwrap_or_else(|| PathBuf::from("switchboard.toml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.realtime.enabled && self.gateway.public_url.trim().is_empty() {
            anyhow::bail!(
                "gateway.public_url must be set when realtime streaming is enabled \
                 (the media stream endpoint is built from it)"
            );
        }
        if self.session.retry_threshold == 0 {
            anyhow::bail!("session.retry_threshold must be at least 1");
        }
        if self.chat.timeout_ms == 0 || self.synthesis.timeout_ms == 0 {
            anyhow::bail!("backend timeouts must be non-zero");
        }
        if self.session.history_window < 2 {
            anyhow::bail!("session.history_window must keep at least one exchange");
        }
        if crate::locale::Locale::from_tag(&self.locales.primary).is_none() {
            anyhow::bail!("locales.primary is not a supported language: {}", self.locales.primary);
        }
        for tag in &self.locales.enabled {
            if crate::locale::Locale::from_tag(tag).is_none() {
                anyhow::bail!("locales.enabled lists an unsupported language: {tag}");
            }
        }
        for tag in self.business.phrases.keys() {
            if crate::locale::Locale::from_tag(tag).is_none() {
                anyhow::bail!("business.phrases is keyed by an unsupported language: {tag}");
            }
        }
        Ok(())
    }

    pub fn primary_locale(&self) -> crate::locale::Locale {
        crate::locale::Locale::from_tag(&self.locales.primary)
            .unwrap_or(crate::locale::Locale::En)
    }

    /// Languages the detector may switch to; empty when unrestricted.
    /// Unknown tags were already rejected by `validate`.
    pub fn enabled_locales(&self) -> Vec<crate::locale::Locale> {
        self.locales
            .enabled
            .iter()
            .filter_map(|tag| crate::locale::Locale::from_tag(tag))
            .collect()
    }

    /// wss endpoint the platform should open its media stream against.
    pub fn media_stream_url(&self) -> String {
        let base = self.gateway.public_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/media")
    }

    pub fn artifact_url(&self, key: &str) -> String {
        format!("{}/audio/{key}", self.gateway.public_url.trim_end_matches('/'))
    }

    pub fn collect_action_url(&self) -> String {
        format!("{}/voice/collect", self.gateway.public_url.trim_end_matches('/'))
    }

    pub fn voice_webhook_url(&self) -> String {
        format!("{}/voice", self.gateway.public_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_toml() -> &'static str {
        r#"
            [gateway]
            host = "127.0.0.1"
            port = 9000
            public_url = "https://calls.example.com"

            [session]
            retry_threshold = 3

            [locales]
            primary = "es"
            enabled = ["es", "en"]

            [business]
            name = "Casa Mia"
            facts = ["Open 9-17", "Closed Sundays"]

            [business.phrases.es]
            greeting = "Casa Mia, buenas. ¿Dígame?"
            farewell = "Gracias por llamar a {name}. Hasta pronto."
        "#
    }

    #[test]
    fn defaults_are_usable_when_realtime_disabled() {
        let mut config = Config::default();
        config.realtime.enabled = false;
        assert!(config.validate().is_ok());
        assert_eq!(config.session.retry_threshold, 2);
        assert_eq!(config.session.max_downgrades, 2);
        assert_eq!(config.primary_locale(), crate::locale::Locale::En);
    }

    #[test]
    fn realtime_requires_public_url() {
        let config = Config::default();
        assert!(config.realtime.enabled);
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(valid_toml().as_bytes()).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.session.retry_threshold, 3);
        assert_eq!(config.primary_locale(), crate::locale::Locale::Es);
        assert_eq!(
            config.enabled_locales(),
            vec![crate::locale::Locale::Es, crate::locale::Locale::En]
        );
        assert_eq!(config.business.name, "Casa Mia");
        let es = &config.business.phrases["es"];
        assert_eq!(es.greeting.as_deref(), Some("Casa Mia, buenas. ¿Dígame?"));
        assert!(es.reprompts.is_none());
        // Untouched sections keep their defaults.
        assert_eq!(config.chat.model, "gpt-4o-mini");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn rejects_unknown_primary_locale() {
        let mut config = Config::default();
        config.realtime.enabled = false;
        config.locales.primary = "xx".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_enabled_locale() {
        let mut config = Config::default();
        config.realtime.enabled = false;
        config.locales.enabled = vec!["es".into(), "xx".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_phrase_overrides_for_unknown_locale() {
        let mut config = Config::default();
        config.realtime.enabled = false;
        config
            .business
            .phrases
            .insert("zz".into(), PhraseOverrides::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn media_stream_url_swaps_scheme() {
        let mut config = Config::default();
        config.gateway.public_url = "https://calls.example.com/".into();
        assert_eq!(config.media_stream_url(), "wss://calls.example.com/media");
        config.gateway.public_url = "http://localhost:8080".into();
        assert_eq!(config.media_stream_url(), "ws://localhost:8080/media");
    }

    #[test]
    fn artifact_and_action_urls() {
        let mut config = Config::default();
        config.gateway.public_url = "https://calls.example.com".into();
        assert_eq!(
            config.artifact_url("abc123"),
            "https://calls.example.com/audio/abc123"
        );
        assert_eq!(
            config.collect_action_url(),
            "https://calls.example.com/voice/collect"
        );
    }

    #[test]
    fn api_key_prefers_file_over_env() {
        let mut chat = ChatConfig::default();
        chat.api_key = Some("sk-file".into());
        assert_eq!(chat.resolve_api_key().as_deref(), Some("sk-file"));
        chat.api_key = Some("   ".into());
        chat.api_key_env = "SWITCHBOARD_TEST_KEY_UNSET".into();
        assert_eq!(chat.resolve_api_key(), None);
    }
}
