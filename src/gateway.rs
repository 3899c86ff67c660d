//! Axum-based HTTP gateway: telephony webhooks, the duplex media socket,
//! and artifact playback.
//!
//! Routes:
//! - `POST /voice` — inbound call webhook; also the re-entry point after a
//!   media stream leg ends
//! - `POST /voice/collect` — speech capture callback
//! - `POST /voice/status` — call status callback
//! - `GET /media` — websocket carrying the platform's media stream frames
//! - `GET /audio/{key}` — playback of synthesized artifacts
//! - `GET /health`, `GET /metrics`
//!
//! Webhook handlers read the raw body so the signature check covers the
//! exact bytes the platform signed. Body limits and request timeouts sit
//! on the whole router; the media socket is exempt from the timeout by
//! virtue of upgrading before it fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::backend::{OpenAiChat, OpenAiRealtime, OpenAiSpeech};
use crate::config::Config;
use crate::error::SessionError;
use crate::locale::{LanguageDetector, Locale};
use crate::metrics::Metrics;
use crate::relay::RelayInput;
use crate::session::manager::StreamChannels;
use crate::session::{SessionManager, TurnController};
use crate::synthesis::SynthesisDispatcher;
use crate::telephony::twiml::{self, say_voice, TwimlContext};
use crate::telephony::{verify_signature, CallEvent, Instruction, StreamFrame, VoiceWebhook};

/// Maximum request body size (64KB). Webhook forms are tiny; anything
/// bigger is not the platform.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Webhook turn deadline (30s); a chat completion must land inside it.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// How long a fresh media socket may sit silent before its start frame.
pub const START_WAIT_SECS: u64 = 5;
/// Header carrying the hex HMAC of the webhook body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// How often idle and over-age sessions are swept.
const SESSION_SWEEP_INTERVAL_SECS: u64 = 15;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    manager: Arc<SessionManager>,
    synthesis: Arc<SynthesisDispatcher>,
    metrics: Arc<Metrics>,
}

/// Which webhook route a form body arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebhookKind {
    Voice,
    Collect,
    Status,
}

impl WebhookKind {
    fn as_str(self) -> &'static str {
        match self {
            WebhookKind::Voice => "voice",
            WebhookKind::Collect => "collect",
            WebhookKind::Status => "status",
        }
    }
}

/// Map a parsed webhook to the session event it stands for. `None` means
/// the webhook needs no session work (non-terminal status pings).
fn event_for(kind: WebhookKind, hook: VoiceWebhook) -> Option<CallEvent> {
    let call_id = hook.call_sid.clone();
    match kind {
        WebhookKind::Voice => Some(if hook.is_terminal_status() {
            CallEvent::Ended { call_id }
        } else {
            CallEvent::Started {
                call_id,
                caller: hook.from,
            }
        }),
        WebhookKind::Collect => Some(match hook.captured_input() {
            Some(text) => CallEvent::Utterance { call_id, text },
            None => CallEvent::InputTimeout { call_id },
        }),
        WebhookKind::Status => hook
            .is_terminal_status()
            .then_some(CallEvent::Ended { call_id }),
    }
}

/// Signature check over the raw body bytes. No configured secret means
/// the check is off.
fn signature_ok(secret: Option<&str>, headers: &HeaderMap, body: &str) -> bool {
    let Some(secret) = secret else { return true };
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    verify_signature(secret, body.as_bytes(), provided)
}

fn primary_locale(config: &Config) -> Locale {
    Locale::from_tag(&config.locales.primary).unwrap_or(Locale::En)
}

fn xml_response(xml: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml; charset=utf-8")], xml).into_response()
}

// ── Webhook handlers ───────────────────────────────────────────────

async fn handle_voice(State(state): State<AppState>, headers: HeaderMap, body: String) -> Response {
    webhook_turn(state, headers, body, WebhookKind::Voice).await
}

async fn handle_collect(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    webhook_turn(state, headers, body, WebhookKind::Collect).await
}

async fn handle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    webhook_turn(state, headers, body, WebhookKind::Status).await
}

async fn webhook_turn(
    state: AppState,
    headers: HeaderMap,
    body: String,
    kind: WebhookKind,
) -> Response {
    if !signature_ok(
        state.config.gateway.webhook_secret.as_deref(),
        &headers,
        &body,
    ) {
        tracing::warn!(kind = kind.as_str(), "webhook signature rejected");
        return StatusCode::FORBIDDEN.into_response();
    }
    let hook: VoiceWebhook = match serde_urlencoded::from_str(&body) {
        Ok(hook) => hook,
        Err(e) => {
            tracing::warn!(kind = kind.as_str(), error = %e, "unparseable webhook body");
            return (StatusCode::BAD_REQUEST, "bad webhook body").into_response();
        }
    };
    if hook.call_sid.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing CallSid").into_response();
    }

    let Some(event) = event_for(kind, hook) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let call_id = event.call_id().to_owned();
    match state.manager.handle_event(event).await {
        Ok(Some(instruction)) => instruction_response(&state, &call_id, &instruction).await,
        Ok(None) => xml_response(twiml::empty_response()),
        Err(SessionError::AtCapacity(active)) => {
            tracing::warn!(active, "turning a caller away at capacity");
            busy_response(&state)
        }
        Err(e) => {
            tracing::warn!(call_id = %call_id, error = %e, "webhook for an unusable call");
            xml_response(twiml::empty_response())
        }
    }
}

async fn instruction_response(
    state: &AppState,
    call_id: &str,
    instruction: &Instruction,
) -> Response {
    let locale = match state.manager.snapshot(call_id).await {
        Some((_, _, locale)) => locale,
        None => primary_locale(&state.config),
    };
    let ctx = TwimlContext {
        public_url: &state.config.gateway.public_url,
        call_id,
        locale,
        farewell: state.manager.phrases().farewell(locale),
        gather_timeout_secs: state.config.gateway.gather_timeout_secs,
    };
    match twiml::render(instruction, &ctx) {
        Ok(xml) => xml_response(xml),
        Err(e) => {
            tracing::error!(call_id = %call_id, error = %e, "twiml render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Polite turn-away when the registry is full.
fn busy_response(state: &AppState) -> Response {
    let locale = primary_locale(&state.config);
    let instruction = Instruction::Speak {
        text: state.manager.phrases().busy(locale).to_owned(),
        voice: say_voice(locale).to_owned(),
        locale,
        expects_reply: false,
    };
    let ctx = TwimlContext {
        public_url: &state.config.gateway.public_url,
        call_id: "",
        locale,
        farewell: state.manager.phrases().farewell(locale),
        gather_timeout_secs: state.config.gateway.gather_timeout_secs,
    };
    match twiml::render(&instruction, &ctx) {
        Ok(xml) => xml_response(xml),
        Err(_) => xml_response(twiml::empty_response()),
    }
}

// ── Artifact playback ──────────────────────────────────────────────

async fn handle_audio(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.synthesis.fetch(&key) {
        Some(artifact) => (
            [(header::CONTENT_TYPE, artifact.content_type)],
            artifact.bytes.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ── Health and metrics ─────────────────────────────────────────────

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_calls": state.manager.active_calls(),
        "cached_artifacts": state.synthesis.cached_len(),
    }))
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.export() {
        Ok(text) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metrics export failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ── Media socket ───────────────────────────────────────────────────

async fn handle_media_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_media_connection(socket, state))
}

/// Pump one media socket: wait for the start frame, attach the relay,
/// then shuttle frames both ways until either side closes.
async fn handle_media_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Some((call_id, stream_sid)) = wait_for_start(&mut receiver).await else {
        tracing::warn!("media socket closed before a usable start frame");
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    let StreamChannels { input, mut output } =
        match state.manager.attach_stream(&call_id, stream_sid).await {
            Ok(channels) => channels,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "media stream rejected");
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        };

    let send_task = tokio::spawn(async move {
        while let Some(frame) = output.recv().await {
            match frame.to_json() {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "unserializable outbound frame"),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let relay_input = match StreamFrame::parse(text.as_str()) {
                    Ok(frame) => RelayInput::Frame(frame),
                    Err(e) => RelayInput::Malformed(e.to_string()),
                };
                if input.send(relay_input).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Dropping the inbound leg tells the relay the socket is gone.
    drop(input);
    let _ = send_task.await;
    tracing::debug!(call_id = %call_id, "media socket disconnected");
}

/// Scan the opening frames for `start`; `connected` and anything else
/// ahead of it is skipped. Returns the bound call id and stream sid.
async fn wait_for_start(receiver: &mut SplitStream<WebSocket>) -> Option<(String, String)> {
    tokio::time::timeout(Duration::from_secs(START_WAIT_SECS), async {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(frame) = StreamFrame::parse(text.as_str()) else {
                continue;
            };
            if let StreamFrame::Start { stream_sid, .. } = &frame {
                let sid = stream_sid.clone();
                let call_id = frame.bound_call_id()?.to_owned();
                return Some((call_id, sid));
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

// ── Router and startup ─────────────────────────────────────────────

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/voice", post(handle_voice))
        .route("/voice/collect", post(handle_collect))
        .route("/voice/status", post(handle_status))
        .route("/audio/{key}", get(handle_audio))
        .route("/media", get(handle_media_ws))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    config.validate()?;

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();
    let display_addr = format!("{host}:{actual_port}");

    let api_key = config.chat.resolve_api_key().ok_or_else(|| {
        anyhow::anyhow!(
            "no API key: set {} or [chat] api_key in config.toml",
            config.chat.api_key_env
        )
    })?;

    let primary = Locale::from_tag(&config.locales.primary).ok_or_else(|| {
        anyhow::anyhow!("unsupported primary locale: {}", config.locales.primary)
    })?;
    let detector = Arc::new(
        LanguageDetector::new(primary, config.locales.min_confidence)?
            .restrict_to(&config.enabled_locales()),
    );

    let chat = Arc::new(OpenAiChat::new(&config.chat, api_key.clone())?);
    let speech = Arc::new(OpenAiSpeech::new(&config.synthesis, api_key.clone())?);
    let realtime = Arc::new(OpenAiRealtime::new(&config.realtime, api_key));

    let metrics = Arc::new(Metrics::new()?);
    let turns = Arc::new(TurnController::new(
        &config,
        Arc::clone(&detector),
        chat,
    )?);
    let synthesis = Arc::new(SynthesisDispatcher::new(
        &config.synthesis,
        speech,
        Arc::clone(&metrics),
    ));

    let config = Arc::new(config);
    let manager = Arc::new(SessionManager::new(
        (*config).clone(),
        detector,
        turns,
        Arc::clone(&synthesis),
        realtime,
        Arc::clone(&metrics),
    ));

    // Artifact reaper: drops expired cache entries, never pinned ones.
    {
        let synthesis = Arc::clone(&synthesis);
        let manager = Arc::clone(&manager);
        let every = Duration::from_secs(config.synthesis.reaper_interval_secs.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                let removed = synthesis.sweep_expired(&manager.pinned_keys());
                if removed > 0 {
                    tracing::debug!(removed, "expired synthesis artifacts reaped");
                }
            }
        });
    }

    // Session sweeper: idle and over-age calls get ended, ended ones
    // purged after their grace window.
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
            loop {
                tick.tick().await;
                manager.sweep().await;
            }
        });
    }

    let state = AppState {
        config: Arc::clone(&config),
        manager,
        synthesis,
        metrics,
    };
    let app = build_router(state);

    println!("📞 Switchboard gateway listening on http://{display_addr}");
    if !config.gateway.public_url.is_empty() {
        println!("  🌐 Public URL: {}", config.gateway.public_url);
    }
    println!("  POST /voice          — inbound call webhook");
    println!("  POST /voice/collect  — speech capture callback");
    println!("  POST /voice/status   — call status callback");
    println!("  WS   /media          — duplex media stream");
    println!("  GET  /audio/{{key}}    — synthesized audio playback");
    println!("  GET  /health    — health check");
    println!("  GET  /metrics   — Prometheus metrics");
    if config.gateway.webhook_secret.is_some() {
        println!("  🔐 Webhook signatures: REQUIRED ({SIGNATURE_HEADER})");
    } else {
        println!("  ⚠️  Webhook signatures: DISABLED (all requests accepted)");
    }
    println!("  Press Ctrl+C to stop.\n");

    axum::serve(listener, app).await?;

    Ok(())
}
