//! Realtime voice backend over WebSocket.
//!
//! Speaks the OpenAI Realtime protocol, configured for telephony audio:
//! G.711 mu-law in and out, so media-stream payloads pass through the relay
//! with no transcoding. Input transcription is enabled purely to drive
//! language detection; the transcript text is never spoken back.
//!
//! ## Protocol
//!
//! 1. **Connect** — WebSocket to `{ws_url}?model=...` with auth headers
//! 2. **Configure** — one `session.update` (instructions, voice, formats, VAD)
//! 3. **Stream** — `input_audio_buffer.append` up, `response.audio.delta` down
//! 4. **Update** — further `session.update`s on language switch, no teardown
//! 5. **Close** — graceful close frame

use super::{BackendError, RealtimeConnector};
use crate::config::RealtimeConfig;
use crate::locale::Locale;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Channel depth for both directions; at 20 ms per telephony frame this
/// buffers several seconds of audio.
const CHANNEL_CAPACITY: usize = 256;

// ── Commands and events ────────────────────────────────────────────

/// What the relay can ask the backend session to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeCommand {
    /// Forward one base64 mu-law payload exactly as received.
    AudioB64(String),
    /// Re-issue session configuration, e.g. after a language switch.
    UpdateInstructions { instructions: String, voice: String },
    /// Ask the model to produce a response now (used for the greeting).
    TriggerResponse,
    /// Close the socket gracefully.
    Close,
}

/// What the backend session reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    /// Session configured; safe to trigger the greeting.
    Ready,
    /// One base64 mu-law audio delta for the telephony side.
    AudioB64 { payload: String },
    /// Completed transcription of caller speech.
    InputTranscript { text: String },
    /// The model finished a response turn.
    ResponseDone,
    /// Caller started speaking over the model.
    Interrupted,
    /// Backend error event.
    Error { message: String },
    /// Socket closed.
    Closed,
}

/// Per-call parameters for opening a session.
#[derive(Debug, Clone)]
pub struct RealtimeSessionConfig {
    pub call_id: String,
    pub voice: String,
    pub locale: Locale,
    pub instructions: String,
}

/// The channel pair a connected session exposes to the relay.
pub struct RealtimeHandle {
    pub command_tx: mpsc::Sender<RealtimeCommand>,
    pub event_rx: mpsc::Receiver<RealtimeEvent>,
}

// ── Connector ──────────────────────────────────────────────────────

/// Production connector; one value serves the whole process.
pub struct OpenAiRealtime {
    ws_url: String,
    model: String,
    api_key: String,
}

impl OpenAiRealtime {
    pub fn new(config: &RealtimeConfig, api_key: String) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            model: config.model.clone(),
            api_key,
        }
    }
}

#[async_trait]
impl RealtimeConnector for OpenAiRealtime {
    async fn connect(
        &self,
        config: RealtimeSessionConfig,
    ) -> Result<RealtimeHandle, BackendError> {
        let url = format!("{}?model={}", self.ws_url, self.model);
        let call_id = config.call_id.clone();

        tracing::info!(
            call_id = %call_id,
            model = %self.model,
            locale = %config.locale,
            "connecting realtime session"
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| BackendError::Transport(format!("building ws request: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| BackendError::Transport("invalid auth header".into()))?,
        );
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|_| BackendError::Transport("invalid beta header".into()))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BackendError::Transport(format!("realtime connect failed: {e}")))?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let ws_sender = Arc::new(Mutex::new(ws_sender));

        let (command_tx, command_rx) = mpsc::channel::<RealtimeCommand>(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<RealtimeEvent>(CHANNEL_CAPACITY);

        // Configure before any audio flows.
        let update = build_session_update(&config.instructions, &config.voice);
        let update_json = serde_json::to_string(&update)
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        {
            let mut sender = ws_sender.lock().await;
            sender
                .send(WsMessage::Text(update_json.into()))
                .await
                .map_err(|e| BackendError::Transport(format!("sending session.update: {e}")))?;
        }

        let sender_out = Arc::clone(&ws_sender);
        let cid_out = call_id.clone();
        tokio::spawn(async move {
            outbound_loop(command_rx, sender_out, cid_out).await;
        });

        let cid_in = call_id;
        tokio::spawn(async move {
            inbound_loop(ws_receiver, event_tx, cid_in).await;
        });

        Ok(RealtimeHandle {
            command_tx,
            event_rx,
        })
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;
type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn outbound_loop(
    mut rx: mpsc::Receiver<RealtimeCommand>,
    ws_sender: Arc<Mutex<WsSink>>,
    call_id: String,
) {
    let mut frames_sent: u64 = 0;

    while let Some(command) = rx.recv().await {
        let payloads: Vec<serde_json::Value> = match command {
            RealtimeCommand::AudioB64(b64) => {
                frames_sent += 1;
                if frames_sent == 1 {
                    tracing::debug!(call_id = %call_id, "first audio frame to realtime backend");
                }
                vec![serde_json::json!({
                    "type": "input_audio_buffer.append",
                    "audio": b64,
                })]
            }
            RealtimeCommand::UpdateInstructions {
                instructions,
                voice,
            } => {
                tracing::info!(call_id = %call_id, "re-issuing session configuration");
                vec![build_session_update(&instructions, &voice)]
            }
            RealtimeCommand::TriggerResponse => {
                vec![serde_json::json!({"type": "response.create"})]
            }
            RealtimeCommand::Close => {
                let mut sender = ws_sender.lock().await;
                let _ = sender.send(WsMessage::Close(None)).await;
                break;
            }
        };

        let mut failed = false;
        {
            let mut sender = ws_sender.lock().await;
            for payload in payloads {
                let Ok(json) = serde_json::to_string(&payload) else {
                    continue;
                };
                if sender.send(WsMessage::Text(json.into())).await.is_err() {
                    tracing::warn!(call_id = %call_id, "realtime send failed, closing outbound loop");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            break;
        }
    }

    tracing::debug!(call_id = %call_id, frames = frames_sent, "realtime outbound loop ended");
}

async fn inbound_loop(mut ws_receiver: WsSource, event_tx: mpsc::Sender<RealtimeEvent>, call_id: String) {
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                for event in parse_server_event(text.as_str(), &call_id) {
                    if event_tx.send(event).await.is_err() {
                        tracing::debug!(call_id = %call_id, "event receiver dropped, closing inbound loop");
                        return;
                    }
                }
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(call_id = %call_id, close_frame = ?frame, "realtime socket closed by backend");
                break;
            }
            Ok(_) => {
                // Binary frames are not part of the protocol; ping/pong is
                // handled by the websocket layer.
            }
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "realtime socket error");
                let _ = event_tx
                    .send(RealtimeEvent::Error {
                        message: format!("websocket error: {e}"),
                    })
                    .await;
                break;
            }
        }
    }
    let _ = event_tx.send(RealtimeEvent::Closed).await;
    tracing::debug!(call_id = %call_id, "realtime inbound loop ended");
}

// ── Wire payloads ──────────────────────────────────────────────────

/// Full session configuration. Audio stays G.711 mu-law end to end so the
/// relay never touches the payload bytes.
fn build_session_update(instructions: &str, voice: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "session.update",
        "session": {
            "instructions": instructions,
            "voice": voice,
            "input_audio_format": "g711_ulaw",
            "output_audio_format": "g711_ulaw",
            "input_audio_transcription": {
                "model": "gpt-4o-mini-transcribe"
            },
            "turn_detection": {
                "type": "server_vad",
                "silence_duration_ms": 500
            }
        }
    })
}

/// Map one server event to zero or more relay-facing events.
fn parse_server_event(json_text: &str, call_id: &str) -> Vec<RealtimeEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(RealtimeEvent::Error {
                message: format!("unparseable server event: {e}"),
            });
            return events;
        }
    };
    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "session.created" | "session.updated" => {
            tracing::debug!(call_id = %call_id, event_type, "realtime session configured");
            events.push(RealtimeEvent::Ready);
        }
        "response.audio.delta" => {
            if let Some(delta) = value.get("delta").and_then(|v| v.as_str()) {
                if !delta.is_empty() {
                    events.push(RealtimeEvent::AudioB64 {
                        payload: delta.to_string(),
                    });
                }
            }
        }
        "conversation.item.input_audio_transcription.completed" => {
            if let Some(text) = value.get("transcript").and_then(|v| v.as_str()) {
                let text = text.trim();
                if !text.is_empty() {
                    tracing::debug!(call_id = %call_id, transcript = %text, "caller transcript");
                    events.push(RealtimeEvent::InputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }
        "input_audio_buffer.speech_started" => {
            events.push(RealtimeEvent::Interrupted);
        }
        "response.done" => {
            events.push(RealtimeEvent::ResponseDone);
        }
        "error" => {
            let message = value
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown realtime error")
                .to_string();
            tracing::warn!(call_id = %call_id, error = %message, "realtime backend error");
            events.push(RealtimeEvent::Error { message });
        }
        _ => {
            // Transcript deltas, rate-limit notices and other chatter are
            // irrelevant to the relay.
        }
    }

    events
}
