//! Duplex media relay between a telephony stream and a realtime session.
//!
//! ```text
//!  platform ws ──frames──▶ relay ──AudioB64──▶ realtime backend
//!  platform ws ◀──media─── relay ◀──deltas──── realtime backend
//! ```
//!
//! Audio is G.711 mu-law base64 on both legs, so payloads pass through
//! without transcoding. The relay owns the session while streaming:
//! it triggers the greeting once the backend is ready, watches caller
//! transcripts for language switches and closing phrases, clears the
//! carrier's playback buffer on barge-in, and polices malformed frames.
//! Whichever leg ends first, both are closed jointly with a bounded
//! grace period for in-flight frames.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{RealtimeCommand, RealtimeEvent, RealtimeHandle};
use crate::error::FailureKind;
use crate::locale::{LanguageDetector, Locale};
use crate::metrics::Metrics;
use crate::session::TurnController;
use crate::synthesis::SynthesisDispatcher;
use crate::telephony::StreamFrame;

/// Malformed frames tolerated before the stream is declared broken.
const MAX_PROTOCOL_STRIKES: u32 = 3;

/// What the gateway socket reader feeds the relay.
#[derive(Debug)]
pub enum RelayInput {
    Frame(StreamFrame),
    /// Text that did not parse as a stream frame.
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEndReason {
    /// The platform sent `stop`; the caller hung up.
    CallerHangup,
    /// The caller said a closing phrase; wind down politely.
    ClosingIntent,
    /// The realtime backend closed its leg mid-call.
    BackendClosed,
    /// Too many malformed frames from the platform.
    ProtocolError,
    /// The gateway socket went away without a `stop`.
    TransportClosed,
    /// The session manager cancelled the call.
    Cancelled,
}

impl RelayEndReason {
    /// The failure this end reason counts as, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RelayEndReason::BackendClosed => Some(FailureKind::BackendUnavailable),
            RelayEndReason::ProtocolError => Some(FailureKind::StreamProtocolError),
            RelayEndReason::TransportClosed => Some(FailureKind::TransportClosed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEndReason::CallerHangup => "caller_hangup",
            RelayEndReason::ClosingIntent => "closing_intent",
            RelayEndReason::BackendClosed => "backend_closed",
            RelayEndReason::ProtocolError => "protocol_error",
            RelayEndReason::TransportClosed => "transport_closed",
            RelayEndReason::Cancelled => "cancelled",
        }
    }
}

/// Summary handed back to the session manager when the pump stops.
#[derive(Debug)]
pub struct RelayOutcome {
    pub reason: RelayEndReason,
    pub final_locale: Locale,
    pub turns_completed: u64,
    pub frames_in: u64,
    pub frames_out: u64,
}

pub struct MediaRelay {
    call_id: String,
    stream_sid: String,
    locale: Locale,
    detector: Arc<LanguageDetector>,
    turns: Arc<TurnController>,
    synthesis: Arc<SynthesisDispatcher>,
    close_grace: Duration,
    metrics: Arc<Metrics>,
}

impl MediaRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: String,
        stream_sid: String,
        locale: Locale,
        detector: Arc<LanguageDetector>,
        turns: Arc<TurnController>,
        synthesis: Arc<SynthesisDispatcher>,
        close_grace: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            call_id,
            stream_sid,
            locale,
            detector,
            turns,
            synthesis,
            close_grace,
            metrics,
        }
    }

    /// Pump frames until one leg ends, then close both jointly.
    pub async fn run(
        mut self,
        mut platform_rx: mpsc::Receiver<RelayInput>,
        platform_tx: mpsc::Sender<StreamFrame>,
        realtime: RealtimeHandle,
        cancel: CancellationToken,
    ) -> RelayOutcome {
        let RealtimeHandle {
            command_tx,
            mut event_rx,
        } = realtime;

        let mut frames_in: u64 = 0;
        let mut frames_out: u64 = 0;
        let mut turns_completed: u64 = 0;
        let mut strikes: u32 = 0;
        let mut greeted = false;

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break RelayEndReason::Cancelled,

                input = platform_rx.recv() => match input {
                    None => break RelayEndReason::TransportClosed,
                    Some(RelayInput::Malformed(detail)) => {
                        strikes += 1;
                        tracing::warn!(
                            call_id = %self.call_id,
                            strikes,
                            detail = %detail,
                            "malformed stream frame"
                        );
                        if strikes >= MAX_PROTOCOL_STRIKES {
                            break RelayEndReason::ProtocolError;
                        }
                    }
                    Some(RelayInput::Frame(frame)) => match frame {
                        StreamFrame::Media { media, .. } => {
                            frames_in += 1;
                            if command_tx
                                .send(RealtimeCommand::AudioB64(media.payload))
                                .await
                                .is_err()
                            {
                                break RelayEndReason::BackendClosed;
                            }
                        }
                        StreamFrame::Stop { .. } => break RelayEndReason::CallerHangup,
                        StreamFrame::Connected { .. } | StreamFrame::Mark { .. } => {}
                        StreamFrame::Start { .. } | StreamFrame::Clear { .. } => {
                            // Neither belongs mid-stream on the inbound leg.
                            strikes += 1;
                            if strikes >= MAX_PROTOCOL_STRIKES {
                                break RelayEndReason::ProtocolError;
                            }
                        }
                    },
                },

                event = event_rx.recv() => match event {
                    None | Some(RealtimeEvent::Closed) => break RelayEndReason::BackendClosed,
                    Some(RealtimeEvent::Ready) => {
                        if !greeted {
                            greeted = true;
                            if command_tx
                                .send(RealtimeCommand::TriggerResponse)
                                .await
                                .is_err()
                            {
                                break RelayEndReason::BackendClosed;
                            }
                        }
                    }
                    Some(RealtimeEvent::AudioB64 { payload }) => {
                        frames_out += 1;
                        if platform_tx
                            .send(StreamFrame::media_out(&self.stream_sid, payload))
                            .await
                            .is_err()
                        {
                            break RelayEndReason::TransportClosed;
                        }
                    }
                    Some(RealtimeEvent::InputTranscript { text }) => {
                        if self.turns.is_closing(&text) {
                            tracing::info!(call_id = %self.call_id, "caller closed the conversation");
                            break RelayEndReason::ClosingIntent;
                        }
                        if let Some(new_locale) = self.detector.switch_for(self.locale, &text) {
                            self.switch_language(&command_tx, new_locale).await;
                        }
                    }
                    Some(RealtimeEvent::ResponseDone) => {
                        turns_completed += 1;
                        self.metrics.turns_completed.inc();
                    }
                    Some(RealtimeEvent::Interrupted) => {
                        // Barge-in: drop whatever the carrier has buffered.
                        if platform_tx
                            .send(StreamFrame::clear(&self.stream_sid))
                            .await
                            .is_err()
                        {
                            break RelayEndReason::TransportClosed;
                        }
                    }
                    Some(RealtimeEvent::Error { message }) => {
                        tracing::warn!(call_id = %self.call_id, error = %message, "realtime session error");
                    }
                },
            }
        };

        // Joint close: tell the backend to stop, then give in-flight frames
        // a bounded window to drain. The farewell tail is still forwarded
        // when the caller ended the conversation themselves.
        let forward_tail = reason == RelayEndReason::ClosingIntent;
        let _ = command_tx.send(RealtimeCommand::Close).await;
        let deadline = tokio::time::sleep(self.close_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = event_rx.recv() => match event {
                    None | Some(RealtimeEvent::Closed) => break,
                    Some(RealtimeEvent::AudioB64 { payload }) if forward_tail => {
                        frames_out += 1;
                        if platform_tx
                            .send(StreamFrame::media_out(&self.stream_sid, payload))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(_) => {}
                },
            }
        }

        self.metrics.add_relay_frames(frames_in, frames_out);
        tracing::info!(
            call_id = %self.call_id,
            reason = reason.as_str(),
            locale = %self.locale,
            turns = turns_completed,
            frames_in,
            frames_out,
            "media relay stopped"
        );

        RelayOutcome {
            reason,
            final_locale: self.locale,
            turns_completed,
            frames_in,
            frames_out,
        }
    }

    async fn switch_language(
        &mut self,
        command_tx: &mpsc::Sender<RealtimeCommand>,
        new_locale: Locale,
    ) {
        tracing::info!(
            call_id = %self.call_id,
            from = %self.locale,
            to = %new_locale,
            "stream language switched"
        );
        self.locale = new_locale;
        let instructions = self
            .turns
            .system_instructions(new_locale, Local::now());
        let voice = self.synthesis.voice_for(new_locale).to_owned();
        let _ = command_tx
            .send(RealtimeCommand::UpdateInstructions { instructions, voice })
            .await;
    }
}
