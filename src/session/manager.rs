//! Session registry and per-call orchestration.
//!
//! One manager serves the whole process. Each call owns a slot whose
//! async mutex serializes that call's events while unrelated calls run
//! in parallel. Every event yields at most one instruction; transitions
//! happen before the instruction is returned, so a crash between the
//! two can only lose an instruction, never corrupt a session.
//!
//! Thinking and Speaking are held only while a handler is mid-turn.
//! An instruction that requests caller input leaves the session resting
//! in Listening; the platform's playback-then-capture happens between
//! events.
//!
//! ## Degraded operation
//!
//! Failures are counted into the session and judged by the policy:
//! retries reprompt on the same tier, downgrades re-greet on a lower
//! one, and termination says the apology line and ends the call. A
//! hangup can arrive while a turn is awaiting the backend; the slot's
//! `hung_up` flag is set before the hangup takes the session lock, so
//! the in-flight turn sees it afterwards and discards its result.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{RealtimeConnector, RealtimeSessionConfig};
use crate::config::Config;
use crate::error::{FailureKind, SessionError};
use crate::locale::{LanguageDetector, Locale};
use crate::metrics::Metrics;
use crate::relay::{MediaRelay, RelayInput, RelayOutcome};
use crate::session::turn::TurnError;
use crate::session::{
    CallSession, Decision, DegradationPolicy, PhraseBook, SessionState, Tier, TurnController,
};
use crate::synthesis::SynthesisDispatcher;
use crate::telephony::twiml::say_voice;
use crate::telephony::{CallEvent, Instruction};

// ── Registry slot ──────────────────────────────────────────────────

/// One registered call. The async mutex serializes event handling;
/// everything else is reachable without it so hangups and media frames
/// never queue behind a turn in flight.
struct CallSlot {
    session: tokio::sync::Mutex<CallSession>,
    /// Set before the hangup path takes the session lock.
    hung_up: AtomicBool,
    /// Inbound leg of the live relay, when one is attached.
    stream_in: parking_lot::Mutex<Option<mpsc::Sender<RelayInput>>>,
    /// Artifact key held against the cache reaper.
    pin: parking_lot::Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl CallSlot {
    fn new(session: CallSession) -> Self {
        Self {
            session: tokio::sync::Mutex::new(session),
            hung_up: AtomicBool::new(false),
            stream_in: parking_lot::Mutex::new(None),
            pin: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }
}

/// Channel pair handed to the gateway when a media stream attaches:
/// the socket reader feeds `input`, the socket writer drains `output`.
pub struct StreamChannels {
    pub input: mpsc::Sender<RelayInput>,
    pub output: mpsc::Receiver<crate::telephony::StreamFrame>,
}

// ── Manager ────────────────────────────────────────────────────────

pub struct SessionManager {
    config: Config,
    registry: RwLock<HashMap<String, Arc<CallSlot>>>,
    detector: Arc<LanguageDetector>,
    turns: Arc<TurnController>,
    synthesis: Arc<SynthesisDispatcher>,
    realtime: Arc<dyn RealtimeConnector>,
    policy: DegradationPolicy,
    phrases: PhraseBook,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(
        config: Config,
        detector: Arc<LanguageDetector>,
        turns: Arc<TurnController>,
        synthesis: Arc<SynthesisDispatcher>,
        realtime: Arc<dyn RealtimeConnector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let policy = DegradationPolicy::from_config(&config);
        let phrases = PhraseBook::new(&config.business);
        Self {
            config,
            registry: RwLock::new(HashMap::new()),
            detector,
            turns,
            synthesis,
            realtime,
            policy,
            phrases,
            metrics,
        }
    }

    /// Route one call event; at most one instruction comes back.
    pub async fn handle_event(
        &self,
        event: CallEvent,
    ) -> Result<Option<Instruction>, SessionError> {
        let call_id = event.call_id().to_owned();
        let result = match event {
            CallEvent::Started { call_id, caller } => self.on_started(call_id, caller).await,
            CallEvent::Utterance { call_id, text } => self.on_utterance(&call_id, text).await,
            CallEvent::InputTimeout { call_id } => self.on_input_timeout(&call_id).await,
            CallEvent::MediaFrame { call_id, frame } => {
                self.on_media_frame(&call_id, frame).await
            }
            CallEvent::Ended { call_id } => self.on_ended(&call_id).await,
        };
        if let Ok(Some(instruction)) = &result {
            tracing::debug!(
                call_id = %call_id,
                instruction = instruction.kind(),
                "instruction issued"
            );
        }
        result
    }

    // ── Event handlers ─────────────────────────────────────────────

    async fn on_started(
        &self,
        call_id: String,
        caller: Option<String>,
    ) -> Result<Option<Instruction>, SessionError> {
        let (slot, created) = {
            let mut registry = self.registry.write();
            match registry.get(&call_id) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    if registry.len() >= self.config.session.max_active_calls {
                        return Err(SessionError::AtCapacity(registry.len()));
                    }
                    let session = CallSession::new(
                        call_id.clone(),
                        caller,
                        self.top_tier(),
                        self.detector.default_locale(),
                    );
                    let slot = Arc::new(CallSlot::new(session));
                    registry.insert(call_id, Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        let mut session = slot.session.lock().await;
        if session.is_ended() {
            return Ok(None);
        }
        session.touch();

        if created {
            self.metrics.calls_started.inc();
            self.metrics.calls_active.inc();
            tracing::info!(
                call_id = %session.id,
                caller = session.caller.as_deref().unwrap_or("unknown"),
                tier = session.tier.as_str(),
                "call started"
            );
            return Ok(Some(self.greeting_for(&mut session)));
        }

        // Re-entry: the platform posts back after a capture or stream
        // verb finishes, or after our own redirect.
        if self.over_duration_cap(&session) {
            return Ok(Some(self.end_capped(&slot, &mut session)));
        }
        match session.state {
            SessionState::Greeting | SessionState::Degrading => {
                Ok(Some(self.greeting_for(&mut session)))
            }
            // The stream leg just ended but its outcome has not landed
            // yet; bounce the callback so the next one sees the result.
            SessionState::Streaming => Ok(Some(Instruction::Redirect {
                target: self.config.voice_webhook_url(),
            })),
            _ => Ok(Some(self.retry_prompt(&mut session))),
        }
    }

    async fn on_utterance(
        &self,
        call_id: &str,
        text: String,
    ) -> Result<Option<Instruction>, SessionError> {
        let slot = self.require(call_id)?;
        let mut session = slot.session.lock().await;
        if session.is_ended() {
            return Ok(None);
        }
        if self.over_duration_cap(&session) {
            return Ok(Some(self.end_capped(&slot, &mut session)));
        }
        session.touch();
        // The platform posts back only after the previous playback ran.
        session.pending_audio_ref = None;
        Self::sync_pin(&slot, &session);

        if session.tier == Tier::TextOnly {
            return Ok(Some(self.textonly_turn(&slot, &mut session, &text)));
        }

        session.state = SessionState::Thinking;
        let result = self.turns.next_turn(&mut session, &text).await;

        if slot.hung_up.load(Ordering::SeqCst) {
            tracing::debug!(call_id = %session.id, "turn finished after hangup, discarding");
            return Ok(None);
        }

        match result {
            Ok(reply) => {
                self.metrics.turns_completed.inc();
                Ok(Some(self.deliver_reply(&slot, &mut session, reply).await))
            }
            Err(TurnError::ClosingIntent) => {
                self.finish(&slot, &mut session);
                Ok(Some(Instruction::Hangup))
            }
            Err(TurnError::Backend(e)) => {
                tracing::warn!(call_id = %session.id, error = %e, "conversation backend failed");
                match self.apply_failure(&slot, &mut session, FailureKind::BackendUnavailable) {
                    Some(instruction) => Ok(Some(instruction)),
                    None => Ok(Some(self.retry_prompt(&mut session))),
                }
            }
        }
    }

    async fn on_input_timeout(&self, call_id: &str) -> Result<Option<Instruction>, SessionError> {
        let slot = self.require(call_id)?;
        let mut session = slot.session.lock().await;
        if session.is_ended() {
            return Ok(None);
        }
        if self.over_duration_cap(&session) {
            return Ok(Some(self.end_capped(&slot, &mut session)));
        }
        session.touch();
        session.pending_audio_ref = None;
        Self::sync_pin(&slot, &session);
        match self.apply_failure(&slot, &mut session, FailureKind::InputTimeout) {
            Some(instruction) => Ok(Some(instruction)),
            None => Ok(Some(self.retry_prompt(&mut session))),
        }
    }

    /// Media frames bypass the session lock entirely; they go straight
    /// to the relay's inbound channel.
    async fn on_media_frame(
        &self,
        call_id: &str,
        frame: crate::telephony::StreamFrame,
    ) -> Result<Option<Instruction>, SessionError> {
        let slot = self.require(call_id)?;
        let sender = slot.stream_in.lock().clone();
        if let Some(tx) = sender {
            if tx.send(RelayInput::Frame(frame)).await.is_err() {
                tracing::debug!(call_id, "relay gone, dropping media frame");
            }
        }
        Ok(None)
    }

    async fn on_ended(&self, call_id: &str) -> Result<Option<Instruction>, SessionError> {
        let Some(slot) = self.find(call_id) else {
            return Ok(None);
        };
        // Flag first: a turn already holding the lock must see this
        // once its backend call returns.
        slot.hung_up.store(true, Ordering::SeqCst);
        slot.cancel.cancel();
        let mut session = slot.session.lock().await;
        if !session.is_ended() {
            self.finish(&slot, &mut session);
        }
        Ok(None)
    }

    // ── Streaming ──────────────────────────────────────────────────

    /// Open the realtime leg and start the relay for an accepted media
    /// stream. Returns the channel pair the socket handler pumps. A
    /// rejected connection is counted as a failure; the platform's
    /// post-stream callback then picks up the downgraded greeting.
    pub async fn attach_stream(
        self: &Arc<Self>,
        call_id: &str,
        stream_sid: String,
    ) -> anyhow::Result<StreamChannels> {
        let slot = self
            .find(call_id)
            .ok_or_else(|| anyhow::anyhow!("unknown call id: {call_id}"))?;

        let (locale, instructions, voice) = {
            let mut session = slot.session.lock().await;
            if session.is_ended() {
                anyhow::bail!("call {call_id} already ended");
            }
            session.state = SessionState::Streaming;
            session.touch();
            let locale = session.locale;
            (
                locale,
                self.turns.system_instructions(locale, Local::now()),
                self.synthesis.voice_for(locale).to_owned(),
            )
        };

        let rt_config = RealtimeSessionConfig {
            call_id: call_id.to_owned(),
            voice,
            locale,
            instructions,
        };
        let handle = match self.realtime.connect(rt_config).await {
            Ok(handle) => handle,
            Err(e) => {
                let mut session = slot.session.lock().await;
                if !session.is_ended() {
                    let _ = self.apply_failure(&slot, &mut session, FailureKind::RealtimeRejected);
                    if !session.is_ended() {
                        session.state = SessionState::Greeting;
                    }
                }
                return Err(anyhow::Error::from(e).context("opening realtime session"));
            }
        };

        let (in_tx, in_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(256);
        *slot.stream_in.lock() = Some(in_tx.clone());

        let relay = MediaRelay::new(
            call_id.to_owned(),
            stream_sid,
            locale,
            Arc::clone(&self.detector),
            Arc::clone(&self.turns),
            Arc::clone(&self.synthesis),
            Duration::from_millis(self.config.realtime.close_grace_ms),
            Arc::clone(&self.metrics),
        );
        let manager = Arc::clone(self);
        let cancel = slot.cancel.clone();
        let id = call_id.to_owned();
        tokio::spawn(async move {
            let outcome = relay.run(in_rx, out_tx, handle, cancel).await;
            manager.on_relay_end(&id, outcome).await;
        });

        Ok(StreamChannels {
            input: in_tx,
            output: out_rx,
        })
    }

    /// Fold a finished relay back into the session. Clean endings close
    /// the call; failures go through the policy, and whatever state
    /// results is picked up by the platform's post-stream callback.
    pub async fn on_relay_end(&self, call_id: &str, outcome: RelayOutcome) {
        let Some(slot) = self.find(call_id) else {
            return;
        };
        *slot.stream_in.lock() = None;
        let mut session = slot.session.lock().await;
        session.locale = outcome.final_locale;
        session.touch();
        if session.is_ended() {
            return;
        }
        match outcome.reason.failure_kind() {
            None => self.finish(&slot, &mut session),
            Some(kind) => {
                let _ = self.apply_failure(&slot, &mut session, kind);
                if !session.is_ended() {
                    // Retry keeps the tier, downgrade lowered it; either
                    // way the callback re-greets from Greeting.
                    session.state = SessionState::Greeting;
                }
            }
        }
    }

    // ── Housekeeping ───────────────────────────────────────────────

    /// End idle and over-long calls, purge ended ones past their grace.
    /// Calls ended by this pass are purged by a later one.
    pub async fn sweep(&self) -> usize {
        let idle = Duration::from_secs(self.config.session.idle_timeout_secs);
        let grace = Duration::from_secs(self.config.session.ended_grace_secs);

        let slots: Vec<(String, Arc<CallSlot>)> = self
            .registry
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut purge = Vec::new();
        for (id, slot) in slots {
            let mut session = slot.session.lock().await;
            if session.is_ended() {
                let expired = session
                    .ended_at
                    .map(|t| t.elapsed() >= grace)
                    .unwrap_or(true);
                if expired {
                    purge.push(id);
                }
                continue;
            }
            if session.last_activity.elapsed() >= idle {
                tracing::info!(call_id = %session.id, "idle timeout, ending call");
                self.finish(&slot, &mut session);
            } else if self.over_duration_cap(&session) {
                tracing::info!(call_id = %session.id, "call duration cap reached, ending call");
                self.finish(&slot, &mut session);
            }
        }

        if purge.is_empty() {
            return 0;
        }
        let mut registry = self.registry.write();
        for id in &purge {
            registry.remove(id);
        }
        tracing::debug!(
            purged = purge.len(),
            remaining = registry.len(),
            "purged ended sessions"
        );
        purge.len()
    }

    /// Artifact keys live calls still reference; the reaper spares them.
    pub fn pinned_keys(&self) -> HashSet<String> {
        self.registry
            .read()
            .values()
            .filter_map(|slot| slot.pin.lock().clone())
            .collect()
    }

    pub fn active_calls(&self) -> usize {
        self.registry.read().len()
    }

    /// Resolved canned phrases, shared with the webhook layer for
    /// farewell and busy lines.
    pub fn phrases(&self) -> &PhraseBook {
        &self.phrases
    }

    pub async fn snapshot(&self, call_id: &str) -> Option<(SessionState, Tier, Locale)> {
        let slot = self.find(call_id)?;
        let session = slot.session.lock().await;
        Some((session.state, session.tier, session.locale))
    }

    // ── Internals ──────────────────────────────────────────────────

    fn top_tier(&self) -> Tier {
        if self.config.realtime.enabled {
            Tier::Realtime
        } else {
            Tier::RecordRespond
        }
    }

    fn find(&self, call_id: &str) -> Option<Arc<CallSlot>> {
        self.registry.read().get(call_id).map(Arc::clone)
    }

    fn require(&self, call_id: &str) -> Result<Arc<CallSlot>, SessionError> {
        self.find(call_id)
            .ok_or_else(|| SessionError::UnknownCall(call_id.to_owned()))
    }

    /// Count a failure and apply the policy verdict. `None` means retry;
    /// the caller decides how the retry sounds.
    fn apply_failure(
        &self,
        slot: &CallSlot,
        session: &mut CallSession,
        kind: FailureKind,
    ) -> Option<Instruction> {
        session.failure_count += 1;
        self.metrics.record_failure(kind);
        let verdict = self.policy.decide(session, kind);
        tracing::warn!(
            call_id = %session.id,
            kind = kind.as_str(),
            failure_count = session.failure_count,
            reason = verdict.reason,
            "call failure"
        );
        match verdict.decision {
            Decision::Retry => None,
            Decision::Downgrade(tier) => {
                session.state = SessionState::Degrading;
                session.downgrade_to(tier);
                self.metrics.record_downgrade(tier);
                tracing::info!(call_id = %session.id, tier = tier.as_str(), "tier downgraded");
                Some(self.greeting_for(session))
            }
            Decision::Terminate => {
                self.finish(slot, session);
                Some(Instruction::Speak {
                    text: self.phrases.apology(session.locale).to_owned(),
                    voice: say_voice(session.locale).to_owned(),
                    locale: session.locale,
                    expects_reply: false,
                })
            }
        }
    }

    /// The tier's opening move: duplex stream on realtime, a spoken
    /// greeting elsewhere. After a downgrade the greeting becomes the
    /// notice-plus-reprompt combination instead of a fresh hello.
    fn greeting_for(&self, session: &mut CallSession) -> Instruction {
        match session.tier {
            Tier::Realtime => {
                session.state = SessionState::Streaming;
                Instruction::OpenDuplexStream {
                    endpoint: self.config.media_stream_url(),
                }
            }
            Tier::RecordRespond | Tier::TextOnly => {
                let text = if session.downgrades_used > 0 {
                    let options = self.phrases.reprompts(session.locale);
                    let pick = &options[rand::random_range(0..options.len())];
                    format!("{} {}", self.phrases.downgrade_notice(session.locale), pick)
                } else {
                    self.phrases.greeting(session.locale).to_owned()
                };
                session.state = SessionState::Listening;
                Instruction::Speak {
                    text,
                    voice: say_voice(session.locale).to_owned(),
                    locale: session.locale,
                    expects_reply: true,
                }
            }
        }
    }

    fn retry_prompt(&self, session: &mut CallSession) -> Instruction {
        let options = self.phrases.reprompts(session.locale);
        let text = options[rand::random_range(0..options.len())].clone();
        session.state = SessionState::Listening;
        Instruction::Speak {
            text,
            voice: say_voice(session.locale).to_owned(),
            locale: session.locale,
            expects_reply: true,
        }
    }

    /// Synthesize the reply and hand back a playback instruction; when
    /// synthesis is down, fall back to the platform's own voice so the
    /// conversation keeps moving.
    async fn deliver_reply(
        &self,
        slot: &CallSlot,
        session: &mut CallSession,
        reply: String,
    ) -> Instruction {
        session.state = SessionState::Speaking;
        match self.synthesis.get(&reply, session.locale).await {
            Ok(artifact) => {
                session.pending_audio_ref = Some(artifact.key.clone());
                Self::sync_pin(slot, session);
                session.state = SessionState::Listening;
                Instruction::PlayAudio {
                    artifact_key: artifact.key.clone(),
                    expects_reply: true,
                }
            }
            Err(e) => {
                tracing::warn!(
                    call_id = %session.id,
                    error = %e,
                    "synthesis unavailable, using platform voice"
                );
                match self.apply_failure(slot, session, FailureKind::SynthesisUnavailable) {
                    Some(instruction) => instruction,
                    None => {
                        session.state = SessionState::Listening;
                        Instruction::Speak {
                            text: reply,
                            voice: say_voice(session.locale).to_owned(),
                            locale: session.locale,
                            expects_reply: true,
                        }
                    }
                }
            }
        }
    }

    fn textonly_turn(
        &self,
        slot: &CallSlot,
        session: &mut CallSession,
        text: &str,
    ) -> Instruction {
        if self.turns.is_closing(text) {
            self.finish(slot, session);
            return Instruction::Hangup;
        }
        session.static_replies += 1;
        if session.static_replies > self.config.session.textonly_reply_limit {
            tracing::info!(call_id = %session.id, "static reply budget spent, ending call");
            self.finish(slot, session);
            return Instruction::Hangup;
        }
        session.state = SessionState::Listening;
        Instruction::Speak {
            text: self.phrases.textonly_reply(session.locale).to_owned(),
            voice: say_voice(session.locale).to_owned(),
            locale: session.locale,
            expects_reply: true,
        }
    }

    /// Copy the session's pending artifact into the slot, where the
    /// reaper can read it without the session lock.
    fn sync_pin(slot: &CallSlot, session: &CallSession) {
        *slot.pin.lock() = session.pending_audio_ref.clone();
    }

    fn over_duration_cap(&self, session: &CallSession) -> bool {
        session.age_secs() >= self.config.session.max_call_secs
    }

    fn end_capped(&self, slot: &CallSlot, session: &mut CallSession) -> Instruction {
        tracing::info!(call_id = %session.id, "call duration cap reached, ending call");
        self.finish(slot, session);
        Instruction::Hangup
    }

    /// Terminal bookkeeping, idempotent.
    fn finish(&self, slot: &CallSlot, session: &mut CallSession) {
        slot.hung_up.store(true, Ordering::SeqCst);
        slot.cancel.cancel();
        session.pending_audio_ref = None;
        Self::sync_pin(slot, session);
        if !session.is_ended() {
            session.mark_ended();
            self.metrics.calls_active.dec();
            tracing::info!(
                call_id = %session.id,
                tier = session.tier.as_str(),
                turns = session.history.len().saturating_sub(1) / 2,
                "call ended"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendError, ChatBackend, ChatTurn, RealtimeCommand, RealtimeEvent, RealtimeHandle,
        SpeechBackend,
    };
    use crate::telephony::stream::MediaPayload;
    use crate::telephony::StreamFrame;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    // ── Backend doubles ────────────────────────────────────────────

    struct ScriptedChat {
        script: parking_lot::Mutex<VecDeque<Result<String, BackendError>>>,
        calls: AtomicUsize,
        delay_ms: u64,
    }

    impl ScriptedChat {
        fn new(script: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: parking_lot::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                delay_ms: 0,
            })
        }

        fn slow(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                script: parking_lot::Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                delay_ms,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedChat {
        async fn complete(&self, _turns: &[ChatTurn]) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let next = self.script.lock().pop_front();
            match next {
                Some(result) => result,
                None => Ok("We open at nine.".into()),
            }
        }
    }

    struct ScriptedSpeech {
        script: parking_lot::Mutex<VecDeque<Result<Vec<u8>, BackendError>>>,
    }

    impl ScriptedSpeech {
        fn new(script: Vec<Result<Vec<u8>, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: parking_lot::Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl SpeechBackend for ScriptedSpeech {
        async fn synthesize(
            &self,
            text: &str,
            _voice: &str,
            _locale: Locale,
        ) -> Result<Vec<u8>, BackendError> {
            let next = self.script.lock().pop_front();
            match next {
                Some(result) => result,
                None => Ok(format!("mp3:{text}").into_bytes()),
            }
        }
    }

    type RealtimeLink = (mpsc::Sender<RealtimeEvent>, mpsc::Receiver<RealtimeCommand>);

    struct StubRealtime {
        fail: AtomicBool,
        links: parking_lot::Mutex<VecDeque<RealtimeLink>>,
    }

    impl StubRealtime {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(fail),
                links: parking_lot::Mutex::new(VecDeque::new()),
            })
        }

        fn take_link(&self) -> RealtimeLink {
            self.links.lock().pop_front().expect("no realtime link open")
        }
    }

    #[async_trait]
    impl RealtimeConnector for StubRealtime {
        async fn connect(
            &self,
            _config: RealtimeSessionConfig,
        ) -> Result<RealtimeHandle, BackendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::Http {
                    status: 403,
                    detail: "realtime not available".into(),
                });
            }
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            let (ev_tx, ev_rx) = mpsc::channel(64);
            self.links.lock().push_back((ev_tx, cmd_rx));
            Ok(RealtimeHandle {
                command_tx: cmd_tx,
                event_rx: ev_rx,
            })
        }
    }

    // ── Harness ────────────────────────────────────────────────────

    struct Harness {
        manager: Arc<SessionManager>,
        chat: Arc<ScriptedChat>,
        realtime: Arc<StubRealtime>,
    }

    fn webhook_config() -> Config {
        let mut config = Config::default();
        config.realtime.enabled = false;
        config
    }

    fn build(
        mut config: Config,
        chat: Arc<ScriptedChat>,
        speech: Arc<ScriptedSpeech>,
        realtime: Arc<StubRealtime>,
    ) -> Harness {
        config.gateway.public_url = "https://calls.example.com".into();
        config.realtime.close_grace_ms = 50;
        config.business.name = "Casa Mia".into();
        config.business.facts = vec!["Open nine to five".into()];
        let metrics = Arc::new(Metrics::new().unwrap());
        let detector = Arc::new(
            LanguageDetector::new(Locale::En, config.locales.min_confidence).unwrap(),
        );
        let turns = Arc::new(
            TurnController::new(
                &config,
                Arc::clone(&detector),
                Arc::clone(&chat) as Arc<dyn ChatBackend>,
            )
            .unwrap(),
        );
        let synthesis = Arc::new(SynthesisDispatcher::new(
            &config.synthesis,
            Arc::clone(&speech) as Arc<dyn SpeechBackend>,
            Arc::clone(&metrics),
        ));
        let manager = Arc::new(SessionManager::new(
            config,
            detector,
            turns,
            synthesis,
            Arc::clone(&realtime) as Arc<dyn RealtimeConnector>,
            metrics,
        ));
        Harness {
            manager,
            chat,
            realtime,
        }
    }

    fn webhook_harness() -> Harness {
        build(
            webhook_config(),
            ScriptedChat::new(vec![]),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        )
    }

    async fn start(h: &Harness, id: &str) -> Option<Instruction> {
        h.manager
            .handle_event(CallEvent::Started {
                call_id: id.into(),
                caller: Some("+15550100".into()),
            })
            .await
            .unwrap()
    }

    async fn say(h: &Harness, id: &str, text: &str) -> Option<Instruction> {
        h.manager
            .handle_event(CallEvent::Utterance {
                call_id: id.into(),
                text: text.into(),
            })
            .await
            .unwrap()
    }

    async fn timeout(h: &Harness, id: &str) -> Option<Instruction> {
        h.manager
            .handle_event(CallEvent::InputTimeout { call_id: id.into() })
            .await
            .unwrap()
    }

    async fn wait_for<F>(manager: &SessionManager, id: &str, pred: F)
    where
        F: Fn(&(SessionState, Tier, Locale)) -> bool,
    {
        for _ in 0..200 {
            if let Some(snap) = manager.snapshot(id).await {
                if pred(&snap) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {id} never reached the expected state");
    }

    // ── Webhook-tier behavior ──────────────────────────────────────

    #[tokio::test]
    async fn new_call_greets_with_the_business_name() {
        let h = webhook_harness();
        match start(&h, "CA1").await {
            Some(Instruction::Speak {
                text,
                expects_reply,
                ..
            }) => {
                assert!(text.contains("Casa Mia"));
                assert!(expects_reply);
            }
            other => panic!("expected greeting, got {other:?}"),
        }
        let (state, tier, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(state, SessionState::Listening);
        assert_eq!(tier, Tier::RecordRespond);
    }

    #[tokio::test]
    async fn configured_phrase_override_replaces_the_greeting() {
        let mut config = webhook_config();
        config.business.phrases.insert(
            "en".into(),
            crate::config::PhraseOverrides {
                greeting: Some("You have reached {name}. What do you need?".into()),
                ..Default::default()
            },
        );
        let h = build(
            config,
            ScriptedChat::new(vec![]),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        match start(&h, "CA1").await {
            Some(Instruction::Speak { text, .. }) => {
                assert_eq!(text, "You have reached Casa Mia. What do you need?");
            }
            other => panic!("expected greeting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn realtime_tier_opens_the_duplex_stream() {
        let mut config = Config::default();
        config.realtime.enabled = true;
        let h = build(
            config,
            ScriptedChat::new(vec![]),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        match start(&h, "CA1").await {
            Some(Instruction::OpenDuplexStream { endpoint }) => {
                assert_eq!(endpoint, "wss://calls.example.com/media");
            }
            other => panic!("expected duplex stream, got {other:?}"),
        }
        let (state, tier, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(state, SessionState::Streaming);
        assert_eq!(tier, Tier::Realtime);
    }

    #[tokio::test]
    async fn capacity_limit_rejects_new_calls() {
        let mut config = webhook_config();
        config.session.max_active_calls = 1;
        let h = build(
            config,
            ScriptedChat::new(vec![]),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        start(&h, "CA1").await;
        let err = h
            .manager
            .handle_event(CallEvent::Started {
                call_id: "CA2".into(),
                caller: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AtCapacity(1)));
    }

    #[tokio::test]
    async fn utterance_plays_a_synthesized_reply_and_pins_it() {
        let h = webhook_harness();
        start(&h, "CA1").await;
        let key = match say(&h, "CA1", "what are your hours please").await {
            Some(Instruction::PlayAudio {
                artifact_key,
                expects_reply,
            }) => {
                assert!(expects_reply);
                artifact_key
            }
            other => panic!("expected playback, got {other:?}"),
        };
        assert_eq!(h.chat.call_count(), 1);
        assert!(h.manager.pinned_keys().contains(&key));
    }

    #[tokio::test]
    async fn goodbye_hangs_up_without_touching_the_backend() {
        let h = webhook_harness();
        start(&h, "CA1").await;
        let instruction = say(&h, "CA1", "goodbye, thank you").await;
        assert!(matches!(instruction, Some(Instruction::Hangup)));
        assert_eq!(h.chat.call_count(), 0);

        // Ended sessions ignore further events.
        assert_eq!(say(&h, "CA1", "hello again").await, None);
        let (state, _, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(state, SessionState::Ended);
    }

    #[tokio::test]
    async fn ending_releases_the_audio_pin() {
        let h = webhook_harness();
        start(&h, "CA1").await;
        say(&h, "CA1", "what are your hours please").await;
        assert_eq!(h.manager.pinned_keys().len(), 1);

        h.manager
            .handle_event(CallEvent::Ended {
                call_id: "CA1".into(),
            })
            .await
            .unwrap();
        assert!(h.manager.pinned_keys().is_empty());
    }

    #[tokio::test]
    async fn delivered_audio_unpins_on_the_next_callback() {
        let h = webhook_harness();
        start(&h, "CA1").await;
        say(&h, "CA1", "what are your hours please").await;
        assert_eq!(h.manager.pinned_keys().len(), 1);

        // The follow-up capture timing out means the playback finished;
        // the artifact no longer needs protection from the reaper.
        timeout(&h, "CA1").await;
        assert!(h.manager.pinned_keys().is_empty());
    }

    #[tokio::test]
    async fn first_timeout_reprompts_second_downgrades() {
        let h = webhook_harness();
        start(&h, "CA1").await;

        match timeout(&h, "CA1").await {
            Some(Instruction::Speak {
                text,
                expects_reply,
                ..
            }) => {
                assert!(expects_reply);
                assert!(!text.contains("technical"));
            }
            other => panic!("expected reprompt, got {other:?}"),
        }
        let (_, tier, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(tier, Tier::RecordRespond);

        match timeout(&h, "CA1").await {
            Some(Instruction::Speak { text, .. }) => {
                assert!(text.contains("technical"));
            }
            other => panic!("expected downgrade notice, got {other:?}"),
        }
        let (_, tier, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(tier, Tier::TextOnly);
    }

    #[tokio::test]
    async fn successful_turns_reset_the_failure_count() {
        let chat = ScriptedChat::new(vec![
            Err(BackendError::Timeout(10)),
            Ok("Recovered.".into()),
            Err(BackendError::Timeout(10)),
        ]);
        let h = build(
            webhook_config(),
            chat,
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        start(&h, "CA1").await;

        // Fail, recover, fail again: the second failure is a fresh count
        // of one, so the tier never moves.
        assert!(matches!(
            say(&h, "CA1", "first question please").await,
            Some(Instruction::Speak { .. })
        ));
        assert!(matches!(
            say(&h, "CA1", "second question please").await,
            Some(Instruction::PlayAudio { .. })
        ));
        assert!(matches!(
            say(&h, "CA1", "third question please").await,
            Some(Instruction::Speak { .. })
        ));
        let (_, tier, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(tier, Tier::RecordRespond);
    }

    #[tokio::test]
    async fn repeated_backend_failures_downgrade() {
        let chat = ScriptedChat::new(vec![
            Err(BackendError::Timeout(10)),
            Err(BackendError::Http {
                status: 503,
                detail: "down".into(),
            }),
        ]);
        let h = build(
            webhook_config(),
            chat,
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        start(&h, "CA1").await;

        say(&h, "CA1", "first question please").await;
        match say(&h, "CA1", "second question please").await {
            Some(Instruction::Speak { text, .. }) => assert!(text.contains("technical")),
            other => panic!("expected downgrade notice, got {other:?}"),
        }
        let (_, tier, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(tier, Tier::TextOnly);
    }

    #[tokio::test]
    async fn synthesis_outage_falls_back_to_the_platform_voice() {
        let speech = ScriptedSpeech::new(vec![
            Err(BackendError::Timeout(10)),
            Err(BackendError::Timeout(10)),
        ]);
        let h = build(
            webhook_config(),
            ScriptedChat::new(vec![Ok("We open at nine.".into())]),
            speech,
            StubRealtime::new(false),
        );
        start(&h, "CA1").await;

        match say(&h, "CA1", "when do you open please").await {
            Some(Instruction::Speak {
                text,
                expects_reply,
                ..
            }) => {
                assert_eq!(text, "We open at nine.");
                assert!(expects_reply);
            }
            other => panic!("expected spoken fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_only_serves_static_replies_then_ends() {
        let h = webhook_harness();
        start(&h, "CA1").await;
        timeout(&h, "CA1").await;
        timeout(&h, "CA1").await; // now TextOnly

        for _ in 0..2 {
            match say(&h, "CA1", "tell me about the menu").await {
                Some(Instruction::Speak { text, .. }) => {
                    assert!(text.contains("Casa Mia"));
                    assert!(text.contains("Open nine to five"));
                }
                other => panic!("expected static reply, got {other:?}"),
            }
        }
        assert!(matches!(
            say(&h, "CA1", "and the wine list").await,
            Some(Instruction::Hangup)
        ));
        assert_eq!(h.chat.call_count(), 0);
    }

    #[tokio::test]
    async fn text_only_still_honors_goodbye() {
        let h = webhook_harness();
        start(&h, "CA1").await;
        timeout(&h, "CA1").await;
        timeout(&h, "CA1").await;

        assert!(matches!(
            say(&h, "CA1", "goodbye, thank you").await,
            Some(Instruction::Hangup)
        ));
    }

    #[tokio::test]
    async fn hangup_during_a_turn_discards_the_result() {
        let h = build(
            webhook_config(),
            ScriptedChat::slow(80),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        start(&h, "CA1").await;

        let manager = Arc::clone(&h.manager);
        let turn = tokio::spawn(async move {
            manager
                .handle_event(CallEvent::Utterance {
                    call_id: "CA1".into(),
                    text: "slow question please".into(),
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.manager
            .handle_event(CallEvent::Ended {
                call_id: "CA1".into(),
            })
            .await
            .unwrap();

        let result = turn.await.unwrap().unwrap();
        assert_eq!(result, None, "in-flight turn must be discarded");
        let (state, _, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(state, SessionState::Ended);
    }

    #[tokio::test]
    async fn unknown_calls_error_and_unknown_end_is_quiet() {
        let h = webhook_harness();
        let err = h
            .manager
            .handle_event(CallEvent::Utterance {
                call_id: "CA404".into(),
                text: "hello".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownCall(_)));

        let quiet = h
            .manager
            .handle_event(CallEvent::Ended {
                call_id: "CA404".into(),
            })
            .await
            .unwrap();
        assert_eq!(quiet, None);
    }

    // ── Streaming behavior ─────────────────────────────────────────

    fn realtime_harness(fail_connect: bool) -> Harness {
        let mut config = Config::default();
        config.realtime.enabled = true;
        build(
            config,
            ScriptedChat::new(vec![]),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(fail_connect),
        )
    }

    #[tokio::test]
    async fn media_frames_route_to_the_live_relay() {
        let h = realtime_harness(false);
        start(&h, "CA1").await;
        let _channels = h.manager.attach_stream("CA1", "MZ1".into()).await.unwrap();
        let (_ev_tx, mut cmd_rx) = h.realtime.take_link();

        let frame = StreamFrame::Media {
            stream_sid: None,
            media: MediaPayload {
                track: Some("inbound".into()),
                chunk: None,
                timestamp: None,
                payload: "UUUU".into(),
            },
        };
        h.manager
            .handle_event(CallEvent::MediaFrame {
                call_id: "CA1".into(),
                frame,
            })
            .await
            .unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(1), cmd_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd, RealtimeCommand::AudioB64("UUUU".into()));
    }

    #[tokio::test]
    async fn backend_stream_loss_retries_then_downgrades() {
        let h = realtime_harness(false);
        start(&h, "CA1").await;

        // First stream: backend drops it. One failure, retry on the
        // same tier.
        h.manager.attach_stream("CA1", "MZ1".into()).await.unwrap();
        let (ev_tx, _cmd_rx) = h.realtime.take_link();
        ev_tx.send(RealtimeEvent::Closed).await.unwrap();
        drop(ev_tx);
        wait_for(&h.manager, "CA1", |(state, tier, _)| {
            *state == SessionState::Greeting && *tier == Tier::Realtime
        })
        .await;

        // The post-stream callback re-greets on the same tier.
        assert!(matches!(
            start(&h, "CA1").await,
            Some(Instruction::OpenDuplexStream { .. })
        ));

        // Second stream also drops: threshold reached, step down.
        h.manager.attach_stream("CA1", "MZ2".into()).await.unwrap();
        let (ev_tx, _cmd_rx) = h.realtime.take_link();
        ev_tx.send(RealtimeEvent::Closed).await.unwrap();
        drop(ev_tx);
        wait_for(&h.manager, "CA1", |(_, tier, _)| *tier == Tier::RecordRespond).await;

        match start(&h, "CA1").await {
            Some(Instruction::Speak { text, .. }) => assert!(text.contains("technical")),
            other => panic!("expected downgraded greeting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_realtime_connection_downgrades_immediately() {
        let h = realtime_harness(true);
        start(&h, "CA1").await;

        assert!(h.manager.attach_stream("CA1", "MZ1".into()).await.is_err());
        let (state, tier, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(state, SessionState::Greeting);
        assert_eq!(tier, Tier::RecordRespond);

        match start(&h, "CA1").await {
            Some(Instruction::Speak { text, .. }) => assert!(text.contains("technical")),
            other => panic!("expected downgraded greeting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_locale_switch_survives_into_the_session() {
        let h = realtime_harness(false);
        start(&h, "CA1").await;
        h.manager.attach_stream("CA1", "MZ1".into()).await.unwrap();
        let (ev_tx, _cmd_rx) = h.realtime.take_link();

        ev_tx
            .send(RealtimeEvent::InputTranscript {
                text: "hola quiero reservar una mesa".into(),
            })
            .await
            .unwrap();
        ev_tx.send(RealtimeEvent::Closed).await.unwrap();
        drop(ev_tx);

        wait_for(&h.manager, "CA1", |(_, _, locale)| *locale == Locale::Es).await;
    }

    // ── Housekeeping ───────────────────────────────────────────────

    #[tokio::test]
    async fn sweep_ends_idle_calls_then_purges_them() {
        let mut config = webhook_config();
        config.session.idle_timeout_secs = 0;
        config.session.ended_grace_secs = 0;
        let h = build(
            config,
            ScriptedChat::new(vec![]),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        start(&h, "CA1").await;

        assert_eq!(h.manager.sweep().await, 0);
        let (state, _, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(state, SessionState::Ended);

        assert_eq!(h.manager.sweep().await, 1);
        assert_eq!(h.manager.active_calls(), 0);

        // The id is free again.
        assert!(matches!(
            start(&h, "CA1").await,
            Some(Instruction::Speak { .. })
        ));
    }

    #[tokio::test]
    async fn duration_cap_ends_the_call_on_the_next_event() {
        let mut config = webhook_config();
        config.session.max_call_secs = 0;
        let h = build(
            config,
            ScriptedChat::new(vec![]),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        // The opening greeting still goes out.
        assert!(matches!(
            start(&h, "CA1").await,
            Some(Instruction::Speak { .. })
        ));

        assert!(matches!(
            say(&h, "CA1", "one more question please").await,
            Some(Instruction::Hangup)
        ));
        assert_eq!(h.chat.call_count(), 0);
        let (state, _, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(state, SessionState::Ended);
    }

    #[tokio::test]
    async fn terminal_failure_says_the_apology() {
        let mut config = webhook_config();
        config.session.max_downgrades = 0;
        let h = build(
            config,
            ScriptedChat::new(vec![]),
            ScriptedSpeech::new(vec![]),
            StubRealtime::new(false),
        );
        start(&h, "CA1").await;

        timeout(&h, "CA1").await; // retry
        match timeout(&h, "CA1").await {
            // No downgrade budget: the second timeout terminates.
            Some(Instruction::Speak {
                text,
                expects_reply,
                ..
            }) => {
                assert!(text.contains("sorry") || text.contains("I'm sorry"));
                assert!(!expects_reply);
            }
            other => panic!("expected terminal apology, got {other:?}"),
        }
        let (state, _, _) = h.manager.snapshot("CA1").await.unwrap();
        assert_eq!(state, SessionState::Ended);
    }
}
