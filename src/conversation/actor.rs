//! # Conversation Actor
//!
//! Owns all mutable state of one live voice session and runs it on two
//! long-lived loops:
//!
//! ## Inbound loop
//! Single consumer of the bounded inbound queue. Audio chunks go through the
//! turn segmenter into the audio buffer; partial windows and finalized turns
//! are recognized, and each finalized turn is answered by the dialog planner.
//! Control events that touch turn state (listening, configure, speech) travel
//! through the same queue so they apply in arrival order relative to audio.
//!
//! ## Outbound loop
//! Single consumer of the bounded outbound queue and the only writer to the
//! client, so frames reach the client in exactly the order they were queued.
//!
//! ## Speech tasks
//! Synthesized speech streams on its own task under a child cancellation
//! token, so an `interrupt` can cut it off while the inbound loop keeps
//! listening. A new utterance waits for the previous one to finish.
//!
//! ## Lifecycle
//! `start` registers the actor and spawns its loops; `cleanup` cancels every
//! tracked task, waits a bounded grace period, drains both queues without
//! processing them and deregisters the actor. Cleanup is idempotent and may be
//! called concurrently from several paths.

use crate::audio::buffer::{AudioBuffer, AudioBufferConfig};
use crate::audio::processor::{decode_base64_audio, AudioProcessor};
use crate::audio::segmenter::{
    SegmentEvent, SegmenterConfig, SegmenterUpdate, SpeechTurnSegmenter, VoiceActivityState,
};
use crate::config::AppConfig;
use crate::conversation::events::{
    parse_inbound, unix_timestamp, ChunkMessage, ClientEvent, InboundMessage, OutboundFrame,
    ServerEvent,
};
use crate::conversation::registry::Registry;
use crate::services::planner::InterviewContext;
use crate::services::recognizer::TranscriptionResult;
use crate::services::synthesizer::Synthesizer;
use crate::services::VoiceServices;
use crate::session::{Role, Session, SessionStore, Turn};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Sent as the error event of the failure that trips the circuit breaker.
const BREAKER_MESSAGE: &str =
    "Speech recognition failed repeatedly. Please check your network connection or audio quality.";

/// Where an actor's outbound frames are delivered.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Deliver one frame to the client of `session_id`. Returns false if the
    /// frame could not be written.
    async fn deliver(&self, actor_id: u64, session_id: &str, frame: OutboundFrame) -> bool;
}

/// Per-actor tuning, fixed when the actor is created.
#[derive(Debug, Clone)]
pub struct ActorSettings {
    pub buffer: AudioBufferConfig,
    pub segmenter: SegmenterConfig,
    /// Buffered speech that triggers a partial recognition pass
    pub window_secs: f64,
    pub max_consecutive_errors: u32,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub enqueue_timeout: Duration,
    pub idle_timeout: Duration,
    pub cleanup_grace: Duration,
    pub history_turns: usize,
    pub closing_line: String,
}

impl ActorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let voice = &config.voice;
        Self {
            buffer: config.audio.buffer_config(voice.overlap_ratio),
            segmenter: voice.segmenter_config(),
            window_secs: voice.window_secs,
            max_consecutive_errors: voice.max_consecutive_errors.max(1),
            inbound_capacity: voice.inbound_queue_capacity.max(1),
            outbound_capacity: voice.outbound_queue_capacity.max(1),
            enqueue_timeout: voice.enqueue_timeout(),
            idle_timeout: voice.idle_timeout(),
            cleanup_grace: voice.cleanup_grace(),
            history_turns: voice.history_turns.max(1),
            closing_line: voice.closing_line.clone(),
        }
    }
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Point-in-time view of an actor, for status reporting and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ActorSnapshot {
    pub actor_id: u64,
    pub session_id: String,
    pub is_active: bool,
    pub is_listening: bool,
    pub is_speaking: bool,
    pub state: VoiceActivityState,
    pub consecutive_errors: u32,
    pub dropped_chunks: u64,
    pub pending_inbound: usize,
    pub pending_outbound: usize,
    pub tracked_tasks: usize,
}

/// Items consumed by the inbound loop, in arrival order.
#[derive(Debug)]
enum InboundItem {
    Audio { data: Bytes, is_last: bool },
    StartListening,
    /// Carries the listen generation current when the stop arrived
    StopListening { generation: u64 },
    Configure(SegmenterUpdate),
    Speak(String),
    SpeechFinished { generation: u64 },
}

struct ActorShared {
    id: u64,
    session_id: String,
    settings: ActorSettings,
    processor: AudioProcessor,

    inbound_tx: mpsc::Sender<InboundItem>,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    // Held by the loops while they run; cleanup drains them afterwards
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundItem>>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<OutboundFrame>>,

    is_active: AtomicBool,
    is_listening: AtomicBool,
    listen_generation: AtomicU64,
    is_speaking: AtomicBool,
    consecutive_errors: AtomicU32,
    dropped_chunks: AtomicU64,
    speech_generation: AtomicU64,
    state: parking_lot::Mutex<VoiceActivityState>,
    /// Generation and token of the utterance currently playing
    current_speech: parking_lot::Mutex<Option<(u64, CancellationToken)>>,

    /// Turn state waiting for `start`
    pending: parking_lot::Mutex<Option<TurnState>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    /// Set once cleanup has completed
    cleaned_up: tokio::sync::Mutex<bool>,

    registry: Weak<Registry>,
    sink: Weak<dyn OutputSink>,
}

impl ActorShared {
    fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    fn is_listening(&self) -> bool {
        self.is_listening.load(Ordering::SeqCst)
    }

    /// Queue a frame for the outbound loop.
    async fn emit(&self, frame: OutboundFrame) -> bool {
        if !self.is_active() {
            return false;
        }
        match self
            .outbound_tx
            .send_timeout(frame, self.settings.enqueue_timeout)
            .await
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(session_id = %self.session_id, "Outbound queue full, dropping frame");
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    async fn emit_event(&self, event: ServerEvent) -> bool {
        self.emit(event.into_frame()).await
    }

    /// Queue a control item for the inbound loop.
    async fn enqueue(&self, item: InboundItem) -> bool {
        match self
            .inbound_tx
            .send_timeout(item, self.settings.enqueue_timeout)
            .await
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(item)) => {
                warn!(session_id = %self.session_id, "Inbound queue full, dropping {:?}", item);
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }
}

/// Handle to one session's actor. Cheap to clone.
#[derive(Clone)]
pub struct ConversationActor {
    shared: Arc<ActorShared>,
}

/// Non-owning actor handle held by the registry.
#[derive(Clone)]
pub struct WeakActor(Weak<ActorShared>);

impl WeakActor {
    pub fn upgrade(&self) -> Option<ConversationActor> {
        self.0.upgrade().map(|shared| ConversationActor { shared })
    }
}

impl ConversationActor {
    /// Create an actor for `session`. Nothing runs until `start`.
    pub fn new(
        session: &Session,
        settings: ActorSettings,
        services: VoiceServices,
        store: Arc<dyn SessionStore>,
        registry: Weak<Registry>,
        sink: Weak<dyn OutputSink>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_capacity.max(1));

        let history_start = session.history.len().saturating_sub(settings.history_turns);
        let turn = TurnState {
            buffer: AudioBuffer::new(settings.buffer.clone()),
            segmenter: SpeechTurnSegmenter::new(settings.segmenter, &settings.buffer),
            current_transcript: String::new(),
            history: session.history[history_start..].iter().cloned().collect(),
            context: InterviewContext {
                job_description: session.job_description.clone(),
                interview_type: session.interview_type.clone(),
                questions_asked: session.questions_asked(),
            },
            services,
            store,
            speech_task: None,
        };

        let shared = Arc::new(ActorShared {
            id: NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed),
            session_id: session.session_id.clone(),
            processor: AudioProcessor::new(settings.buffer.clone()),
            settings,
            inbound_tx,
            outbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            is_active: AtomicBool::new(true),
            is_listening: AtomicBool::new(false),
            listen_generation: AtomicU64::new(0),
            is_speaking: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            dropped_chunks: AtomicU64::new(0),
            speech_generation: AtomicU64::new(0),
            state: parking_lot::Mutex::new(VoiceActivityState::Silence),
            current_speech: parking_lot::Mutex::new(None),
            pending: parking_lot::Mutex::new(Some(turn)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            cleaned_up: tokio::sync::Mutex::new(false),
            registry,
            sink,
        });

        Self { shared }
    }

    /// Register with the registry, queue the `connected` event and spawn both
    /// loops. Calling it again has no effect.
    pub fn start(&self) {
        let Some(turn) = self.shared.pending.lock().take() else {
            return;
        };
        if !self.shared.is_active() {
            return;
        }

        if let Some(registry) = self.shared.registry.upgrade() {
            registry.register_actor(self);
        }

        let connected = ServerEvent::Connected {
            session_id: self.shared.session_id.clone(),
            state: VoiceActivityState::Silence,
        };
        if self.shared.outbound_tx.try_send(connected.into_frame()).is_err() {
            warn!(session_id = %self.shared.session_id, "Could not queue connected event");
        }

        let inbound = InboundLoop {
            shared: self.shared.clone(),
            turn,
        };
        self.spawn_supervised("inbound", inbound.run());
        self.spawn_supervised("outbound", run_outbound(self.shared.clone()));

        info!(
            session_id = %self.shared.session_id,
            actor_id = self.shared.id,
            "Conversation actor started"
        );
    }

    /// Spawn a tracked task; a panic ends only that task and is logged.
    fn spawn_supervised<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let session_id = self.shared.session_id.clone();
        self.shared.tracker.spawn(async move {
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                error!(session_id = %session_id, "{} loop panicked and was stopped", name);
            } else {
                debug!(session_id = %session_id, "{} loop finished", name);
            }
        });
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn downgrade(&self) -> WeakActor {
        WeakActor(Arc::downgrade(&self.shared))
    }

    /// Queue an audio chunk for the inbound loop.
    ///
    /// Waits at most the enqueue timeout for queue space; a chunk that does not
    /// fit in time is dropped and counted. Returns whether the chunk was queued.
    pub async fn process_audio_chunk(&self, data: Bytes, is_last: bool) -> bool {
        let shared = &self.shared;
        if !shared.is_active() {
            return false;
        }
        if !shared.is_listening() {
            debug!(session_id = %shared.session_id, "Ignoring audio while not listening");
            return false;
        }

        let size = data.len();
        match shared
            .inbound_tx
            .send_timeout(InboundItem::Audio { data, is_last }, shared.settings.enqueue_timeout)
            .await
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                let dropped = shared.dropped_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    session_id = %shared.session_id,
                    bytes = size,
                    dropped_total = dropped,
                    "Inbound queue blocked, dropping audio chunk"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Dispatch an event-variant control message.
    pub async fn process_message(&self, event: ClientEvent) {
        let shared = &self.shared;
        if !shared.is_active() {
            return;
        }

        match event {
            ClientEvent::StartListening => {
                shared.listen_generation.fetch_add(1, Ordering::SeqCst);
                shared.is_listening.store(true, Ordering::SeqCst);
                shared.enqueue(InboundItem::StartListening).await;
            }
            ClientEvent::StopListening => {
                let generation = shared.listen_generation.load(Ordering::SeqCst);
                shared
                    .enqueue(InboundItem::StopListening { generation })
                    .await;
            }
            ClientEvent::StartSpeaking { text } => {
                shared.enqueue(InboundItem::Speak(text)).await;
            }
            ClientEvent::Ping { timestamp } => {
                shared
                    .emit_event(ServerEvent::Pong {
                        timestamp: timestamp.unwrap_or_else(unix_timestamp),
                    })
                    .await;
            }
        }
    }

    /// Handle one client text frame of either protocol variant.
    pub async fn handle_text(&self, text: &str) {
        let shared = &self.shared;
        match parse_inbound(text) {
            Ok(InboundMessage::Event(event)) => self.process_message(event).await,
            Ok(InboundMessage::Chunk(ChunkMessage::AudioChunk {
                data,
                sample_rate,
                is_last,
                ..
            })) => {
                let decoded = decode_base64_audio(&data).and_then(|bytes| {
                    if bytes.is_empty() && is_last {
                        return Ok(bytes);
                    }
                    shared.processor.validate_chunk(&bytes, sample_rate)?;
                    Ok(bytes)
                });
                match decoded {
                    Ok(bytes) => {
                        self.process_audio_chunk(Bytes::from(bytes), is_last).await;
                    }
                    Err(e) => {
                        warn!(session_id = %shared.session_id, "Rejected audio chunk: {}", e);
                        shared.emit_event(ServerEvent::error(e.to_string())).await;
                    }
                }
            }
            Ok(InboundMessage::Chunk(ChunkMessage::Configure { config })) => {
                shared.enqueue(InboundItem::Configure(config)).await;
            }
            Ok(InboundMessage::Chunk(ChunkMessage::Interrupt)) => {
                self.interrupt().await;
            }
            Ok(InboundMessage::Chunk(ChunkMessage::Ping { timestamp })) => {
                self.process_message(ClientEvent::Ping { timestamp }).await;
            }
            Ok(InboundMessage::Unknown(name)) => {
                warn!(session_id = %shared.session_id, "Ignoring unknown event '{}'", name);
            }
            Err(e) => {
                shared
                    .emit_event(ServerEvent::error(format!("Invalid message: {}", e)))
                    .await;
            }
        }
    }

    /// Handle one client binary frame of raw PCM.
    pub async fn handle_binary(&self, data: Bytes) {
        let shared = &self.shared;
        if let Err(e) = shared.processor.validate_chunk(&data, None) {
            warn!(session_id = %shared.session_id, "Rejected binary audio: {}", e);
            shared.emit_event(ServerEvent::error(e.to_string())).await;
            return;
        }
        self.process_audio_chunk(data, false).await;
    }

    /// Cut off in-flight speech. Returns whether anything was playing.
    pub async fn interrupt(&self) -> bool {
        let current = self.shared.current_speech.lock().take();
        let interrupted = match current {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        };
        debug!(session_id = %self.shared.session_id, interrupted, "Interrupt requested");
        self.shared.emit_event(ServerEvent::Interrupted).await;
        interrupted
    }

    /// Stop accepting input and signal every task to stop. Does not wait.
    pub fn begin_shutdown(&self) {
        self.shared.is_active.store(false, Ordering::SeqCst);
        self.shared.is_listening.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }

    /// Tear the actor down. Idempotent and safe to call concurrently.
    pub async fn cleanup(&self) {
        let shared = &self.shared;
        let mut cleaned_up = shared.cleaned_up.lock().await;
        if *cleaned_up {
            return;
        }

        self.begin_shutdown();
        shared.is_speaking.store(false, Ordering::SeqCst);
        if let Some((_, token)) = shared.current_speech.lock().take() {
            token.cancel();
        }
        shared.pending.lock().take();

        shared.tracker.close();
        if tokio::time::timeout(shared.settings.cleanup_grace, shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                session_id = %shared.session_id,
                remaining = shared.tracker.len(),
                "Tasks still running after cleanup grace period"
            );
        }

        let mut drained = 0usize;
        match shared.inbound_rx.try_lock() {
            Ok(mut rx) => {
                rx.close();
                while rx.try_recv().is_ok() {
                    drained += 1;
                }
            }
            Err(_) => warn!(session_id = %shared.session_id, "Inbound queue still in use"),
        }
        match shared.outbound_rx.try_lock() {
            Ok(mut rx) => {
                rx.close();
                while rx.try_recv().is_ok() {
                    drained += 1;
                }
            }
            Err(_) => warn!(session_id = %shared.session_id, "Outbound queue still in use"),
        }

        if let Some(registry) = shared.registry.upgrade() {
            registry.deregister_actor(shared.id);
        }

        *cleaned_up = true;
        info!(
            session_id = %shared.session_id,
            actor_id = shared.id,
            drained,
            "Conversation actor cleaned up"
        );
    }

    pub fn snapshot(&self) -> ActorSnapshot {
        let shared = &self.shared;
        ActorSnapshot {
            actor_id: shared.id,
            session_id: shared.session_id.clone(),
            is_active: shared.is_active(),
            is_listening: shared.is_listening(),
            is_speaking: shared.is_speaking.load(Ordering::SeqCst),
            state: *shared.state.lock(),
            consecutive_errors: shared.consecutive_errors.load(Ordering::SeqCst),
            dropped_chunks: shared.dropped_chunks.load(Ordering::Relaxed),
            pending_inbound: shared.inbound_tx.max_capacity() - shared.inbound_tx.capacity(),
            pending_outbound: shared.outbound_tx.max_capacity() - shared.outbound_tx.capacity(),
            tracked_tasks: shared.tracker.len(),
        }
    }
}

/// State owned by the inbound loop.
struct TurnState {
    buffer: AudioBuffer,
    segmenter: SpeechTurnSegmenter,
    /// Text recognized so far in this turn, passed as the recognizer prompt
    current_transcript: String,
    /// Most recent turns handed to the planner
    history: VecDeque<Turn>,
    context: InterviewContext,
    services: VoiceServices,
    store: Arc<dyn SessionStore>,
    speech_task: Option<JoinHandle<()>>,
}

struct InboundLoop {
    shared: Arc<ActorShared>,
    turn: TurnState,
}

impl InboundLoop {
    async fn run(mut self) {
        let shared = self.shared.clone();
        let cancel = shared.cancel.clone();
        let mut rx = shared.inbound_rx.lock().await;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(shared.settings.idle_timeout, rx.recv()) => next,
            };

            match next {
                Ok(Some(item)) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.handle(item) => {}
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(session_id = %shared.session_id, "Inbound idle, sending keepalive");
                    shared
                        .emit_event(ServerEvent::Ping {
                            timestamp: unix_timestamp(),
                        })
                        .await;
                }
            }
        }
    }

    async fn handle(&mut self, item: InboundItem) {
        match item {
            InboundItem::Audio { data, is_last } => self.handle_audio(&data, is_last).await,
            InboundItem::StartListening => {
                if self.turn.segmenter.state() == VoiceActivityState::Speech {
                    self.turn.segmenter.finish_turn();
                }
                self.reset_turn();
                self.sync_state().await;
                self.shared.emit_event(ServerEvent::ListeningStarted).await;
            }
            InboundItem::StopListening { generation } => {
                if self.turn.segmenter.force_finalize() {
                    self.finalize_turn().await;
                }
                // A start that arrived after this stop keeps the actor listening
                if self.shared.listen_generation.load(Ordering::SeqCst) == generation {
                    self.shared.is_listening.store(false, Ordering::SeqCst);
                }
                self.shared.emit_event(ServerEvent::ListeningStopped).await;
            }
            InboundItem::Configure(update) => {
                let config = self.turn.segmenter.configure(&update);
                info!(session_id = %self.shared.session_id, ?config, "Segmenter reconfigured");
                self.shared.emit_event(ServerEvent::Configured { config }).await;
            }
            InboundItem::Speak(text) => self.start_speech(text).await,
            InboundItem::SpeechFinished { generation } => {
                if generation == self.shared.speech_generation.load(Ordering::SeqCst)
                    && self.turn.segmenter.end_speaking()
                {
                    self.sync_state().await;
                }
            }
        }
    }

    async fn handle_audio(&mut self, data: &[u8], is_last: bool) {
        // Chunks queued before a stop are still processed; later ones are not
        if !self.shared.is_listening() {
            debug!(session_id = %self.shared.session_id, "Dropping audio received after stop");
            return;
        }

        let event = self.turn.segmenter.process_chunk(data);
        self.sync_state().await;

        match event {
            SegmentEvent::Idle => {}
            SegmentEvent::SpeechStarted => {
                // After a failed attempt the retained audio is retried with this turn
                if self.shared.consecutive_errors.load(Ordering::SeqCst) == 0 {
                    self.reset_turn();
                }
                self.turn.buffer.append(data);
                self.maybe_partial().await;
            }
            SegmentEvent::Continuing => {
                self.turn.buffer.append(data);
                self.maybe_partial().await;
            }
            SegmentEvent::Finalize(reason) => {
                self.turn.buffer.append(data);
                debug!(session_id = %self.shared.session_id, ?reason, "Turn finalized");
                self.finalize_turn().await;
            }
            SegmentEvent::Discarded => {
                debug!(session_id = %self.shared.session_id, "Discarding short noise burst");
                self.reset_turn();
            }
        }

        if is_last && self.turn.segmenter.force_finalize() {
            self.sync_state().await;
            self.finalize_turn().await;
        }
    }

    fn reset_turn(&mut self) {
        self.turn.buffer.clear();
        self.turn.current_transcript.clear();
    }

    /// Mirror the segmenter state and report transitions.
    async fn sync_state(&self) {
        let state = self.turn.segmenter.state();
        let changed = {
            let mut current = self.shared.state.lock();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.shared.emit_event(ServerEvent::StateChange { state }).await;
        }
    }

    async fn maybe_partial(&mut self) {
        if self.turn.buffer.window_duration_seconds() < self.shared.settings.window_secs {
            return;
        }
        let window = self.turn.buffer.take_window();
        if let Some(result) = self.recognize(&window).await {
            self.turn.current_transcript = result.text.clone();
            self.shared
                .emit_event(ServerEvent::PartialTranscript(result.with_final(false)))
                .await;
        }
    }

    /// Recognize the whole turn, return the segmenter to Silence and answer.
    async fn finalize_turn(&mut self) {
        debug!(
            session_id = %self.shared.session_id,
            turn_secs = self.turn.buffer.duration_seconds(),
            "Finalizing turn"
        );
        let audio = self.turn.buffer.as_bytes().to_vec();
        let outcome = self.recognize(&audio).await;
        self.turn.segmenter.finish_turn();
        self.sync_state().await;

        let Some(result) = outcome else {
            return;
        };
        let result = result.with_final(true);
        self.reset_turn();

        self.shared
            .emit_event(ServerEvent::PartialTranscript(result.clone()))
            .await;
        self.shared
            .emit_event(ServerEvent::FinalTranscript(result.clone()))
            .await;

        if result.text.is_empty() {
            debug!(session_id = %self.shared.session_id, "Empty transcript, not responding");
            return;
        }
        self.respond(result.text).await;
    }

    /// One recognizer call with circuit breaker accounting.
    async fn recognize(&mut self, audio: &[u8]) -> Option<TranscriptionResult> {
        let shared = self.shared.clone();
        let prompt = Some(self.turn.current_transcript.as_str()).filter(|p| !p.is_empty());

        match self.turn.services.recognizer.speech_to_text(audio, prompt).await {
            Ok(result) => {
                shared.consecutive_errors.store(0, Ordering::SeqCst);
                Some(result)
            }
            Err(e) => {
                let errors = shared.consecutive_errors.load(Ordering::SeqCst) + 1;
                if errors >= shared.settings.max_consecutive_errors {
                    warn!(
                        session_id = %shared.session_id,
                        errors,
                        "Recognition circuit breaker tripped, clearing buffer: {}", e
                    );
                    shared.consecutive_errors.store(0, Ordering::SeqCst);
                    self.reset_turn();
                    shared.emit_event(ServerEvent::error(BREAKER_MESSAGE)).await;
                } else {
                    shared.consecutive_errors.store(errors, Ordering::SeqCst);
                    error!(session_id = %shared.session_id, errors, "Recognition failed: {}", e);
                    shared
                        .emit_event(ServerEvent::error(format!("Speech recognition failed: {}", e)))
                        .await;
                }
                None
            }
        }
    }

    /// Record the user's answer and ask the planner for the next line.
    async fn respond(&mut self, user_text: String) {
        let user_turn = Turn::new(Role::User, user_text);
        self.push_history(user_turn.clone());
        self.persist(Some(user_turn), false).await;

        let history: Vec<Turn> = self.turn.history.iter().cloned().collect();
        let next = self
            .turn
            .services
            .planner
            .next_turn(&history, &self.turn.context)
            .await;

        match next {
            Ok(Some(question)) => {
                let assistant_turn = Turn::new(Role::Assistant, question.clone());
                self.push_history(assistant_turn.clone());
                self.turn.context.questions_asked += 1;
                self.persist(Some(assistant_turn), false).await;

                self.shared
                    .emit_event(ServerEvent::AssistantText {
                        text: question.clone(),
                    })
                    .await;
                self.start_speech(question).await;
            }
            Ok(None) => {
                info!(session_id = %self.shared.session_id, "Interview completed");
                self.persist(None, true).await;
                let closing_line = self.shared.settings.closing_line.clone();
                self.shared
                    .emit_event(ServerEvent::InterviewCompleted {
                        message: closing_line.clone(),
                    })
                    .await;
                if !closing_line.is_empty() {
                    self.start_speech(closing_line).await;
                }
            }
            Err(e) => {
                error!(session_id = %self.shared.session_id, "Response generation failed: {}", e);
                self.shared
                    .emit_event(ServerEvent::error(format!("Failed to generate a response: {}", e)))
                    .await;
            }
        }
    }

    fn push_history(&mut self, turn: Turn) {
        self.turn.history.push_back(turn);
        while self.turn.history.len() > self.shared.settings.history_turns {
            self.turn.history.pop_front();
        }
    }

    async fn persist(&self, turn: Option<Turn>, completed: bool) {
        let store = &self.turn.store;
        let session_id = &self.shared.session_id;
        let Some(mut session) = store.get(session_id).await else {
            warn!(session_id = %session_id, "Session disappeared, turn not persisted");
            return;
        };
        session.history.extend(turn);
        if completed {
            session.is_completed = true;
        }
        if !store.update(session).await {
            warn!(session_id = %session_id, "Session update rejected");
        }
    }

    /// Stream `text` to the client on a tracked speech task.
    async fn start_speech(&mut self, text: String) {
        let shared = &self.shared;
        let token = shared.cancel.child_token();
        let generation = {
            let mut current = shared.current_speech.lock();
            let generation = shared.speech_generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((_, previous)) = current.replace((generation, token.clone())) {
                previous.cancel();
            }
            shared.is_speaking.store(true, Ordering::SeqCst);
            generation
        };
        if self.turn.segmenter.begin_speaking() {
            self.sync_state().await;
        }

        let task = SpeechTask {
            shared: self.shared.clone(),
            synthesizer: self.turn.services.synthesizer.clone(),
            text,
            token,
            generation,
            previous: self.turn.speech_task.take(),
        };
        let session_id = self.shared.session_id.clone();
        let handle = self.shared.tracker.spawn(async move {
            if AssertUnwindSafe(task.run()).catch_unwind().await.is_err() {
                error!(session_id = %session_id, "Speech task panicked");
            }
        });
        self.turn.speech_task = Some(handle);
    }
}

struct SpeechTask {
    shared: Arc<ActorShared>,
    synthesizer: Arc<dyn Synthesizer>,
    text: String,
    token: CancellationToken,
    generation: u64,
    previous: Option<JoinHandle<()>>,
}

impl SpeechTask {
    async fn run(mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = previous.await;
        }

        if !self.token.is_cancelled() {
            self.stream().await;
        }

        let shared = &self.shared;
        {
            let mut current = shared.current_speech.lock();
            if current.as_ref().is_some_and(|(g, _)| *g == self.generation) {
                *current = None;
            }
            if shared.speech_generation.load(Ordering::SeqCst) == self.generation {
                shared.is_speaking.store(false, Ordering::SeqCst);
            }
        }
        shared
            .enqueue(InboundItem::SpeechFinished {
                generation: self.generation,
            })
            .await;
    }

    async fn stream(&self) {
        let shared = &self.shared;
        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            opened = self.synthesizer.stream_speech(&self.text) => opened,
        };
        let mut audio = match opened {
            Ok(audio) => audio,
            Err(e) => {
                error!(session_id = %shared.session_id, "Speech synthesis failed: {}", e);
                shared
                    .emit_event(ServerEvent::error(format!("Speech synthesis failed: {}", e)))
                    .await;
                return;
            }
        };

        shared
            .emit_event(ServerEvent::SpeechStart {
                text: self.text.clone(),
            })
            .await;

        let mut chunks = 0usize;
        let interrupted = loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break true,
                next = audio.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    chunks += 1;
                    shared.emit(OutboundFrame::Binary(chunk)).await;
                }
                Some(Err(e)) => {
                    error!(session_id = %shared.session_id, "Speech stream failed: {}", e);
                    shared
                        .emit_event(ServerEvent::error(format!("Speech synthesis failed: {}", e)))
                        .await;
                    break false;
                }
                None => break false,
            }
        };

        debug!(session_id = %shared.session_id, chunks, interrupted, "Speech finished");
        shared.emit_event(ServerEvent::SpeechEnd { interrupted }).await;
    }
}

async fn run_outbound(shared: Arc<ActorShared>) {
    let cancel = shared.cancel.clone();
    let mut rx = shared.outbound_rx.lock().await;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let Some(sink) = shared.sink.upgrade() else {
            break;
        };
        if !sink.deliver(shared.id, &shared.session_id, frame).await {
            debug!(session_id = %shared.session_id, "Frame not delivered");
        }
    }
}
