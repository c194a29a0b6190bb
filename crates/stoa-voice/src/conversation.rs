//! Conversation orchestrator: the half-duplex turn-taking state machine.
//!
//! ```text
//!   Idle → Listening → Processing → Speaking ─┐
//!           ▲    ▲          │                 │ (grace period)
//!           │    └──────────┘ (auto-speak off)│
//!           └─────────────────────────────────┘
//! ```
//!
//! One actor task per conversation owns every piece of mutable state: the
//! conversation state, the turn candidate, the player counters and the echo
//! guard. Everything else (recognizer callbacks, generation and synthesis
//! tasks, renderer completion callbacks, the [`ConversationHandle`]) talks
//! to it through channels, tagging messages with the listening session, turn
//! or request id that produced them. When the actor moves on, ids are bumped
//! and late messages are discarded on arrival.
//!
//! Any state can be abandoned with `stop_all`: it cancels in-flight work,
//! silences the renderer, stops the recognizer and releases the audio lease.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::arbiter::{AudioArbiter, AudioMode};
use crate::backend::{
    AudioChunk, Exchange, RecognitionSink, RecognizerEvent, RecognizerMessage, SpeechRecognizer,
    SpeechSynthesizer, TextGenerator,
};
use crate::config::ConversationConfig;
use crate::error::{RecognitionError, VoiceError};
use crate::gate::EchoGate;
use crate::player::{Finished, PlaybackOutcome, RenderNotice, StreamingPlayer};
use crate::render::AudioRenderer;
use crate::retry::{ErrorKind, RetryDecision, RetryTracker};
use crate::turn::{TurnCandidate, Utterance};

// ── Conversation state machine ─────────────────────────────────────

/// Current state of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationState {
    /// Not listening; waiting for `start` or typed input.
    #[default]
    Idle,

    /// Microphone open (or about to reopen after the grace period).
    Listening,

    /// Waiting for the generated reply.
    Processing,

    /// Playing back synthesized speech.
    Speaking,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

// ── Events emitted to the presentation layer ───────────────────────

/// Read-only notifications for the UI / application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// State changed.
    StateChanged(ConversationState),

    /// Live recognizer text for the current listening session.
    Transcript { text: String, is_final: bool },

    /// A user turn was accepted and is being answered.
    UserTurn(Utterance),

    /// Incremental reply text.
    ResponseDelta(String),

    /// The complete reply.
    Response(String),

    /// Speech playback began.
    SpeakingStarted,

    /// Speech playback ended.
    SpeakingFinished(PlaybackOutcome),

    /// A user-visible notice (fallback reply, unavailable device, ...).
    Notice(String),
}

// ── Collaborators ──────────────────────────────────────────────────

/// Everything a conversation talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub renderer: Arc<dyn AudioRenderer>,
    pub arbiter: Arc<AudioArbiter>,
}

// ── Handle ─────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    Interrupt,
    SubmitText(String),
    SetContinuous(bool),
    SetAutoSpeak(bool),
    Shutdown,
}

/// Cloneable control surface for a running conversation.
///
/// Commands are fire-and-forget; they fail only with
/// [`VoiceError::NotActive`] once the conversation has shut down.
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConversationState>,
}

impl ConversationHandle {
    /// Begin listening (from Idle).
    pub fn start(&self) -> Result<(), VoiceError> {
        self.send(Command::Start)
    }

    /// Abandon whatever is happening and go Idle.
    pub fn stop(&self) -> Result<(), VoiceError> {
        self.send(Command::Stop)
    }

    /// Barge in: abandon the current turn and listen immediately.
    pub fn interrupt(&self) -> Result<(), VoiceError> {
        self.send(Command::Interrupt)
    }

    /// Run a turn from typed text. Blank input is ignored.
    pub fn submit_text(&self, text: impl Into<String>) -> Result<(), VoiceError> {
        self.send(Command::SubmitText(text.into()))
    }

    /// Return to listening after each reply (`true`) or go Idle (`false`).
    pub fn set_continuous(&self, continuous: bool) -> Result<(), VoiceError> {
        self.send(Command::SetContinuous(continuous))
    }

    /// Speak replies aloud or only display them.
    pub fn set_auto_speak(&self, auto_speak: bool) -> Result<(), VoiceError> {
        self.send(Command::SetAutoSpeak(auto_speak))
    }

    /// Current state.
    pub fn state(&self) -> ConversationState {
        *self.state_rx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConversationState> {
        self.state_rx.clone()
    }

    /// Wait until the conversation reaches `target`.
    pub async fn wait_for_state(&self, target: ConversationState) -> Result<(), VoiceError> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| VoiceError::NotActive)
    }

    /// Stop everything and wait for the actor to exit.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let mut rx = self.state_rx;
        while rx.changed().await.is_ok() {}
    }

    fn send(&self, command: Command) -> Result<(), VoiceError> {
        self.cmd_tx.send(command).map_err(|_| VoiceError::NotActive)
    }
}

// ── Actor ──────────────────────────────────────────────────────────

/// Results of generation and synthesis tasks, tagged with their turn.
enum Inbound {
    GenerationDelta {
        turn: u64,
        text: String,
    },
    GenerationFinished {
        turn: u64,
        result: Result<(), VoiceError>,
    },
    SynthesisChunk {
        turn: u64,
        request: u64,
        chunk: AudioChunk,
    },
    SynthesisEnded {
        turn: u64,
        request: u64,
    },
    SynthesisFailed {
        turn: u64,
        request: u64,
        error: VoiceError,
    },
}

/// What is being spoken.
#[derive(Debug, Clone, Copy)]
struct Speech {
    request: u64,
    /// The fallback notice; its own failure must not trigger another notice.
    is_notice: bool,
}

/// The conversation actor. Construct with [`Conversation::spawn`].
pub struct Conversation {
    config: ConversationConfig,
    deps: Collaborators,

    state: ConversationState,
    state_tx: watch::Sender<ConversationState>,
    event_tx: mpsc::UnboundedSender<ConversationEvent>,
    recognizer_tx: mpsc::UnboundedSender<RecognizerMessage>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,

    player: StreamingPlayer,
    gate: EchoGate,
    retry: RetryTracker,
    history: VecDeque<Exchange>,
    /// The lease this conversation acquired; anything else on the arbiter
    /// belongs to someone else and is never released from here.
    held: Option<AudioMode>,

    /// Listening session id; recognizer messages from other sessions are stale.
    session: u64,
    candidate: Option<TurnCandidate>,
    recognizer_running: bool,
    /// When to (re)open the microphone: after the grace period or a retry cooldown.
    resume_at: Option<Instant>,

    /// Turn id; generation/synthesis results from other turns are stale.
    turn: u64,
    work: CancellationToken,
    prompt: Option<String>,
    response: String,
    speaking: Option<Speech>,
}

impl Conversation {
    /// Spawn the conversation actor on the current tokio runtime.
    ///
    /// Returns the control handle and the receiver for [`ConversationEvent`]s.
    pub fn spawn(
        config: ConversationConfig,
        deps: Collaborators,
    ) -> (ConversationHandle, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (recognizer_tx, recognizer_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);
        let (player, notice_rx) = StreamingPlayer::new(Arc::clone(&deps.renderer), config.gain);

        let actor = Self {
            gate: EchoGate::new(config.echo),
            retry: RetryTracker::new(config.retry),
            config,
            deps,
            state: ConversationState::Idle,
            state_tx,
            event_tx,
            recognizer_tx,
            inbound_tx,
            player,
            history: VecDeque::new(),
            held: None,
            session: 0,
            candidate: None,
            recognizer_running: false,
            resume_at: None,
            turn: 0,
            work: CancellationToken::new(),
            prompt: None,
            response: String::new(),
            speaking: None,
        };

        tokio::spawn(actor.run(cmd_rx, recognizer_rx, inbound_rx, notice_rx));

        (ConversationHandle { cmd_tx, state_rx }, event_rx)
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut recognizer_rx: mpsc::UnboundedReceiver<RecognizerMessage>,
        mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
        mut notice_rx: mpsc::UnboundedReceiver<RenderNotice>,
    ) {
        tracing::debug!("Conversation started");

        loop {
            let silence = self.candidate.as_ref().and_then(TurnCandidate::silence_deadline);
            let resume = self.resume_at;

            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(message) = recognizer_rx.recv() => self.on_recognizer(message),
                Some(message) = inbound_rx.recv() => self.on_inbound(message),
                Some(notice) = notice_rx.recv() => {
                    if let Some(finished) = self.player.on_notice(notice) {
                        self.on_playback_finished(finished);
                    }
                }
                () = tokio::time::sleep_until(silence.unwrap_or_else(Instant::now)), if silence.is_some() => {
                    self.on_silence();
                }
                () = tokio::time::sleep_until(resume.unwrap_or_else(Instant::now)), if resume.is_some() => {
                    self.resume_at = None;
                    self.begin_listening();
                }
            }
        }

        self.stop_all();
        self.set_state(ConversationState::Idle);
        tracing::debug!("Conversation shut down");
    }

    // ── Commands ───────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        tracing::debug!(?command, state = %self.state, "Conversation command");
        match command {
            Command::Start => {
                if self.state == ConversationState::Idle {
                    self.retry.reset();
                    self.begin_listening();
                }
            }
            Command::Stop => {
                self.stop_all();
                self.set_state(ConversationState::Idle);
            }
            Command::Interrupt => {
                self.stop_all();
                self.begin_listening();
            }
            Command::SubmitText(text) => {
                let Some(utterance) = Utterance::typed(&text) else {
                    tracing::debug!("Ignoring blank typed input");
                    return;
                };
                self.stop_all();
                self.emit(ConversationEvent::UserTurn(utterance.clone()));
                self.begin_processing(utterance.text);
            }
            Command::SetContinuous(continuous) => {
                self.config.continuous = continuous;
                // Waiting out the grace period or a retry cooldown: do not reopen
                if !continuous && self.resume_at.is_some() {
                    self.go_idle();
                }
            }
            Command::SetAutoSpeak(auto_speak) => self.config.auto_speak = auto_speak,
            Command::Shutdown => {}
        }
    }

    // ── Listening ──────────────────────────────────────────────────

    fn begin_listening(&mut self) {
        self.resume_at = None;

        if let Err(e) = self.acquire(AudioMode::Capture) {
            tracing::warn!(error = %e, "Cannot open microphone");
            self.emit(ConversationEvent::Notice(format!("Microphone unavailable: {e}")));
            self.go_idle();
            return;
        }

        self.session += 1;
        self.candidate = Some(TurnCandidate::new(self.config.turn));
        let sink = RecognitionSink::new(self.session, self.recognizer_tx.clone());
        if let Err(e) = self.deps.recognizer.start(sink) {
            tracing::warn!(error = %e, "Recognizer failed to start");
            self.candidate = None;
            self.emit(ConversationEvent::Notice(format!("Speech recognition unavailable: {e}")));
            self.go_idle();
            return;
        }
        self.recognizer_running = true;

        tracing::debug!(session = self.session, "Listening session started");
        self.set_state(ConversationState::Listening);
    }

    /// Stop the recognizer and invalidate the current listening session.
    fn end_listening_session(&mut self) {
        if self.recognizer_running {
            self.deps.recognizer.stop();
            self.recognizer_running = false;
        }
        self.candidate = None;
        self.session += 1;
    }

    fn on_recognizer(&mut self, message: RecognizerMessage) {
        if message.session != self.session || self.candidate.is_none() {
            tracing::trace!(session = message.session, current = self.session, "Stale recognizer event");
            return;
        }

        match message.event {
            RecognizerEvent::Update { text, is_final } => {
                let fired = self
                    .candidate
                    .as_mut()
                    .and_then(|candidate| candidate.update(&text, is_final, Instant::now()));
                self.emit(ConversationEvent::Transcript { text, is_final });
                if let Some(utterance) = fired {
                    self.on_utterance(utterance);
                }
            }
            RecognizerEvent::Failed(error) => self.on_recognizer_error(error),
        }
    }

    fn on_silence(&mut self) {
        let fired = self
            .candidate
            .as_mut()
            .and_then(|candidate| candidate.on_silence(Instant::now()));
        if let Some(utterance) = fired {
            self.on_utterance(utterance);
        }
    }

    fn on_recognizer_error(&mut self, error: RecognitionError) {
        self.end_listening_session();

        match error {
            RecognitionError::Transient(message) => {
                if !self.config.continuous {
                    tracing::debug!(error = %message, "Recognizer stopped");
                    self.go_idle();
                    return;
                }
                match self.retry.on_error(ErrorKind::RecognitionTransient, &message) {
                    RetryDecision::RetryAfter(cooldown) => {
                        // Keep the capture lease through the cooldown
                        self.resume_at = Some(Instant::now() + cooldown);
                    }
                    RetryDecision::GiveUp => self.go_idle(),
                }
            }
            RecognitionError::Fatal(message) => {
                tracing::error!(error = %message, "Recognizer failed");
                self.emit(ConversationEvent::Notice(format!(
                    "Speech recognition stopped: {message}"
                )));
                self.go_idle();
            }
        }
    }

    fn on_utterance(&mut self, utterance: Utterance) {
        if !self.gate.should_accept(&utterance.text, Instant::now()) {
            self.end_listening_session();
            self.begin_listening();
            return;
        }

        self.retry.on_success();
        self.end_listening_session();
        self.release_lease();
        self.emit(ConversationEvent::UserTurn(utterance.clone()));
        self.begin_processing(utterance.text);
    }

    // ── Processing ─────────────────────────────────────────────────

    fn begin_processing(&mut self, prompt: String) {
        self.turn += 1;
        let turn = self.turn;
        self.work = CancellationToken::new();
        self.response.clear();
        self.prompt = Some(prompt.clone());
        self.set_state(ConversationState::Processing);

        let generator = Arc::clone(&self.deps.generator);
        let history: Vec<Exchange> = self.history.iter().cloned().collect();
        let tx = self.inbound_tx.clone();
        let token = self.work.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                () = token.cancelled() => return,
                result = stream_reply(generator.as_ref(), &prompt, &history, turn, &tx) => result,
            };
            let _ = tx.send(Inbound::GenerationFinished { turn, result });
        });
    }

    fn on_generation_finished(&mut self, result: Result<(), VoiceError>) {
        let reply = self.response.trim().to_string();
        let prompt = self.prompt.take().unwrap_or_default();

        let failure = match result {
            Ok(()) if reply.is_empty() => Some("empty response".to_string()),
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            let _ = self.retry.on_error(ErrorKind::GenerationTransport, &reason);
            let notice = self.config.fallback_notice.clone();
            self.remember(prompt, notice.clone());
            self.emit(ConversationEvent::Notice(notice.clone()));
            self.respond(notice, true);
            return;
        }

        self.retry.on_success();
        self.remember(prompt, reply.clone());
        self.emit(ConversationEvent::Response(reply.clone()));
        self.respond(reply, false);
    }

    fn respond(&mut self, text: String, is_notice: bool) {
        if self.config.auto_speak {
            self.begin_speaking(text, is_notice);
        } else {
            self.finish_turn(false);
        }
    }

    fn remember(&mut self, user: String, assistant: String) {
        if self.config.history_limit == 0 {
            return;
        }
        self.history.push_back(Exchange { user, assistant });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    // ── Speaking ───────────────────────────────────────────────────

    fn begin_speaking(&mut self, text: String, is_notice: bool) {
        if let Err(e) = self.acquire(AudioMode::Playback) {
            tracing::warn!(error = %e, "Cannot open speaker");
            self.emit(ConversationEvent::Notice(format!("Speaker unavailable: {e}")));
            self.go_idle();
            return;
        }

        let request = self.player.start(&text).request();
        self.gate.start_speaking(&text, Instant::now());
        self.speaking = Some(Speech { request, is_notice });
        self.set_state(ConversationState::Speaking);
        self.emit(ConversationEvent::SpeakingStarted);

        let synthesizer = Arc::clone(&self.deps.synthesizer);
        let tx = self.inbound_tx.clone();
        let token = self.work.clone();
        let turn = self.turn;

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = stream_speech(synthesizer.as_ref(), &text, turn, request, &tx) => {}
            }
        });
    }

    fn on_synthesis_failed(&mut self, request: u64, error: &VoiceError) {
        let Some(speech) = self.speaking.filter(|s| s.request == request) else {
            return;
        };
        tracing::warn!(request, error = %error, "Speech synthesis failed");
        let _ = self
            .retry
            .on_error(ErrorKind::SynthesisTransport, &error.to_string());

        self.speaking = None;
        self.player.cancel();
        self.emit(ConversationEvent::SpeakingFinished(PlaybackOutcome::Cancelled));
        self.release_lease();

        if speech.is_notice {
            self.finish_turn(false);
        } else {
            let notice = self.config.fallback_notice.clone();
            self.emit(ConversationEvent::Notice(notice.clone()));
            self.begin_speaking(notice, true);
        }
    }

    fn on_playback_finished(&mut self, finished: Finished) {
        if self.speaking.is_none_or(|s| s.request != finished.request) {
            return;
        }
        self.speaking = None;
        self.emit(ConversationEvent::SpeakingFinished(finished.outcome));
        self.release_lease();
        self.finish_turn(true);
    }

    /// Back to Listening (continuous) or Idle once a turn is over.
    fn finish_turn(&mut self, after_playback: bool) {
        self.prompt = None;
        if !self.config.continuous {
            self.go_idle();
            return;
        }
        if after_playback {
            // The microphone reopens once the grace period has passed
            self.set_state(ConversationState::Listening);
            self.resume_at = Some(Instant::now() + self.config.grace_period);
        } else {
            self.begin_listening();
        }
    }

    // ── Inbound task results ───────────────────────────────────────

    fn on_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::GenerationDelta { turn, text } => {
                if turn == self.turn && self.state == ConversationState::Processing {
                    self.response.push_str(&text);
                    self.emit(ConversationEvent::ResponseDelta(text));
                }
            }
            Inbound::GenerationFinished { turn, result } => {
                if turn == self.turn && self.state == ConversationState::Processing {
                    self.on_generation_finished(result);
                }
            }
            Inbound::SynthesisChunk {
                turn,
                request,
                chunk,
            } => {
                if turn == self.turn {
                    self.player.feed(request, &chunk);
                }
            }
            Inbound::SynthesisEnded { turn, request } => {
                if turn == self.turn {
                    if let Some(finished) = self.player.end_of_stream(request) {
                        self.on_playback_finished(finished);
                    }
                }
            }
            Inbound::SynthesisFailed {
                turn,
                request,
                error,
            } => {
                if turn == self.turn {
                    self.on_synthesis_failed(request, &error);
                }
            }
        }
    }

    // ── Shared helpers ─────────────────────────────────────────────

    /// Acquire the audio device.
    ///
    /// A conflict with a lease this conversation holds itself is resolved by
    /// releasing it and retrying as the retry policy allows. A lease held by
    /// anyone else is left alone and reported as a conflict.
    fn acquire(&mut self, mode: AudioMode) -> Result<(), VoiceError> {
        if self.held != Some(mode) {
            if let Some(held_by) = self.deps.arbiter.lease().mode().filter(|m| *m == mode) {
                // Same mode, but not ours: sharing it would mean releasing it later
                return Err(VoiceError::ResourceConflict { held_by });
            }
        }

        let retries = self.config.retry.resource_conflict.max_attempts;
        let mut attempt = 0;
        loop {
            match self.deps.arbiter.request(mode) {
                Ok(()) => {
                    self.held = Some(mode);
                    return Ok(());
                }
                Err(VoiceError::ResourceConflict { held_by })
                    if self.held == Some(held_by) && attempt < retries =>
                {
                    attempt += 1;
                    tracing::debug!(%mode, %held_by, attempt, "Releasing own competing lease");
                    self.release_lease();
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the lease this conversation holds, if any.
    fn release_lease(&mut self) {
        if self.held.take().is_some() {
            self.deps.arbiter.release();
        }
    }

    /// Cancel everything in flight and release the device. Idempotent.
    fn stop_all(&mut self) {
        self.work.cancel();
        self.work = CancellationToken::new();
        self.turn += 1;

        self.player.cancel();
        if self.speaking.take().is_some() {
            self.emit(ConversationEvent::SpeakingFinished(PlaybackOutcome::Cancelled));
        }

        self.end_listening_session();
        self.resume_at = None;
        self.prompt = None;
        self.response.clear();
        self.release_lease();
    }

    fn go_idle(&mut self) {
        self.stop_all();
        self.set_state(ConversationState::Idle);
    }

    fn set_state(&mut self, new_state: ConversationState) {
        if self.state != new_state {
            tracing::debug!(old = %self.state, new = %new_state, "Conversation state transition");
            self.state = new_state;
            self.state_tx.send_replace(new_state);
            self.emit(ConversationEvent::StateChanged(new_state));
        }
    }

    fn emit(&self, event: ConversationEvent) {
        if self.event_tx.send(event).is_err() {
            tracing::trace!("Conversation event receiver dropped");
        }
    }
}

// ── Background tasks ───────────────────────────────────────────────

async fn stream_reply(
    generator: &dyn TextGenerator,
    prompt: &str,
    history: &[Exchange],
    turn: u64,
    tx: &mpsc::UnboundedSender<Inbound>,
) -> Result<(), VoiceError> {
    let mut deltas = generator.generate(prompt, history).await?;
    while let Some(delta) = deltas.next().await {
        let text = delta?;
        if tx.send(Inbound::GenerationDelta { turn, text }).is_err() {
            return Err(VoiceError::Cancelled);
        }
    }
    Ok(())
}

async fn stream_speech(
    synthesizer: &dyn SpeechSynthesizer,
    text: &str,
    turn: u64,
    request: u64,
    tx: &mpsc::UnboundedSender<Inbound>,
) {
    let mut chunks = match synthesizer.synthesize(text).await {
        Ok(chunks) => chunks,
        Err(error) => {
            let _ = tx.send(Inbound::SynthesisFailed {
                turn,
                request,
                error,
            });
            return;
        }
    };

    while let Some(chunk) = chunks.next().await {
        let message = match chunk {
            Ok(chunk) => Inbound::SynthesisChunk {
                turn,
                request,
                chunk,
            },
            Err(error) => {
                let _ = tx.send(Inbound::SynthesisFailed {
                    turn,
                    request,
                    error,
                });
                return;
            }
        };
        if tx.send(message).is_err() {
            return;
        }
    }
    let _ = tx.send(Inbound::SynthesisEnded { turn, request });
}
