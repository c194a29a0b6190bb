//! Integration tests for the `Conversation` state machine.
//!
//! The conversation is driven end to end with mock recognizer, generator,
//! synthesizer and renderer. Tokio time is paused, so silence thresholds,
//! grace periods and retry cooldowns elapse instantly and deterministically.
//!
//! # What is tested
//!
//! - Silence and final-marker turn detection through the actor
//! - Full Listening → Processing → Speaking → Listening cycle with grace period
//! - Barge-in during playback, late chunks after cancellation
//! - Auto-speak off, non-continuous mode, typed turns
//! - Fallback notice on generation and synthesis failure
//! - Echo suppression of the assistant's own words
//! - Recognizer retry after transient errors, Idle after fatal ones
//! - Audio lease handover and shutdown

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use stoa_voice::backend::{AudioChunk, ChunkStream, DeltaStream, Exchange};
use stoa_voice::config::DEFAULT_FALLBACK_NOTICE;
use stoa_voice::render::RenderedCallback;
use stoa_voice::{
    AudioArbiter, AudioFormat, AudioLease, AudioMode, AudioRenderer, Collaborators, Conversation,
    ConversationConfig, ConversationEvent, ConversationHandle, ConversationState, OutputFormat,
    PlaybackOutcome, RecognitionError, RecognitionSink, SpeechRecognizer, SpeechSynthesizer,
    TextGenerator, TurnTrigger, VoiceError,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

// ── Mock backends ──────────────────────────────────────────────────

/// Records every session sink; the test speaks through the latest one.
#[derive(Default)]
struct MockRecognizer {
    sinks: Mutex<Vec<RecognitionSink>>,
    stops: AtomicUsize,
}

impl MockRecognizer {
    fn starts(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn sink(&self) -> RecognitionSink {
        self.sinks.lock().unwrap().last().cloned().expect("recognizer never started")
    }
}

impl SpeechRecognizer for MockRecognizer {
    fn start(&self, sink: RecognitionSink) -> Result<(), VoiceError> {
        self.sinks.lock().unwrap().push(sink);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
enum Reply {
    Deltas(Vec<&'static str>),
    Fail,
    Hang,
}

/// Replies with canned deltas and records each prompt with its history.
struct MockGenerator {
    reply: Mutex<Reply>,
    calls: Mutex<Vec<(String, Vec<Exchange>)>>,
}

impl MockGenerator {
    fn new(reply: Reply) -> Self {
        Self {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    fn calls(&self) -> Vec<(String, Vec<Exchange>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(&self, prompt: &str, history: &[Exchange]) -> Result<DeltaStream, VoiceError> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), history.to_vec()));
        match self.reply.lock().unwrap().clone() {
            Reply::Deltas(deltas) => {
                Ok(stream::iter(deltas.into_iter().map(|d| Ok(d.to_string()))).boxed())
            }
            Reply::Fail => Err(VoiceError::GenerationTransport("HTTP 503".into())),
            Reply::Hang => Ok(stream::pending().boxed()),
        }
    }
}

#[derive(Clone, Copy)]
enum Speech {
    /// Emit this many chunks, then end the stream.
    Chunks(u64),
    /// Fail before producing audio.
    Fail,
    /// Chunks are pushed by the test through `senders`.
    Manual,
}

type ChunkSender = mpsc::UnboundedSender<Result<AudioChunk, VoiceError>>;

struct MockSynthesizer {
    modes: Mutex<VecDeque<Speech>>,
    fallback: Speech,
    texts: Mutex<Vec<String>>,
    senders: Mutex<Vec<ChunkSender>>,
}

impl MockSynthesizer {
    fn new(fallback: Speech) -> Self {
        Self {
            modes: Mutex::new(VecDeque::new()),
            fallback,
            texts: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Use `mode` for the next request only.
    fn then(&self, mode: Speech) {
        self.modes.lock().unwrap().push_back(mode);
    }

    fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    fn sender(&self) -> ChunkSender {
        self.senders.lock().unwrap().last().cloned().expect("no manual request")
    }
}

fn chunk(seq: u64) -> AudioChunk {
    AudioChunk {
        data: Bytes::from_static(&[0, 1, 0, 2, 0, 3, 0, 4]),
        format: AudioFormat::pcm16(22_050, 1),
        seq,
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<ChunkStream, VoiceError> {
        self.texts.lock().unwrap().push(text.to_string());
        let mode = self.modes.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match mode {
            Speech::Chunks(n) => Ok(stream::iter((0..n).map(|seq| Ok(chunk(seq)))).boxed()),
            Speech::Fail => Err(VoiceError::SynthesisTransport("HTTP 401".into())),
            Speech::Manual => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.senders.lock().unwrap().push(tx);
                Ok(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed())
            }
        }
    }
}

/// Holds render callbacks until the test "plays" them.
#[derive(Default)]
struct ManualRenderer {
    pending: Mutex<Vec<RenderedCallback>>,
    scheduled: AtomicUsize,
    stops: AtomicUsize,
}

impl ManualRenderer {
    fn play_all(&self) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for cb in pending {
            cb();
        }
    }

    fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AudioRenderer for ManualRenderer {
    fn output_format(&self) -> OutputFormat {
        OutputFormat {
            sample_rate: 22_050,
            channels: 1,
        }
    }

    fn schedule(&self, _samples: Vec<f32>, on_rendered: RenderedCallback) -> Result<(), VoiceError> {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().push(on_rendered);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().unwrap().clear();
    }
}

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    handle: ConversationHandle,
    events: mpsc::UnboundedReceiver<ConversationEvent>,
    recognizer: Arc<MockRecognizer>,
    generator: Arc<MockGenerator>,
    synthesizer: Arc<MockSynthesizer>,
    renderer: Arc<ManualRenderer>,
    arbiter: Arc<AudioArbiter>,
}

fn harness(config: ConversationConfig, reply: Reply, speech: Speech) -> Harness {
    harness_with_arbiter(config, reply, speech, Arc::new(AudioArbiter::desktop()))
}

fn harness_with_arbiter(
    config: ConversationConfig,
    reply: Reply,
    speech: Speech,
    arbiter: Arc<AudioArbiter>,
) -> Harness {
    let recognizer = Arc::new(MockRecognizer::default());
    let generator = Arc::new(MockGenerator::new(reply));
    let synthesizer = Arc::new(MockSynthesizer::new(speech));
    let renderer = Arc::new(ManualRenderer::default());

    let (handle, events) = Conversation::spawn(
        config,
        Collaborators {
            recognizer: recognizer.clone(),
            generator: generator.clone(),
            synthesizer: synthesizer.clone(),
            renderer: renderer.clone(),
            arbiter: arbiter.clone(),
        },
    );

    Harness {
        handle,
        events,
        recognizer,
        generator,
        synthesizer,
        renderer,
        arbiter,
    }
}

fn quiet() -> ConversationConfig {
    ConversationConfig {
        auto_speak: false,
        continuous: false,
        ..ConversationConfig::default()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Drain all pending events from the event receiver and return them.
fn drain_events(rx: &mut mpsc::UnboundedReceiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

/// Collect only the state values from `StateChanged` events.
fn states_from(events: &[ConversationEvent]) -> Vec<ConversationState> {
    events
        .iter()
        .filter_map(|e| {
            if let ConversationEvent::StateChanged(s) = e {
                Some(*s)
            } else {
                None
            }
        })
        .collect()
}

/// Receive events until one matches; returns everything seen, match included.
async fn until_event(
    rx: &mut mpsc::UnboundedReceiver<ConversationEvent>,
    pred: impl Fn(&ConversationEvent) -> bool,
) -> Vec<ConversationEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for event; saw {seen:?}"))
            .expect("event channel closed");
        let matched = pred(&event);
        seen.push(event);
        if matched {
            return seen;
        }
    }
}

async fn until_state(
    rx: &mut mpsc::UnboundedReceiver<ConversationEvent>,
    state: ConversationState,
) -> Vec<ConversationEvent> {
    until_event(rx, |e| *e == ConversationEvent::StateChanged(state)).await
}

/// Poll `cond` in 1 ms virtual-time steps.
async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached within 10 s");
}

/// Let spawned tasks run without advancing time meaningfully.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn user_turn(events: &[ConversationEvent]) -> Option<&stoa_voice::Utterance> {
    events.iter().find_map(|e| match e {
        ConversationEvent::UserTurn(u) => Some(u),
        _ => None,
    })
}

// ── Turn detection ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn silence_finalizes_a_single_partial() {
    let mut h = harness(quiet(), Reply::Deltas(vec!["Hi."]), Speech::Chunks(1));
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    let spoken_at = Instant::now();
    h.recognizer.sink().update("Hello", false);

    let events = until_state(&mut h.events, ConversationState::Processing).await;
    let turn = user_turn(&events).expect("user turn");
    assert_eq!(turn.text, "Hello");
    assert_eq!(turn.trigger, TurnTrigger::Silence);
    assert!(spoken_at.elapsed() >= Duration::from_millis(600));

    until_state(&mut h.events, ConversationState::Idle).await;
    assert_eq!(h.generator.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_final_after_turn_is_ignored() {
    let mut h = harness(quiet(), Reply::Deltas(vec!["Fine."]), Speech::Chunks(1));
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sink = h.recognizer.sink();
    sink.update("Stop", true);

    let events = until_state(&mut h.events, ConversationState::Processing).await;
    assert_eq!(user_turn(&events).unwrap().trigger, TurnTrigger::FinalMarker);

    sink.update("Stop", true);
    until_state(&mut h.events, ConversationState::Idle).await;
    settle().await;

    let rest = drain_events(&mut h.events);
    assert!(user_turn(&rest).is_none(), "unexpected events: {rest:?}");
    assert_eq!(h.generator.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transcripts_are_forwarded_while_listening() {
    let mut h = harness(quiet(), Reply::Deltas(vec!["Ok."]), Speech::Chunks(1));
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    h.recognizer.sink().update("what is", false);
    let events = until_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::Transcript { .. })
    })
    .await;
    assert_eq!(
        events.last(),
        Some(&ConversationEvent::Transcript {
            text: "what is".into(),
            is_final: false
        })
    );
}

// ── Full cycle ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn speaks_reply_and_resumes_listening_after_grace() {
    let mut h = harness(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Virtue ", "is ", "knowledge."]),
        Speech::Chunks(3),
    );
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;
    assert_eq!(h.arbiter.lease(), AudioLease::Capture);

    h.recognizer.sink().update("What is virtue?", true);
    let events = until_event(&mut h.events, |e| *e == ConversationEvent::SpeakingStarted).await;

    let deltas: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::ResponseDelta(d) => Some(d.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Virtue ", "is ", "knowledge."]);
    assert!(events.contains(&ConversationEvent::Response("Virtue is knowledge.".into())));
    assert_eq!(
        states_from(&events),
        vec![ConversationState::Processing, ConversationState::Speaking]
    );
    assert_eq!(h.arbiter.lease(), AudioLease::Playback);
    assert_eq!(h.recognizer.stops(), 1);

    let renderer = h.renderer.clone();
    wait_until(|| renderer.scheduled() == 3).await;
    settle().await;

    // Stream ended but nothing has been heard yet
    assert_eq!(h.handle.state(), ConversationState::Speaking);
    h.renderer.play_all();

    until_event(&mut h.events, |e| {
        *e == ConversationEvent::SpeakingFinished(PlaybackOutcome::Completed)
    })
    .await;
    let finished_at = Instant::now();
    until_state(&mut h.events, ConversationState::Listening).await;
    assert_eq!(h.arbiter.lease(), AudioLease::None);

    let recognizer = h.recognizer.clone();
    wait_until(|| recognizer.starts() == 2).await;
    assert!(finished_at.elapsed() >= Duration::from_millis(500));
    assert_eq!(h.arbiter.lease(), AudioLease::Capture);

    // The finished exchange is context for the next turn
    h.recognizer.sink().update("And courage?", true);
    until_event(&mut h.events, |e| matches!(e, ConversationEvent::Response(_))).await;
    let calls = h.generator.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].1,
        vec![Exchange {
            user: "What is virtue?".into(),
            assistant: "Virtue is knowledge.".into(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn disabling_continuous_during_grace_keeps_microphone_closed() {
    let mut h = harness(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Enough."]),
        Speech::Chunks(1),
    );
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;
    h.recognizer.sink().update("One question", true);
    until_event(&mut h.events, |e| *e == ConversationEvent::SpeakingStarted).await;

    let renderer = h.renderer.clone();
    wait_until(|| renderer.scheduled() == 1).await;
    settle().await;
    h.renderer.play_all();
    until_state(&mut h.events, ConversationState::Listening).await;

    // Still inside the grace period
    h.handle.set_continuous(false).unwrap();
    until_state(&mut h.events, ConversationState::Idle).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.recognizer.starts(), 1);
    assert_eq!(h.handle.state(), ConversationState::Idle);
    assert_eq!(h.arbiter.lease(), AudioLease::None);
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_playback_listens_immediately() {
    let mut h = harness(
        ConversationConfig::default(),
        Reply::Deltas(vec!["A long answer."]),
        Speech::Manual,
    );
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;
    h.recognizer.sink().update("Tell me a story", true);
    until_event(&mut h.events, |e| *e == ConversationEvent::SpeakingStarted).await;

    let renderer = h.renderer.clone();
    let synthesizer = h.synthesizer.clone();
    wait_until(|| !synthesizer.senders.lock().unwrap().is_empty()).await;
    let sender = h.synthesizer.sender();
    sender.send(Ok(chunk(0))).unwrap();
    wait_until(|| renderer.scheduled() == 1).await;

    h.handle.interrupt().unwrap();
    let events = until_state(&mut h.events, ConversationState::Listening).await;
    assert!(events.contains(&ConversationEvent::SpeakingFinished(PlaybackOutcome::Cancelled)));
    assert!(h.renderer.stops() >= 1);
    assert_eq!(h.arbiter.lease(), AudioLease::Capture);
    assert_eq!(h.recognizer.starts(), 2);

    // Late audio from the abandoned request is never scheduled
    let _ = sender.send(Ok(chunk(1)));
    settle().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.renderer.scheduled(), 1);
    assert_eq!(h.handle.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn auto_speak_off_skips_speaking() {
    let config = ConversationConfig {
        auto_speak: false,
        ..ConversationConfig::default()
    };
    let mut h = harness(config, Reply::Deltas(vec!["Quietly."]), Speech::Chunks(1));
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    h.recognizer.sink().update("Answer silently", true);
    until_state(&mut h.events, ConversationState::Processing).await;
    let events = until_state(&mut h.events, ConversationState::Listening).await;

    assert!(events.contains(&ConversationEvent::Response("Quietly.".into())));
    assert!(!events.contains(&ConversationEvent::SpeakingStarted));
    assert!(h.synthesizer.texts().is_empty());
    assert_eq!(h.arbiter.lease(), AudioLease::Capture);
}

#[tokio::test(start_paused = true)]
async fn toggling_auto_speak_at_runtime() {
    let config = ConversationConfig {
        auto_speak: false,
        continuous: false,
        ..ConversationConfig::default()
    };
    let mut h = harness(config, Reply::Deltas(vec!["Aloud."]), Speech::Chunks(1));
    h.handle.set_auto_speak(true).unwrap();
    h.handle.submit_text("Speak up").unwrap();

    until_event(&mut h.events, |e| *e == ConversationEvent::SpeakingStarted).await;
    assert_eq!(h.synthesizer.texts(), vec!["Aloud.".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn non_continuous_mode_goes_idle_after_playback() {
    let config = ConversationConfig {
        continuous: false,
        ..ConversationConfig::default()
    };
    let mut h = harness(config, Reply::Deltas(vec!["Goodbye."]), Speech::Chunks(1));
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    h.recognizer.sink().update("That is all", true);
    until_event(&mut h.events, |e| *e == ConversationEvent::SpeakingStarted).await;
    let renderer = h.renderer.clone();
    wait_until(|| renderer.scheduled() == 1).await;
    h.renderer.play_all();

    until_state(&mut h.events, ConversationState::Idle).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.arbiter.lease(), AudioLease::None);
    assert_eq!(h.recognizer.starts(), 1);
    assert_eq!(h.handle.state(), ConversationState::Idle);
}

// ── Typed input ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn typed_turns_skip_recognition() {
    let mut h = harness(quiet(), Reply::Deltas(vec!["Because."]), Speech::Chunks(1));

    h.handle.submit_text("   ").unwrap();
    settle().await;
    assert!(drain_events(&mut h.events).is_empty());
    assert_eq!(h.handle.state(), ConversationState::Idle);

    h.handle.submit_text(" Why? ").unwrap();
    let events = until_state(&mut h.events, ConversationState::Processing).await;
    let turn = user_turn(&events).unwrap();
    assert_eq!(turn.text, "Why?");
    assert_eq!(turn.trigger, TurnTrigger::Typed);

    until_state(&mut h.events, ConversationState::Idle).await;
    assert_eq!(h.generator.calls()[0].0, "Why?");
    assert_eq!(h.recognizer.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn typed_turn_replaces_pending_generation() {
    let mut h = harness(quiet(), Reply::Hang, Speech::Chunks(1));
    h.handle.submit_text("First").unwrap();
    until_state(&mut h.events, ConversationState::Processing).await;

    h.generator.set_reply(Reply::Deltas(vec!["Second answer."]));
    h.handle.submit_text("Second").unwrap();

    let events = until_state(&mut h.events, ConversationState::Idle).await;
    assert!(events.contains(&ConversationEvent::Response("Second answer.".into())));
    let calls = h.generator.calls();
    assert_eq!(calls.len(), 2);
    // The abandoned turn never produced an exchange
    assert!(calls[1].1.is_empty());
}

// ── Failures ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn generation_failure_speaks_fallback_notice() {
    let mut h = harness(ConversationConfig::default(), Reply::Fail, Speech::Chunks(1));
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    h.recognizer.sink().update("Are you there?", true);
    let events = until_event(&mut h.events, |e| *e == ConversationEvent::SpeakingStarted).await;
    assert!(events.contains(&ConversationEvent::Notice(DEFAULT_FALLBACK_NOTICE.into())));
    assert_eq!(h.synthesizer.texts(), vec![DEFAULT_FALLBACK_NOTICE.to_string()]);

    let renderer = h.renderer.clone();
    wait_until(|| renderer.scheduled() == 1).await;
    h.renderer.play_all();
    until_event(&mut h.events, |e| {
        *e == ConversationEvent::SpeakingFinished(PlaybackOutcome::Completed)
    })
    .await;

    // The fallback is remembered as the assistant's answer
    h.generator.set_reply(Reply::Deltas(vec!["Yes."]));
    h.handle.submit_text("Try again").unwrap();
    until_event(&mut h.events, |e| matches!(e, ConversationEvent::Response(_))).await;
    let calls = h.generator.calls();
    assert_eq!(calls[1].1.len(), 1);
    assert_eq!(calls[1].1[0].assistant, DEFAULT_FALLBACK_NOTICE);
}

#[tokio::test(start_paused = true)]
async fn empty_reply_counts_as_failure() {
    let mut h = harness(quiet(), Reply::Deltas(vec!["  ", "\n"]), Speech::Chunks(1));
    h.handle.submit_text("Hello?").unwrap();

    let events = until_state(&mut h.events, ConversationState::Idle).await;
    assert!(events.contains(&ConversationEvent::Notice(DEFAULT_FALLBACK_NOTICE.into())));
    assert!(!events.iter().any(|e| matches!(e, ConversationEvent::Response(_))));
}

#[tokio::test(start_paused = true)]
async fn synthesis_failure_falls_back_once() {
    let config = ConversationConfig {
        continuous: false,
        ..ConversationConfig::default()
    };
    let mut h = harness(config, Reply::Deltas(vec!["Hello."]), Speech::Fail);
    h.handle.submit_text("Greet me").unwrap();

    let events = until_state(&mut h.events, ConversationState::Idle).await;
    assert!(events.contains(&ConversationEvent::Notice(DEFAULT_FALLBACK_NOTICE.into())));
    // The reply, then the notice; the notice failing is not retried
    assert_eq!(
        h.synthesizer.texts(),
        vec!["Hello.".to_string(), DEFAULT_FALLBACK_NOTICE.to_string()]
    );
    assert_eq!(h.arbiter.lease(), AudioLease::None);
}

#[tokio::test(start_paused = true)]
async fn transient_recognizer_error_restarts_after_cooldown() {
    let mut h = harness(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Ok."]),
        Speech::Chunks(1),
    );
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    let failed_at = Instant::now();
    h.recognizer
        .sink()
        .fail(RecognitionError::Transient("network".into()));

    let recognizer = h.recognizer.clone();
    wait_until(|| recognizer.starts() == 2).await;
    assert!(failed_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(h.handle.state(), ConversationState::Listening);
    assert_eq!(h.arbiter.lease(), AudioLease::Capture);

    h.recognizer
        .sink()
        .fail(RecognitionError::Fatal("permission denied".into()));
    let events = until_state(&mut h.events, ConversationState::Idle).await;
    assert!(events.iter().any(|e| matches!(e, ConversationEvent::Notice(_))));
    assert_eq!(h.arbiter.lease(), AudioLease::None);
}

#[tokio::test(start_paused = true)]
async fn recognizer_gives_up_after_retry_budget() {
    let mut h = harness(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Ok."]),
        Speech::Chunks(1),
    );
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    for attempt in 1..=5 {
        h.recognizer
            .sink()
            .fail(RecognitionError::Transient("no match".into()));
        let recognizer = h.recognizer.clone();
        wait_until(|| recognizer.starts() == attempt + 1).await;
    }

    h.recognizer
        .sink()
        .fail(RecognitionError::Transient("no match".into()));
    until_state(&mut h.events, ConversationState::Idle).await;
    assert_eq!(h.recognizer.starts(), 6);
}

// ── Echo guard ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn assistant_echo_is_suppressed() {
    let mut h = harness(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Yes, life is change indeed."]),
        Speech::Chunks(1),
    );
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;
    h.recognizer.sink().update("Is life change?", true);

    until_event(&mut h.events, |e| *e == ConversationEvent::SpeakingStarted).await;
    let renderer = h.renderer.clone();
    wait_until(|| renderer.scheduled() == 1).await;
    h.renderer.play_all();

    let recognizer = h.recognizer.clone();
    wait_until(|| recognizer.starts() == 2).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    drain_events(&mut h.events);

    // The microphone picked up the assistant's own words
    let stale = h.recognizer.sink();
    stale.update("yes life is change indeed", true);
    wait_until(|| recognizer.starts() == 3).await;
    let events = drain_events(&mut h.events);
    assert!(user_turn(&events).is_none());
    assert_eq!(h.generator.calls().len(), 1);

    // The old session's sink is dead
    stale.update("what about free will", true);
    settle().await;
    assert!(user_turn(&drain_events(&mut h.events)).is_none());

    h.recognizer.sink().update("what about free will", true);
    let events = until_state(&mut h.events, ConversationState::Processing).await;
    assert_eq!(user_turn(&events).unwrap().text, "what about free will");
}

// ── Audio lease and lifecycle ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn foreign_lease_is_never_taken_over() {
    let arbiter = Arc::new(AudioArbiter::desktop());
    arbiter.request(AudioMode::Playback).unwrap();

    let mut h = harness_with_arbiter(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Ok."]),
        Speech::Chunks(1),
        arbiter,
    );
    h.handle.start().unwrap();
    let events = until_event(&mut h.events, |e| matches!(e, ConversationEvent::Notice(_))).await;
    assert!(matches!(
        events.last(),
        Some(ConversationEvent::Notice(text)) if text.starts_with("Microphone unavailable")
    ));
    settle().await;

    assert_eq!(h.handle.state(), ConversationState::Idle);
    assert_eq!(h.arbiter.lease(), AudioLease::Playback);
    assert_eq!(h.recognizer.starts(), 0);

    // Once the other holder lets go, listening works
    h.arbiter.release();
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;
    assert_eq!(h.arbiter.lease(), AudioLease::Capture);
}

#[tokio::test(start_paused = true)]
async fn foreign_lease_of_same_mode_is_not_shared() {
    let arbiter = Arc::new(AudioArbiter::desktop());
    arbiter.request(AudioMode::Capture).unwrap();

    let mut h = harness_with_arbiter(quiet(), Reply::Deltas(vec!["Ok."]), Speech::Chunks(1), arbiter);
    h.handle.start().unwrap();
    until_event(&mut h.events, |e| matches!(e, ConversationEvent::Notice(_))).await;

    h.handle.stop().unwrap();
    settle().await;
    assert_eq!(h.handle.state(), ConversationState::Idle);
    assert_eq!(h.arbiter.lease(), AudioLease::Capture);
}

#[tokio::test(start_paused = true)]
async fn typed_turn_without_speaker_goes_idle_and_keeps_foreign_lease() {
    let arbiter = Arc::new(AudioArbiter::desktop());
    arbiter.request(AudioMode::Capture).unwrap();

    let mut h = harness_with_arbiter(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Ok."]),
        Speech::Chunks(1),
        arbiter,
    );
    h.handle.submit_text("Hello").unwrap();
    let events = until_event(&mut h.events, |e| {
        matches!(e, ConversationEvent::Notice(text) if text.starts_with("Speaker unavailable"))
    })
    .await;
    assert!(events.contains(&ConversationEvent::Response("Ok.".into())));
    until_state(&mut h.events, ConversationState::Idle).await;

    assert_eq!(h.arbiter.lease(), AudioLease::Capture);
    assert_eq!(h.synthesizer.texts(), Vec::<String>::new());
}

#[tokio::test(start_paused = true)]
async fn stop_while_speaking_goes_idle_for_good() {
    let mut h = harness(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Listen carefully."]),
        Speech::Manual,
    );
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;
    h.recognizer.sink().update("Say something", true);
    until_event(&mut h.events, |e| *e == ConversationEvent::SpeakingStarted).await;

    let synthesizer = h.synthesizer.clone();
    wait_until(|| !synthesizer.senders.lock().unwrap().is_empty()).await;
    let sender = h.synthesizer.sender();

    h.handle.stop().unwrap();
    let events = until_state(&mut h.events, ConversationState::Idle).await;
    assert!(events.contains(&ConversationEvent::SpeakingFinished(PlaybackOutcome::Cancelled)));

    let _ = sender.send(Ok(chunk(0)));
    drop(sender);
    tokio::time::sleep(Duration::from_secs(5)).await;

    let rest = drain_events(&mut h.events);
    assert!(states_from(&rest).is_empty(), "resurrected: {rest:?}");
    assert_eq!(h.handle.state(), ConversationState::Idle);
    assert_eq!(h.renderer.scheduled(), 0);
    assert_eq!(h.recognizer.starts(), 1);
    assert_eq!(h.arbiter.lease(), AudioLease::None);
}

#[tokio::test(start_paused = true)]
async fn wait_for_state_observes_transitions() {
    let h = harness(quiet(), Reply::Deltas(vec!["Ok."]), Speech::Chunks(1));
    h.handle.start().unwrap();
    h.handle
        .wait_for_state(ConversationState::Listening)
        .await
        .unwrap();
    assert_eq!(h.handle.state(), ConversationState::Listening);
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_everything() {
    let mut h = harness(
        ConversationConfig::default(),
        Reply::Deltas(vec!["Ok."]),
        Speech::Chunks(1),
    );
    h.handle.start().unwrap();
    until_state(&mut h.events, ConversationState::Listening).await;

    let handle = h.handle.clone();
    h.handle.shutdown().await;

    let events = drain_events(&mut h.events);
    assert_eq!(states_from(&events).last(), Some(&ConversationState::Idle));
    assert_eq!(h.recognizer.stops(), 1);
    assert_eq!(h.arbiter.lease(), AudioLease::None);
    assert!(matches!(handle.start(), Err(VoiceError::NotActive)));
}
