//! Streaming synthesis player: exact playback-completion tracking.
//!
//! A synthesizer produces audio faster than real time, so "the stream ended"
//! and "the user heard everything" are far apart. The player counts chunks
//! handed to the renderer (`scheduled`) and chunks the renderer reports as
//! played (`completed`), and resolves a request only when the stream has
//! ended *and* both counters agree.
//!
//! The player is a plain struct owned by one task (the conversation actor or
//! [`StreamingPlayer::play_stream`]). Renderer callbacks never touch it; they
//! post a [`RenderNotice`] tagged with the request id, and the owner feeds the
//! notice back through [`StreamingPlayer::on_notice`]. Notices, chunks and
//! end-of-stream markers for any request other than the current one are
//! ignored.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::backend::{AudioChunk, ChunkStream};
use crate::convert::ChunkConverter;
use crate::error::VoiceError;
use crate::render::AudioRenderer;

/// "Chunk `seq` of request `request` has been played."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderNotice {
    pub request: u64,
    pub seq: u64,
}

/// How a synthesis request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every scheduled chunk was played.
    Completed,
    /// Stopped early; remaining audio was discarded.
    Cancelled,
}

/// A request that just resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    pub request: u64,
    pub outcome: PlaybackOutcome,
    pub chunks: u64,
}

/// Waiter for one synthesis request. Cloneable; every clone sees the same
/// single outcome.
#[derive(Debug, Clone)]
pub struct SynthesisHandle {
    request: u64,
    rx: watch::Receiver<Option<PlaybackOutcome>>,
}

impl SynthesisHandle {
    pub const fn request(&self) -> u64 {
        self.request
    }

    /// The outcome, if already resolved.
    pub fn outcome(&self) -> Option<PlaybackOutcome> {
        *self.rx.borrow()
    }

    /// Wait until the request completes or is cancelled.
    ///
    /// A player dropped mid-request counts as cancelled.
    pub async fn await_completion(&mut self) -> PlaybackOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(PlaybackOutcome::Cancelled),
            Err(_) => PlaybackOutcome::Cancelled,
        }
    }
}

struct SynthesisRequest {
    id: u64,
    scheduled: u64,
    completed: u64,
    end_of_stream: bool,
    done: watch::Sender<Option<PlaybackOutcome>>,
}

impl SynthesisRequest {
    fn resolve(self, outcome: PlaybackOutcome) -> Finished {
        self.done.send_replace(Some(outcome));
        Finished {
            request: self.id,
            outcome,
            chunks: self.scheduled,
        }
    }
}

/// Converts and schedules synthesized audio, one request at a time.
pub struct StreamingPlayer {
    renderer: Arc<dyn AudioRenderer>,
    converter: ChunkConverter,
    notice_tx: mpsc::UnboundedSender<RenderNotice>,
    next_id: u64,
    current: Option<SynthesisRequest>,
}

impl StreamingPlayer {
    /// Create a player and the receiver its render notices arrive on.
    pub fn new(
        renderer: Arc<dyn AudioRenderer>,
        gain: f32,
    ) -> (Self, mpsc::UnboundedReceiver<RenderNotice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let converter = ChunkConverter::new(renderer.output_format(), gain);
        let player = Self {
            renderer,
            converter,
            notice_tx,
            next_id: 1,
            current: None,
        };
        (player, notice_rx)
    }

    /// Id of the request in flight, if any.
    pub fn current_request(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.id)
    }

    pub const fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Begin a new request, cancelling any request still in flight.
    pub fn start(&mut self, text: &str) -> SynthesisHandle {
        if let Some(previous) = self.cancel() {
            tracing::warn!(request = previous.request, "Superseded unfinished synthesis");
        }

        let id = self.next_id;
        self.next_id += 1;
        self.converter.reset();
        let (done, rx) = watch::channel(None);
        self.current = Some(SynthesisRequest {
            id,
            scheduled: 0,
            completed: 0,
            end_of_stream: false,
            done,
        });

        tracing::debug!(request = id, chars = text.len(), "Synthesis started");
        SynthesisHandle { request: id, rx }
    }

    /// Convert one chunk and hand it to the renderer.
    ///
    /// Returns whether the chunk was scheduled. Chunks that fail conversion
    /// are dropped with a warning; the request carries on.
    pub fn feed(&mut self, request: u64, chunk: &AudioChunk) -> bool {
        let Some(current) = self.current.as_mut().filter(|r| r.id == request) else {
            tracing::trace!(request, seq = chunk.seq, "Dropping chunk for stale request");
            return false;
        };
        if current.end_of_stream {
            tracing::warn!(request, seq = chunk.seq, "Chunk after end of stream ignored");
            return false;
        }

        let samples = match self.converter.convert(chunk.format, &chunk.data) {
            // Buffered by the resampler until a whole block is in
            Ok(samples) if samples.is_empty() => return false,
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(request, seq = chunk.seq, error = %e, "Dropping unconvertible chunk");
                return false;
            }
        };

        schedule(self.renderer.as_ref(), &self.notice_tx, current, samples)
    }

    /// Mark the end of the chunk stream for `request`.
    ///
    /// Audio still buffered in the converter is scheduled first, so the
    /// request completes only once that tail has played too.
    pub fn end_of_stream(&mut self, request: u64) -> Option<Finished> {
        let current = self.current.as_mut().filter(|r| r.id == request)?;
        if current.end_of_stream {
            return None;
        }
        match self.converter.finish() {
            Ok(tail) if !tail.is_empty() => {
                schedule(self.renderer.as_ref(), &self.notice_tx, current, tail);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(request, error = %e, "Dropping unconvertible stream tail"),
        }
        current.end_of_stream = true;
        tracing::debug!(
            request,
            scheduled = current.scheduled,
            completed = current.completed,
            "Synthesis stream ended"
        );
        self.finish_if_drained()
    }

    /// Account for a played chunk.
    pub fn on_notice(&mut self, notice: RenderNotice) -> Option<Finished> {
        let Some(current) = self.current.as_mut().filter(|r| r.id == notice.request) else {
            tracing::trace!(?notice, "Ignoring stale render notice");
            return None;
        };
        if current.completed < current.scheduled {
            current.completed += 1;
        }
        self.finish_if_drained()
    }

    /// Stop the renderer and resolve the current request as cancelled.
    pub fn cancel(&mut self) -> Option<Finished> {
        let current = self.current.take()?;
        self.converter.reset();
        self.renderer.stop();
        tracing::debug!(
            request = current.id,
            played = current.completed,
            scheduled = current.scheduled,
            "Synthesis cancelled"
        );
        Some(current.resolve(PlaybackOutcome::Cancelled))
    }

    fn finish_if_drained(&mut self) -> Option<Finished> {
        let drained = self
            .current
            .as_ref()
            .is_some_and(|r| r.end_of_stream && r.completed == r.scheduled);
        if !drained {
            return None;
        }
        let finished = self.current.take()?.resolve(PlaybackOutcome::Completed);
        tracing::debug!(request = finished.request, chunks = finished.chunks, "Playback complete");
        Some(finished)
    }

    /// Play a whole chunk stream to completion on the calling task.
    ///
    /// `notices` must be the receiver returned by [`new`](Self::new).
    pub async fn play_stream(
        &mut self,
        text: &str,
        mut chunks: ChunkStream,
        notices: &mut mpsc::UnboundedReceiver<RenderNotice>,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome, VoiceError> {
        let request = self.start(text).request();
        let mut stream_open = true;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.cancel();
                    return Ok(PlaybackOutcome::Cancelled);
                }
                chunk = chunks.next(), if stream_open => match chunk {
                    Some(Ok(chunk)) => {
                        self.feed(request, &chunk);
                    }
                    Some(Err(e)) => {
                        self.cancel();
                        return Err(e);
                    }
                    None => {
                        stream_open = false;
                        if let Some(finished) = self.end_of_stream(request) {
                            return Ok(finished.outcome);
                        }
                    }
                },
                Some(notice) = notices.recv() => {
                    if let Some(finished) = self.on_notice(notice) {
                        return Ok(finished.outcome);
                    }
                }
            }
        }
    }
}

/// Hand converted samples to the renderer, tagged for completion tracking.
fn schedule(
    renderer: &dyn AudioRenderer,
    notice_tx: &mpsc::UnboundedSender<RenderNotice>,
    current: &mut SynthesisRequest,
    samples: Vec<f32>,
) -> bool {
    let request = current.id;
    let seq = current.scheduled;
    let notice_tx = notice_tx.clone();
    let on_rendered = Box::new(move || {
        let _ = notice_tx.send(RenderNotice { request, seq });
    });

    match renderer.schedule(samples, on_rendered) {
        Ok(()) => {
            current.scheduled += 1;
            true
        }
        Err(e) => {
            tracing::warn!(request, seq, error = %e, "Renderer rejected chunk");
            false
        }
    }
}

impl Drop for StreamingPlayer {
    fn drop(&mut self) {
        self.cancel();
    }
}
