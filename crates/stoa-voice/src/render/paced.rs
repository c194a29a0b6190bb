//! Headless renderer that "plays" buffers by waiting out their duration.
//!
//! Used when no output device is available (CI, servers, `--no-audio`
//! sessions) so completion timing still behaves like real playback.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use super::{AudioRenderer, RenderedCallback};
use crate::convert::OutputFormat;
use crate::error::VoiceError;

enum PacedCommand {
    Schedule {
        duration: Duration,
        on_rendered: RenderedCallback,
    },
    Stop,
    Shutdown,
}

/// Real-time paced renderer running on its own thread.
pub struct PacedRenderer {
    format: OutputFormat,
    cmd_tx: mpsc::Sender<PacedCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PacedRenderer {
    pub fn new(format: OutputFormat) -> Result<Self, VoiceError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("stoa-paced-render".into())
            .spawn(move || Self::run(&cmd_rx))?;

        Ok(Self {
            format,
            cmd_tx,
            thread: Some(thread),
        })
    }

    fn run(cmd_rx: &mpsc::Receiver<PacedCommand>) {
        let mut queue: VecDeque<(Duration, RenderedCallback)> = VecDeque::new();
        let mut playing: Option<(Instant, RenderedCallback)> = None;

        loop {
            if playing.is_none() {
                if let Some((duration, cb)) = queue.pop_front() {
                    playing = Some((Instant::now() + duration, cb));
                }
            }

            let cmd = match playing.as_ref().map(|(until, _)| *until) {
                Some(until) => {
                    let wait = until.saturating_duration_since(Instant::now());
                    match cmd_rx.recv_timeout(wait) {
                        Ok(cmd) => cmd,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            if let Some((_, cb)) = playing.take() {
                                cb();
                            }
                            continue;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match cmd_rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                },
            };

            match cmd {
                PacedCommand::Schedule {
                    duration,
                    on_rendered,
                } => queue.push_back((duration, on_rendered)),
                PacedCommand::Stop => {
                    let dropped = queue.len() + usize::from(playing.is_some());
                    queue.clear();
                    playing = None;
                    tracing::debug!(dropped, "Paced playback stopped");
                }
                PacedCommand::Shutdown => break,
            }
        }
        tracing::debug!("Paced render thread shutting down");
    }
}

impl AudioRenderer for PacedRenderer {
    fn output_format(&self) -> OutputFormat {
        self.format
    }

    #[allow(clippy::cast_precision_loss)]
    fn schedule(&self, samples: Vec<f32>, on_rendered: RenderedCallback) -> Result<(), VoiceError> {
        let per_second = self.format.samples_per_second().max(1);
        let duration = Duration::from_secs_f64(samples.len() as f64 / per_second as f64);
        self.cmd_tx
            .send(PacedCommand::Schedule {
                duration,
                on_rendered,
            })
            .map_err(|_| VoiceError::AudioThreadDied)
    }

    fn stop(&self) {
        let _ = self.cmd_tx.send(PacedCommand::Stop);
    }
}

impl Drop for PacedRenderer {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(PacedCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
