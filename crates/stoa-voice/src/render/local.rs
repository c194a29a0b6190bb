//! Speaker output via `rodio` on a dedicated OS thread.
//!
//! `rodio::OutputStream` is `!Send` on some platforms, so the stream and its
//! sink live on one thread and [`LocalRenderer`] talks to it over a command
//! channel.
//!
//! Each scheduled buffer is followed in the sink by an empty callback source;
//! the sink reaches that source exactly when the buffer has been played out.

use std::sync::{Mutex, PoisonError, mpsc};
use std::thread;

use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, OutputStreamHandle, Sink};

use super::{AudioRenderer, RenderedCallback};
use crate::convert::OutputFormat;
use crate::error::VoiceError;

enum RenderCommand {
    Schedule {
        samples: Vec<f32>,
        on_rendered: RenderedCallback,
        reply: mpsc::Sender<Result<(), VoiceError>>,
    },
    Stop,
    Shutdown,
}

/// Default-output-device renderer.
pub struct LocalRenderer {
    format: OutputFormat,
    cmd_tx: mpsc::Sender<RenderCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LocalRenderer {
    /// Open the default output device and start the render thread.
    pub fn new(format: OutputFormat) -> Result<Self, VoiceError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("stoa-audio".into())
            .spawn(move || Self::run(format, &cmd_rx, &init_tx))
            .map_err(|e| {
                VoiceError::OutputStreamError(format!("failed to spawn audio thread: {e}"))
            })?;

        init_rx.recv().map_err(|_| VoiceError::AudioThreadDied)??;

        Ok(Self {
            format,
            cmd_tx,
            thread: Some(thread),
        })
    }

    fn run(
        format: OutputFormat,
        cmd_rx: &mpsc::Receiver<RenderCommand>,
        init_tx: &mpsc::Sender<Result<(), VoiceError>>,
    ) {
        let (_stream, handle) = match OutputStream::try_default() {
            Ok(pair) => pair,
            Err(e) => {
                let _ = init_tx.send(Err(VoiceError::OutputStreamError(e.to_string())));
                return;
            }
        };
        if init_tx.send(Ok(())).is_err() {
            return;
        }
        tracing::info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "Audio output initialized on default device"
        );

        let mut sink: Option<Sink> = None;

        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                RenderCommand::Schedule {
                    samples,
                    on_rendered,
                    reply,
                } => {
                    let _ = reply.send(Self::append(&handle, &mut sink, format, samples, on_rendered));
                }
                RenderCommand::Stop => {
                    // A stopped sink cannot be reused; the next schedule opens a fresh one
                    if let Some(sink) = sink.take() {
                        sink.stop();
                        tracing::debug!("Audio playback stopped");
                    }
                }
                RenderCommand::Shutdown => break,
            }
        }
        tracing::debug!("Audio thread shutting down");
    }

    fn append(
        handle: &OutputStreamHandle,
        sink: &mut Option<Sink>,
        format: OutputFormat,
        samples: Vec<f32>,
        on_rendered: RenderedCallback,
    ) -> Result<(), VoiceError> {
        if sink.is_none() {
            let fresh =
                Sink::try_new(handle).map_err(|e| VoiceError::OutputStreamError(e.to_string()))?;
            *sink = Some(fresh);
        }
        let Some(sink) = sink.as_ref() else {
            return Err(VoiceError::AudioThreadDied);
        };

        sink.append(SamplesBuffer::new(format.channels, format.sample_rate, samples));

        let once = Mutex::new(Some(on_rendered));
        sink.append(EmptyCallback::<f32>::new(Box::new(move || {
            let cb = once.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(cb) = cb {
                cb();
            }
        })));
        Ok(())
    }
}

impl AudioRenderer for LocalRenderer {
    fn output_format(&self) -> OutputFormat {
        self.format
    }

    fn schedule(&self, samples: Vec<f32>, on_rendered: RenderedCallback) -> Result<(), VoiceError> {
        let (reply, rx) = mpsc::channel();
        self.cmd_tx
            .send(RenderCommand::Schedule {
                samples,
                on_rendered,
                reply,
            })
            .map_err(|_| VoiceError::AudioThreadDied)?;
        rx.recv().map_err(|_| VoiceError::AudioThreadDied)?
    }

    fn stop(&self) {
        let _ = self.cmd_tx.send(RenderCommand::Stop);
    }
}

impl Drop for LocalRenderer {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(RenderCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
