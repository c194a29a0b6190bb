//! Microphone input via `cpal` on a dedicated OS thread.
//!
//! `cpal::Stream` is `!Send` on some platforms, so the stream lives on one
//! thread and [`MicrophoneCapture`] drives it over a command channel. The
//! device callback downmixes to mono and resamples to [`CAPTURE_SAMPLE_RATE`]
//! before handing frames to the current receiver.

use std::sync::mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc as async_mpsc;

use crate::backend::FrameSource;
use crate::convert::{StreamResampler, remix};
use crate::error::VoiceError;

/// Rate of every frame delivered to the recognizer.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

type FrameSender = async_mpsc::UnboundedSender<Vec<f32>>;

enum CaptureCommand {
    Start {
        frames: FrameSender,
        reply: mpsc::Sender<Result<(), VoiceError>>,
    },
    Stop,
    Shutdown,
}

/// Default-input-device [`FrameSource`].
pub struct MicrophoneCapture {
    cmd_tx: mpsc::Sender<CaptureCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneCapture {
    /// Check for an input device and start the capture thread.
    ///
    /// The device is only opened while a session is running.
    pub fn new() -> Result<Self, VoiceError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("stoa-capture".into())
            .spawn(move || Self::run(&cmd_rx, &init_tx))
            .map_err(|e| VoiceError::InputStreamError(format!("failed to spawn capture thread: {e}")))?;

        init_rx.recv().map_err(|_| VoiceError::AudioThreadDied)??;

        Ok(Self {
            cmd_tx,
            thread: Some(thread),
        })
    }

    fn run(
        cmd_rx: &mpsc::Receiver<CaptureCommand>,
        init_tx: &mpsc::Sender<Result<(), VoiceError>>,
    ) {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            let _ = init_tx.send(Err(VoiceError::NoInputDevice));
            return;
        };
        tracing::info!(device = %device.name().unwrap_or_default(), "Audio capture initialized");
        if init_tx.send(Ok(())).is_err() {
            return;
        }

        let mut stream: Option<Stream> = None;
        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                CaptureCommand::Start { frames, reply } => {
                    // Drop the previous stream before opening the device again
                    stream = None;
                    let opened = open_stream(&device, frames);
                    let _ = reply.send(opened.map(|s| {
                        stream = Some(s);
                    }));
                }
                CaptureCommand::Stop => {
                    if stream.take().is_some() {
                        tracing::debug!("Audio capture stopped");
                    }
                }
                CaptureCommand::Shutdown => break,
            }
        }
        tracing::debug!("Capture thread shutting down");
    }
}

impl FrameSource for MicrophoneCapture {
    fn sample_rate(&self) -> u32 {
        CAPTURE_SAMPLE_RATE
    }

    fn start(&self, frames: FrameSender) -> Result<(), VoiceError> {
        let (reply, rx) = mpsc::channel();
        self.cmd_tx
            .send(CaptureCommand::Start { frames, reply })
            .map_err(|_| VoiceError::AudioThreadDied)?;
        rx.recv().map_err(|_| VoiceError::AudioThreadDied)?
    }

    fn stop(&self) {
        let _ = self.cmd_tx.send(CaptureCommand::Stop);
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(CaptureCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Callback state: device samples in, 16 kHz mono frames out.
struct FrameSink {
    channels: u16,
    resampler: Option<StreamResampler>,
    frames: FrameSender,
}

impl FrameSink {
    fn push(&mut self, samples: &[f32]) {
        let mono = remix(samples, self.channels, 1);
        let frame = match self.resampler.as_mut() {
            Some(resampler) => match resampler.process(&mono) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unconvertible input frame");
                    return;
                }
            },
            None => mono,
        };
        if !frame.is_empty() {
            let _ = self.frames.send(frame);
        }
    }
}

fn open_stream(device: &Device, frames: FrameSender) -> Result<Stream, VoiceError> {
    let supported = device
        .default_input_config()
        .map_err(|e| VoiceError::InputStreamError(e.to_string()))?;
    let config: StreamConfig = supported.clone().into();
    let device_rate = config.sample_rate.0;

    let resampler = if device_rate == CAPTURE_SAMPLE_RATE {
        None
    } else {
        Some(StreamResampler::new(1, device_rate, CAPTURE_SAMPLE_RATE)?)
    };
    let sink = FrameSink {
        channels: config.channels,
        resampler,
        frames,
    };

    tracing::debug!(
        sample_rate = device_rate,
        channels = config.channels,
        format = ?supported.sample_format(),
        "Opening input stream"
    );
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(device, &config, sink),
        SampleFormat::I16 => build_stream::<i16>(device, &config, sink),
        SampleFormat::I32 => build_stream::<i32>(device, &config, sink),
        SampleFormat::U16 => build_stream::<u16>(device, &config, sink),
        other => {
            return Err(VoiceError::InputStreamError(format!(
                "unsupported sample format: {other:?}"
            )));
        }
    }?;
    stream
        .play()
        .map_err(|e| VoiceError::InputStreamError(e.to_string()))?;
    Ok(stream)
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut sink: FrameSink,
) -> Result<Stream, VoiceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                sink.push(&samples);
            },
            |err| tracing::error!(%err, "Audio input stream error"),
            None,
        )
        .map_err(|e| VoiceError::InputStreamError(e.to_string()))
}
