//! Sample conversion from a synthesizer's declared format to the renderer's.
//!
//! Synthesizers deliver raw little-endian PCM at whatever rate and channel
//! count they like; renderers want interleaved `f32` at one fixed format.

use std::fmt;

use rubato::{FftFixedIn, Resampler as _};
use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

/// Frames per resampler block.
const RESAMPLE_CHUNK: usize = 1024;

/// Wire encoding of a chunk's samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    /// Signed 16-bit little-endian.
    PcmS16Le,
    /// 32-bit float little-endian.
    PcmF32Le,
}

impl SampleEncoding {
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::PcmS16Le => 2,
            Self::PcmF32Le => 4,
        }
    }
}

/// Declared format of an incoming audio chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub encoding: SampleEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: SampleEncoding::PcmS16Le,
            sample_rate,
            channels,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} Hz x{}",
            self.encoding, self.sample_rate, self.channels
        )
    }
}

/// What a renderer consumes: interleaved `f32` at a fixed rate/layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl OutputFormat {
    /// Frames per second × channels.
    pub const fn samples_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64
    }
}

// ── Conversion steps ───────────────────────────────────────────────

/// Decode little-endian PCM bytes into `f32` samples in `[-1.0, 1.0]`.
pub fn decode(bytes: &[u8], encoding: SampleEncoding) -> Result<Vec<f32>, VoiceError> {
    let width = encoding.bytes_per_sample();
    if bytes.len() % width != 0 {
        return Err(VoiceError::Conversion(format!(
            "{} bytes is not a whole number of {encoding:?} samples",
            bytes.len()
        )));
    }

    let samples = match encoding {
        SampleEncoding::PcmS16Le => bytes
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
            .collect(),
        SampleEncoding::PcmF32Le => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    };
    Ok(samples)
}

/// Change the channel layout of interleaved samples.
///
/// Downmixing to mono averages; upmixing from mono duplicates; any other
/// change maps each output channel to the nearest input channel.
pub fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    if from == to {
        return samples.to_vec();
    }
    let from = usize::from(from);
    let to = usize::from(to);

    if to == 1 {
        #[allow(clippy::cast_precision_loss)]
        return samples
            .chunks_exact(from)
            .map(|frame| frame.iter().sum::<f32>() / from as f32)
            .collect();
    }

    samples
        .chunks_exact(from)
        .flat_map(|frame| (0..to).map(move |c| frame[c.min(from - 1)]))
        .collect()
}

/// Streaming FFT resampler for one continuous signal.
///
/// Input arrives in arbitrary pieces; filter state carries across them, so
/// chunk boundaries are inaudible. The resampler's start-up delay is dropped
/// once at the beginning and [`flush`](Self::flush) drains its tail, so the
/// output lines up with the input and has the expected length.
pub struct StreamResampler {
    inner: FftFixedIn<f32>,
    channels: usize,
    from_rate: u32,
    to_rate: u32,
    /// Planar input not yet handed to the resampler.
    pending: Vec<Vec<f32>>,
    /// Output frames still to drop for the start-up delay.
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    pub fn new(channels: u16, from_rate: u32, to_rate: u32) -> Result<Self, VoiceError> {
        let channels = usize::from(channels);
        if channels == 0 {
            return Err(VoiceError::Conversion("cannot resample zero channels".into()));
        }
        let inner = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            RESAMPLE_CHUNK,
            2,
            channels,
        )
        .map_err(|e| VoiceError::Conversion(e.to_string()))?;

        Ok(Self {
            skip: inner.output_delay(),
            inner,
            channels,
            from_rate,
            to_rate,
            pending: vec![Vec::new(); channels],
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub const fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Feed interleaved samples; returns the interleaved output ready so far.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>, VoiceError> {
        for frame in samples.chunks_exact(self.channels) {
            for (plane, &sample) in self.pending.iter_mut().zip(frame) {
                plane.push(sample);
            }
        }
        self.frames_in += (samples.len() / self.channels) as u64;

        let mut out = vec![Vec::new(); self.channels];
        loop {
            // Rounded up to a whole number of FFT blocks for this rate pair
            let need = self.inner.input_frames_next();
            if self.pending[0].len() < need {
                break;
            }
            let block: Vec<&[f32]> = self.pending.iter().map(|p| &p[..need]).collect();
            let result = self
                .inner
                .process(&block, None)
                .map_err(|e| VoiceError::Conversion(e.to_string()))?;
            for plane in &mut self.pending {
                plane.drain(..need);
            }
            self.collect(result, &mut out, usize::MAX);
        }
        Ok(interleave(&out))
    }

    /// Drain buffered input and the resampler's delay line.
    ///
    /// After a flush the total output is `ceil(frames_in * to / from)` frames.
    pub fn flush(&mut self) -> Result<Vec<f32>, VoiceError> {
        let expected = (self.frames_in * u64::from(self.to_rate)).div_ceil(u64::from(self.from_rate));
        let mut out = vec![Vec::new(); self.channels];

        if !self.pending[0].is_empty() {
            let result = self
                .inner
                .process_partial(Some(self.pending.as_slice()), None)
                .map_err(|e| VoiceError::Conversion(e.to_string()))?;
            for plane in &mut self.pending {
                plane.clear();
            }
            let room = usize::try_from(expected.saturating_sub(self.frames_out)).unwrap_or(usize::MAX);
            self.collect(result, &mut out, room);
        }

        while self.frames_out < expected {
            let result = self
                .inner
                .process_partial(None::<&[Vec<f32>]>, None)
                .map_err(|e| VoiceError::Conversion(e.to_string()))?;
            if result.first().is_none_or(Vec::is_empty) {
                break;
            }
            let room = usize::try_from(expected - self.frames_out).unwrap_or(usize::MAX);
            self.collect(result, &mut out, room);
        }
        Ok(interleave(&out))
    }

    /// Append `result` to `out`, dropping start-up delay and anything past `room` frames.
    fn collect(&mut self, result: Vec<Vec<f32>>, out: &mut [Vec<f32>], room: usize) {
        let frames = result.first().map_or(0, Vec::len);
        let skip = self.skip.min(frames);
        self.skip -= skip;
        let take = (frames - skip).min(room);
        for (dst, src) in out.iter_mut().zip(result) {
            dst.extend_from_slice(&src[skip..skip + take]);
        }
        self.frames_out += take as u64;
    }
}

impl fmt::Debug for StreamResampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResampler")
            .field("channels", &self.channels)
            .field("from_rate", &self.from_rate)
            .field("to_rate", &self.to_rate)
            .field("frames_in", &self.frames_in)
            .field("frames_out", &self.frames_out)
            .finish_non_exhaustive()
    }
}

fn interleave(planes: &[Vec<f32>]) -> Vec<f32> {
    let frames = planes.iter().map(Vec::len).min().unwrap_or(0);
    let mut interleaved = Vec::with_capacity(frames * planes.len());
    for i in 0..frames {
        interleaved.extend(planes.iter().map(|plane| plane[i]));
    }
    interleaved
}

/// Resample a complete interleaved signal between rates.
pub fn resample(
    samples: &[f32],
    channels: u16,
    from_rate: u32,
    to_rate: u32,
) -> Result<Vec<f32>, VoiceError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = StreamResampler::new(channels, from_rate, to_rate)?;
    let mut out = resampler.process(samples)?;
    out.extend(resampler.flush()?);
    Ok(out)
}

/// Scale samples by `gain`, hard-clamped to `[-1.0, 1.0]`.
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    for sample in samples {
        *sample = (*sample * gain).clamp(-1.0, 1.0);
    }
}

// ── Chunk converter ────────────────────────────────────────────────

/// Converts the chunks of one synthesis stream to a renderer's output format.
///
/// Resampling state lives across chunks; call [`finish`](Self::finish) at
/// end of stream for the buffered tail and [`reset`](Self::reset) before the
/// next stream.
#[derive(Debug)]
pub struct ChunkConverter {
    output: OutputFormat,
    gain: f32,
    resampler: Option<StreamResampler>,
}

impl ChunkConverter {
    pub const fn new(output: OutputFormat, gain: f32) -> Self {
        Self {
            output,
            gain,
            resampler: None,
        }
    }

    pub const fn output(&self) -> OutputFormat {
        self.output
    }

    /// Forget any stream in progress.
    pub fn reset(&mut self) {
        self.resampler = None;
    }

    /// Decode, remix, resample and gain-adjust one chunk's payload.
    ///
    /// May return fewer samples than the chunk holds (or none) while the
    /// resampler fills a block.
    pub fn convert(&mut self, format: AudioFormat, data: &[u8]) -> Result<Vec<f32>, VoiceError> {
        if format.channels == 0 || format.sample_rate == 0 {
            return Err(VoiceError::Conversion(format!("invalid declared format {format}")));
        }

        let samples = decode(data, format.encoding)?;
        if samples.len() % usize::from(format.channels) != 0 {
            return Err(VoiceError::Conversion(format!(
                "{} samples do not fill whole {}-channel frames",
                samples.len(),
                format.channels
            )));
        }

        let mixed = remix(&samples, format.channels, self.output.channels);
        if format.sample_rate == self.output.sample_rate {
            let mut out = self.drain_tail()?;
            out.extend(mixed);
            apply_gain(&mut out, self.gain);
            return Ok(out);
        }

        // A rate change mid-stream ends the previous signal
        let rate_changed = self
            .resampler
            .as_ref()
            .is_some_and(|r| r.from_rate() != format.sample_rate);
        let mut out = if rate_changed { self.drain_tail()? } else { Vec::new() };
        if self.resampler.is_none() {
            self.resampler = Some(StreamResampler::new(
                self.output.channels,
                format.sample_rate,
                self.output.sample_rate,
            )?);
        }
        if let Some(resampler) = self.resampler.as_mut() {
            out.extend(resampler.process(&mixed)?);
        }
        apply_gain(&mut out, self.gain);
        Ok(out)
    }

    /// End of stream: the resampled tail still buffered, gain applied.
    pub fn finish(&mut self) -> Result<Vec<f32>, VoiceError> {
        let mut out = self.drain_tail()?;
        apply_gain(&mut out, self.gain);
        Ok(out)
    }

    fn drain_tail(&mut self) -> Result<Vec<f32>, VoiceError> {
        match self.resampler.take() {
            Some(mut resampler) => resampler.flush(),
            None => Ok(Vec::new()),
        }
    }
}
