//! Audio output via cpal.
//!
//! [`AudioSink`] is the engine's clock-plus-sink capability: schedule decoded
//! audio at an absolute time on the sink's own clock, with a mutable gain and
//! linear ramps. [`CpalSink`] implements it on the default output device,
//! using a lock-free ring buffer (rtrb) to bridge the async world to the
//! real-time audio callback; the clock is the number of frames the callback
//! has consumed.

use crate::codec::AudioData;
use crate::types::{CHANNELS, SAMPLE_RATE};
use anyhow::{Context, Result, ensure};
use cpal::Sample;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::warn;

/// Scheduling clock + gain-controlled output. The clock only ever moves
/// forward; `schedule` times are absolute readings of that clock.
pub trait AudioSink: Send {
    /// Current position of the output clock, in seconds.
    fn now(&self) -> f64;
    /// Queue `audio` to start playing exactly at clock time `at` (seconds).
    /// Scheduling strictly after everything previously scheduled; any gap is
    /// rendered as silence.
    fn schedule(&mut self, audio: &AudioData, at: f64) -> Result<()>;
    /// Set the gain immediately, cancelling any ramp in progress.
    fn set_gain(&mut self, gain: f32);
    /// Ramp the gain linearly to `target` over `seconds`.
    fn ramp_gain(&mut self, target: f32, seconds: f64);
    /// Start (or restart) the underlying output stream.
    fn resume(&mut self) -> Result<()>;
}

/// Builds a fresh sink. The engine replaces its sink across a pause, so
/// construction has to be repeatable.
pub type SinkFactory = Box<dyn Fn() -> Result<Box<dyn AudioSink>> + Send + Sync>;

/// Gain state shared with the audio callback. The callback steps `gain`
/// toward `target` by `step` once per frame, which yields the linear ramp.
struct GainControl {
    gain: AtomicU32,
    target: AtomicU32,
    step: AtomicU32,
}

impl GainControl {
    fn new(initial: f32) -> Self {
        Self {
            gain: AtomicU32::new(initial.to_bits()),
            target: AtomicU32::new(initial.to_bits()),
            step: AtomicU32::new(0f32.to_bits()),
        }
    }

    fn set(&self, gain: f32) {
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
        self.target.store(gain.to_bits(), Ordering::Relaxed);
        self.step.store(0f32.to_bits(), Ordering::Relaxed);
    }

    fn ramp(&self, target: f32, frames: f64) {
        if frames <= 0.0 {
            self.set(target);
            return;
        }
        let current = f32::from_bits(self.gain.load(Ordering::Relaxed));
        let step = (target - current) / frames as f32;
        self.target.store(target.to_bits(), Ordering::Relaxed);
        self.step.store(step.to_bits(), Ordering::Relaxed);
    }

    /// Advance one frame and return the gain to apply. Called from the
    /// real-time callback only.
    fn next_frame(&self) -> f32 {
        let mut gain = f32::from_bits(self.gain.load(Ordering::Relaxed));
        let target = f32::from_bits(self.target.load(Ordering::Relaxed));
        let step = f32::from_bits(self.step.load(Ordering::Relaxed));
        if step != 0.0 {
            gain += step;
            let overshot = (step > 0.0 && gain >= target) || (step < 0.0 && gain <= target);
            if overshot {
                gain = target;
                self.step.store(0f32.to_bits(), Ordering::Relaxed);
            }
            self.gain.store(gain.to_bits(), Ordering::Relaxed);
        }
        gain
    }
}

/// Write cursor over the ring buffer. Kept separate from the cpal stream so
/// the capacity accounting is testable without an output device.
struct FrameWriter {
    producer: rtrb::Producer<f32>,
    /// Absolute frame position of the write cursor.
    frames_written: u64,
    channels: usize,
}

impl FrameWriter {
    /// Zero-fill up to `target`, then append the interleaved frames. Fails
    /// without writing anything when the ring cannot hold it all; a full
    /// ring must never turn into a wait.
    fn write(&mut self, audio: &AudioData, target: u64) -> Result<()> {
        let gap = target.saturating_sub(self.frames_written) as usize;
        let needed = (gap + audio.frames()) * self.channels;
        ensure!(
            self.producer.slots() >= needed,
            "output buffer full: {} samples needed, {} free",
            needed,
            self.producer.slots(),
        );
        for _ in 0..gap {
            self.push_frame(&[]);
        }
        let mut frame = vec![0f32; audio.channels.len()];
        for i in 0..audio.frames() {
            for (ch, buf) in audio.channels.iter().enumerate() {
                frame[ch] = buf[i];
            }
            self.push_frame(&frame);
        }
        Ok(())
    }

    fn push_frame(&mut self, samples: &[f32]) {
        for ch in 0..self.channels {
            let sample = samples.get(ch).or_else(|| samples.last()).copied().unwrap_or(0.0);
            // Capacity was checked up front; the cursor advances with the
            // frame either way so it can never stall below a target.
            let _ = self.producer.push(sample);
        }
        self.frames_written += 1;
    }
}

/// Sink on the default cpal output device, 48 kHz stereo.
pub struct CpalSink {
    _stream: cpal::Stream,
    writer: FrameWriter,
    gain: Arc<GainControl>,
    frames_played: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalSink {
    /// Buffer capacity in seconds; comfortably above the engine's look-ahead
    /// horizon so scheduling ahead never runs out of room.
    const BUFFER_SECONDS: usize = 8;

    pub fn open() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no output audio device found")?;

        let config = cpal::StreamConfig {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            buffer_size: cpal::BufferSize::Default,
        };

        let capacity = SAMPLE_RATE as usize * CHANNELS as usize * Self::BUFFER_SECONDS;
        let (producer, mut consumer) = rtrb::RingBuffer::new(capacity);

        let gain = Arc::new(GainControl::new(1.0));
        let frames_played = Arc::new(AtomicU64::new(0));
        let cb_gain = gain.clone();
        let cb_frames = frames_played.clone();

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(CHANNELS as usize) {
                    let g = cb_gain.next_frame();
                    for sample in frame.iter_mut() {
                        *sample = consumer.pop().unwrap_or(Sample::EQUILIBRIUM) * g;
                    }
                    cb_frames.fetch_add(1, Ordering::Relaxed);
                }
            },
            |err| {
                tracing::error!("playback error: {err}");
            },
            None,
        )?;

        Ok(Self {
            _stream: stream,
            writer: FrameWriter {
                producer,
                frames_written: 0,
                channels: CHANNELS as usize,
            },
            gain,
            frames_played,
            sample_rate: SAMPLE_RATE,
        })
    }
}

impl AudioSink for CpalSink {
    fn now(&self) -> f64 {
        self.frames_played.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, audio: &AudioData, at: f64) -> Result<()> {
        let target = (at * self.sample_rate as f64).round() as u64;
        if target < self.writer.frames_written {
            warn!(
                "scheduling {}ms behind the write cursor",
                (self.writer.frames_written - target) * 1000 / self.sample_rate as u64
            );
        }
        self.writer.write(audio, target)
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain.set(gain);
    }

    fn ramp_gain(&mut self, target: f32, seconds: f64) {
        self.gain.ramp(target, seconds * self.sample_rate as f64);
    }

    fn resume(&mut self) -> Result<()> {
        self._stream.play().context("failed to start output stream")
    }
}
