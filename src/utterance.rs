use std::time::Duration;

use crate::audio::frame::samples_to_duration;
use crate::audio::AudioFrame;

/// Collects captured frames until enough audio has built up to be worth a
/// round-trip to the server.
pub struct UtteranceAccumulator {
    frames: Vec<AudioFrame>,
    samples: usize,
    min_commit: Duration,
    sample_rate: u32,
}

impl UtteranceAccumulator {
    pub fn new(min_commit: Duration, sample_rate: u32) -> Self {
        Self {
            frames: Vec::new(),
            samples: 0,
            min_commit,
            sample_rate,
        }
    }

    pub fn push(&mut self, frame: AudioFrame) {
        if frame.is_empty() {
            return;
        }
        self.samples += frame.len();
        self.frames.push(frame);
    }

    /// Exact in samples, so 500ms of 24kHz audio is ready at 12000 samples
    /// and not one sample earlier.
    pub fn should_commit(&self) -> bool {
        let min_ms = self.min_commit.as_millis();
        self.samples as u128 * 1000 >= min_ms * self.sample_rate as u128
    }

    /// Concatenate everything pushed so far and start over.
    pub fn drain(&mut self) -> Vec<i16> {
        let mut chunk = Vec::with_capacity(self.samples);
        for frame in self.frames.drain(..) {
            chunk.extend_from_slice(frame.samples());
        }
        self.samples = 0;
        chunk
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples, self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// Drops silent frames before they reach the accumulator. Quiet frames
/// right after speech still pass for `hangover`, so word endings and short
/// pauses are kept; leading silence is dropped.
pub struct SpeechGate {
    threshold: f32,
    /// In samples
    hangover: usize,
    quiet: usize,
}

impl SpeechGate {
    pub fn new(threshold: f32, hangover: Duration, sample_rate: u32) -> Self {
        let hangover = (hangover.as_millis() * sample_rate as u128 / 1000) as usize;
        Self {
            threshold,
            hangover,
            quiet: hangover,
        }
    }

    pub fn admit(&mut self, frame: &AudioFrame) -> bool {
        if frame.rms() > self.threshold {
            self.quiet = 0;
            true
        } else if self.quiet < self.hangover {
            self.quiet += frame.len();
            true
        } else {
            false
        }
    }

    pub fn is_open(&self) -> bool {
        self.quiet < self.hangover
    }
}
