//! Energy-based voice activity state.
//!
//! Written only from the capture thread, read from anywhere. The last-speech
//! timestamp is a single atomic so readers never see a torn value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const NEVER: u64 = u64::MAX;

pub struct VadState {
    epoch: Instant,
    /// Milliseconds since `epoch` of the last loud frame, or `NEVER`
    last_speech_ms: AtomicU64,
    threshold: f32,
    silence: Duration,
}

impl VadState {
    pub fn new(threshold: f32, silence: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_speech_ms: AtomicU64::new(NEVER),
            threshold,
            silence,
        }
    }

    /// Record a frame's RMS. Returns true when it counted as speech.
    pub fn observe(&self, rms: f32) -> bool {
        if rms > self.threshold {
            self.mark_speech_at(Instant::now());
            true
        } else {
            false
        }
    }

    pub fn mark_speech_at(&self, at: Instant) {
        let ms = at.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_speech_ms.store(ms, Ordering::Release);
    }

    pub fn is_speech_active(&self) -> bool {
        self.is_speech_active_at(Instant::now())
    }

    pub fn is_speech_active_at(&self, now: Instant) -> bool {
        let last = self.last_speech_ms.load(Ordering::Acquire);
        if last == NEVER {
            return false;
        }
        let now_ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        now_ms.saturating_sub(last) < self.silence.as_millis() as u64
    }

    pub fn reset(&self) {
        self.last_speech_ms.store(NEVER, Ordering::Release);
    }
}
