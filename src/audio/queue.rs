//! Queues decoupling hardware timing from application timing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::frame::AudioFrame;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded capture queue. A full queue drops its oldest frame.
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicUsize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
            dropped: AtomicUsize::new(0),
        }
    }

    /// Returns how many frames were dropped to make room (0 or 1).
    pub fn push(&self, frame: AudioFrame) -> usize {
        let mut dropped = 0;
        {
            let mut frames = lock(&self.frames);
            while frames.len() >= self.capacity {
                frames.pop_front();
                dropped += 1;
            }
            frames.push_back(frame);
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        self.ready.notify_one();
        dropped
    }

    /// Wait up to `timeout` for a frame.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        let deadline = Instant::now() + timeout;
        let mut frames = lock(&self.frames);
        loop {
            if let Some(frame) = frames.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(frames, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            frames = guard;
        }
    }

    pub fn clear(&self) {
        lock(&self.frames).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn dropped_total(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Output sample queue shared by the network side (producer) and the
/// playback thread (consumer).
#[derive(Default)]
pub struct PcmQueue {
    samples: Mutex<VecDeque<i16>>,
}

impl PcmQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, chunk: &[i16]) {
        lock(&self.samples).extend(chunk.iter().copied());
    }

    /// Fill `out` from the queue and zero whatever the queue could not cover.
    /// Returns the number of real samples written. Never waits.
    pub fn fill(&self, out: &mut [i16]) -> usize {
        let mut samples = lock(&self.samples);
        let n = samples.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(samples.drain(..n)) {
            *slot = sample;
        }
        drop(samples);
        out[n..].fill(0);
        n
    }

    pub fn clear(&self) {
        lock(&self.samples).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }
}
