//! PCM16 frames and sample helpers.

use std::sync::Arc;
use std::time::Duration;

/// One capture window of mono PCM16 samples. Cheap to clone, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// RMS normalised to full scale (0.0 ..= 1.0).
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples as u64 * 1_000_000_000 / sample_rate as u64)
}

pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Scale samples in place, saturating at the PCM16 range.
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for s in samples.iter_mut() {
        *s = (*s as f32 * gain).round().clamp(-32768.0, 32767.0) as i16;
    }
}

/// Encode samples as little-endian PCM16 bytes (the wire format).
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Decode little-endian PCM16 bytes. A trailing odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    if bytes.len() % 2 != 0 {
        log::warn!("PCM16 payload has odd length {}, dropping last byte", bytes.len());
    }
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(interleaved: &[i16], channels: usize, out: &mut [i16]) -> usize {
    if channels <= 1 {
        let n = interleaved.len().min(out.len());
        out[..n].copy_from_slice(&interleaved[..n]);
        return n;
    }
    let frames = (interleaved.len() / channels).min(out.len());
    for i in 0..frames {
        let mut sum: i32 = 0;
        for c in 0..channels {
            sum += interleaved[i * channels + c] as i32;
        }
        out[i] = (sum / channels as i32) as i16;
    }
    frames
}

/// Duplicate mono samples across `channels` interleaved channels.
pub fn upmix_from_mono(mono: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return mono.to_vec();
    }
    let mut out = Vec::with_capacity(mono.len() * channels);
    for &s in mono {
        for _ in 0..channels {
            out.push(s);
        }
    }
    out
}
