//! audio - Duplex PCM16 capture and playback
//!
//! Capture and playback run on dedicated OS threads over ALSA. The rest of
//! the crate only sees mono PCM16 frames, a playback queue and VAD state.

mod alsa_device;
mod audio_system;
pub mod device;
pub mod frame;
mod play;
mod queue;
mod record;
mod vad;

pub use audio_system::{join_with_timeout, AudioSystem, InputCallback};
pub use frame::{pcm16_to_le_bytes, AudioFrame};
pub(crate) use queue::lock;
