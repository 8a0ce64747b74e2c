//! Device boundary for audio capture and playback.
//!
//! The engine only ever sees mono PCM16. Implementations handle the
//! hardware's channel layout and recovery internally.

use anyhow::Result;

/// Stream parameters requested from the hardware.
#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Samples per read/write window (mono)
    pub frame_size: usize,
}

/// A blocking source of mono PCM16 samples.
pub trait CaptureSource: Send {
    /// Read up to `buf.len()` samples. Blocks for at most one window.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize>;

    /// Try to bring the stream back after a read error.
    fn recover(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A blocking sink of mono PCM16 samples. Paces its caller to real time.
pub trait PlaybackSink: Send {
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    fn recover(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens named devices ("default" selects the system default).
pub trait DeviceProvider: Send + Sync {
    fn open_capture(&self, device: &str, params: &StreamParams) -> Result<Box<dyn CaptureSource>>;

    fn open_playback(&self, device: &str, params: &StreamParams) -> Result<Box<dyn PlaybackSink>>;
}
