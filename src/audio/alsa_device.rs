//! ALSA-backed capture and playback streams.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::device::{CaptureSource, DeviceProvider, PlaybackSink, StreamParams};
use super::frame::{downmix_to_mono, upmix_from_mono};

/// Consecutive failed write attempts before the rest of a window is dropped.
const MAX_WRITE_RETRIES: u32 = 3;

/// Open `device` as interleaved S16LE and return it with the channel count
/// the hardware settled on. A rate mismatch is only reported; resampling is
/// left to a plug device.
fn open_stream(device: &str, direction: Direction, params: &StreamParams) -> Result<(PCM, usize)> {
    let label = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, label))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(params.channels)?;
        hwp.set_rate_near(params.sample_rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(params.frame_size as alsa::pcm::Frames, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let hwp = pcm.hw_params_current()?;
    let rate = hwp.get_rate()?;
    let channels = hwp.get_channels()?.max(1) as usize;
    drop(hwp);

    log::info!("ALSA {} on {}: {}Hz x{}", label, device, rate, channels);
    if rate != params.sample_rate {
        log::warn!(
            "ALSA {} runs at {}Hz, stream expects {}Hz",
            label,
            rate,
            params.sample_rate
        );
    }
    Ok((pcm, channels))
}

/// Devices opened by ALSA name, e.g. "default" or "plughw:1,0".
pub struct AlsaDevices;

impl DeviceProvider for AlsaDevices {
    fn open_capture(&self, device: &str, params: &StreamParams) -> Result<Box<dyn CaptureSource>> {
        let (pcm, channels) = open_stream(device, Direction::Capture, params)?;
        Ok(Box::new(AlsaCapture {
            pcm,
            channels,
            interleaved: vec![0i16; params.frame_size * channels],
        }))
    }

    fn open_playback(&self, device: &str, params: &StreamParams) -> Result<Box<dyn PlaybackSink>> {
        let (pcm, channels) = open_stream(device, Direction::Playback, params)?;
        Ok(Box::new(AlsaPlayback { pcm, channels }))
    }
}

struct AlsaCapture {
    pcm: PCM,
    channels: usize,
    interleaved: Vec<i16>,
}

impl CaptureSource for AlsaCapture {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let wanted = buf.len() * self.channels;
        if self.interleaved.len() < wanted {
            self.interleaved.resize(wanted, 0);
        }
        let frames = self.pcm.io_i16()?.readi(&mut self.interleaved[..wanted])?;
        Ok(downmix_to_mono(
            &self.interleaved[..frames * self.channels],
            self.channels,
            buf,
        ))
    }

    fn recover(&mut self) -> Result<()> {
        self.pcm.prepare().context("Failed to recover PCM capture")
    }
}

struct AlsaPlayback {
    pcm: PCM,
    channels: usize,
}

impl PlaybackSink for AlsaPlayback {
    /// Short writes are continued and XRUNs re-prepared; after
    /// `MAX_WRITE_RETRIES` failures in a row the rest of the window is lost.
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let interleaved = upmix_from_mono(samples, self.channels);
        let io = self.pcm.io_i16()?;
        let mut done = 0;
        let mut failures = 0;

        while done < samples.len() {
            match io.writei(&interleaved[done * self.channels..]) {
                Ok(n) => {
                    done += n;
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("ALSA write failed ({}), re-preparing", e);
                    self.pcm.prepare().context("Failed to recover PCM playback")?;
                    if failures >= MAX_WRITE_RETRIES {
                        log::error!("Dropping {} unwritten samples", samples.len() - done);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        self.pcm.prepare().context("Failed to recover PCM playback")
    }
}
