use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::audio_system::Shared;
use super::device::CaptureSource;

/// Consecutive read failures tolerated before the capture thread gives up.
const MAX_READ_FAILURES: u32 = 5;

pub(super) fn record_thread(
    mut source: Box<dyn CaptureSource>,
    shared: &Shared,
    frame_size: usize,
    running: &AtomicBool,
) {
    // Read buffer (mono i16, one window)
    let mut read_buf = vec![0i16; frame_size];
    let mut failures = 0u32;

    log::info!("Recording started: frame_size={}", frame_size);

    while running.load(Ordering::Relaxed) {
        match source.read(&mut read_buf) {
            Ok(0) => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(n) => {
                failures = 0;
                shared.on_capture_frame(&read_buf[..n]);
            }
            Err(e) => {
                failures += 1;
                log::warn!("Capture error: {}, recovering...", e);
                if let Err(e2) = source.recover() {
                    log::error!("Failed to recover capture stream: {}", e2);
                    break;
                }
                if failures >= MAX_READ_FAILURES {
                    log::error!("Capture failed {} times in a row, stopping", failures);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
}
