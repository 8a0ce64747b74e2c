use std::sync::atomic::{AtomicBool, Ordering};

use super::audio_system::Shared;
use super::device::PlaybackSink;

const MAX_WRITE_FAILURES: u32 = 5;

/// Pull one window per iteration from the output queue. An under-filled
/// queue is padded with silence so the device never starves.
pub(super) fn play_thread(
    mut sink: Box<dyn PlaybackSink>,
    shared: &Shared,
    frame_size: usize,
    running: &AtomicBool,
) {
    let mut window = vec![0i16; frame_size];
    let mut failures = 0u32;

    log::info!("Playback started: frame_size={}", frame_size);

    while running.load(Ordering::Relaxed) {
        shared.fill_playback(&mut window);

        match sink.write(&window) {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                log::warn!("Playback error: {}, recovering...", e);
                if let Err(e2) = sink.recover() {
                    log::error!("Failed to recover playback stream: {}", e2);
                    break;
                }
                if failures >= MAX_WRITE_FAILURES {
                    log::error!("Playback failed {} times in a row, stopping", failures);
                    break;
                }
            }
        }
    }

    log::info!("Playback stopped");
}
