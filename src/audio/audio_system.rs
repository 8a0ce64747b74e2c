//! The AudioSystem that owns the capture and playback streams.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::alsa_device::AlsaDevices;
use super::device::{DeviceProvider, StreamParams};
use super::frame::{apply_gain, pcm16_from_le_bytes, AudioFrame};
use super::play::play_thread;
use super::queue::{lock, FrameQueue, PcmQueue};
use super::record::record_thread;
use super::vad::VadState;
use crate::config::AudioSettings;
use crate::error::{AudioError, AudioResult};

/// Runs on the capture thread for every frame, after it is queued. Must not
/// block and must not register callbacks itself.
pub type InputCallback = Box<dyn Fn(&AudioFrame) + Send + Sync>;

/// State shared between the engine handle and its device threads.
pub(super) struct Shared {
    input_volume: AtomicU32,
    output_volume: AtomicU32,
    input_level: AtomicU32,
    vad: VadState,
    input_queue: FrameQueue,
    output_queue: PcmQueue,
    input_callback: RwLock<Option<InputCallback>>,
}

fn load_f32(v: &AtomicU32) -> f32 {
    f32::from_bits(v.load(Ordering::Relaxed))
}

fn store_f32(v: &AtomicU32, value: f32) {
    v.store(value.to_bits(), Ordering::Relaxed);
}

fn clamp_volume(value: f32) -> f32 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

impl Shared {
    /// Body of the capture callback.
    pub(super) fn on_capture_frame(&self, raw: &[i16]) -> AudioFrame {
        let mut samples = raw.to_vec();
        apply_gain(&mut samples, load_f32(&self.input_volume));
        let frame = AudioFrame::new(samples);

        let rms = frame.rms();
        store_f32(&self.input_level, rms);
        self.vad.observe(rms);

        let dropped = self.input_queue.push(frame.clone());
        if dropped > 0 {
            let total = self.input_queue.dropped_total();
            // First drop of a burst and then every 100th
            if total == dropped || total % 100 == 0 {
                log::warn!("{} (total {})", AudioError::Backpressure { dropped }, total);
            }
        }
        let callback = self.input_callback.read().unwrap_or_else(|e| e.into_inner());
        if let Some(cb) = callback.as_ref() {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(&frame))).is_err() {
                log::error!("Input frame callback panicked");
            }
        }
        drop(callback);
        frame
    }

    /// Body of the playback callback.
    pub(super) fn fill_playback(&self, window: &mut [i16]) -> usize {
        let n = self.output_queue.fill(window);
        if n > 0 {
            apply_gain(&mut window[..n], load_f32(&self.output_volume));
        }
        n
    }
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    fn stop(self, name: &str, timeout: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        join_with_timeout(self.handle, timeout, name)
    }
}

/// Join a thread, giving up after `timeout`. A thread that does not finish
/// in time is detached and reported.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!("{} thread did not stop within {:?}, detaching it", name, timeout);
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        log::error!("{} thread panicked", name);
    }
    true
}

/// Duplex capture/playback with volume control and voice-activity state.
///
/// - Capture thread: device → gain → VAD → input queue → input callback
/// - Playback thread: output queue (silence-padded) → volume → device
pub struct AudioSystem {
    settings: AudioSettings,
    devices: Arc<dyn DeviceProvider>,
    shared: Arc<Shared>,
    capture: Mutex<Option<Worker>>,
    playback: Mutex<Option<Worker>>,
}

impl AudioSystem {
    pub fn new(settings: AudioSettings, devices: Arc<dyn DeviceProvider>) -> Self {
        let shared = Arc::new(Shared {
            input_volume: AtomicU32::new(1.0f32.to_bits()),
            output_volume: AtomicU32::new(1.0f32.to_bits()),
            input_level: AtomicU32::new(0.0f32.to_bits()),
            vad: VadState::new(settings.vad_threshold, settings.silence_duration),
            input_queue: FrameQueue::new(settings.input_queue_frames),
            output_queue: PcmQueue::new(),
            input_callback: RwLock::new(None),
        });

        log::info!(
            "AudioSystem created: capture: \"{}\", playback: \"{}\", rate: {}Hz, frame: {} samples",
            settings.capture_device,
            settings.playback_device,
            settings.sample_rate,
            settings.frame_size,
        );

        Self {
            settings,
            devices,
            shared,
            capture: Mutex::new(None),
            playback: Mutex::new(None),
        }
    }

    /// Engine backed by ALSA devices.
    pub fn alsa(settings: AudioSettings) -> Self {
        Self::new(settings, Arc::new(AlsaDevices))
    }

    pub fn settings(&self) -> &AudioSettings {
        &self.settings
    }

    fn params(&self) -> StreamParams {
        StreamParams {
            sample_rate: self.settings.sample_rate,
            channels: self.settings.channels,
            frame_size: self.settings.frame_size,
        }
    }

    pub fn start_capture(&self) -> AudioResult<()> {
        let mut capture = lock(&self.capture);
        if capture.as_ref().is_some_and(Worker::is_alive) {
            return Ok(());
        }
        if let Some(stale) = capture.take() {
            stale.stop("audio-capture", self.settings.shutdown_timeout);
        }

        let source = self
            .devices
            .open_capture(&self.settings.capture_device, &self.params())
            .map_err(|e| AudioError::Device(format!("{:#}", e)))?;

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            let shared = self.shared.clone();
            let frame_size = self.settings.frame_size;
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || record_thread(source, &shared, frame_size, &running))
                .map_err(|e| AudioError::Device(format!("failed to spawn capture thread: {}", e)))?
        };

        *capture = Some(Worker { running, handle });
        log::info!("Audio recording started");
        Ok(())
    }

    /// Idempotent.
    pub fn stop_capture(&self) {
        let worker = lock(&self.capture).take();
        if let Some(worker) = worker {
            if worker.stop("audio-capture", self.settings.shutdown_timeout) {
                log::info!("Audio recording stopped");
            }
        }
    }

    pub fn start_playback(&self) -> AudioResult<()> {
        let mut playback = lock(&self.playback);
        if playback.as_ref().is_some_and(Worker::is_alive) {
            return Ok(());
        }
        if let Some(stale) = playback.take() {
            stale.stop("audio-playback", self.settings.shutdown_timeout);
        }

        let sink = self
            .devices
            .open_playback(&self.settings.playback_device, &self.params())
            .map_err(|e| AudioError::Device(format!("{:#}", e)))?;

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            let shared = self.shared.clone();
            let frame_size = self.settings.frame_size;
            thread::Builder::new()
                .name("audio-playback".into())
                .spawn(move || play_thread(sink, &shared, frame_size, &running))
                .map_err(|e| AudioError::Device(format!("failed to spawn playback thread: {}", e)))?
        };

        *playback = Some(Worker { running, handle });
        log::info!("Audio playback started");
        Ok(())
    }

    /// Idempotent.
    pub fn stop_playback(&self) {
        let worker = lock(&self.playback).take();
        if let Some(worker) = worker {
            if worker.stop("audio-playback", self.settings.shutdown_timeout) {
                log::info!("Audio playback stopped");
            }
        }
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.capture).as_ref().is_some_and(Worker::is_alive)
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.playback).as_ref().is_some_and(Worker::is_alive)
    }

    /// Queue a PCM16 LE chunk for playback, starting playback if needed.
    pub fn enqueue_playback(&self, chunk: &[u8]) -> AudioResult<()> {
        let samples = pcm16_from_le_bytes(chunk);
        if samples.is_empty() {
            return Ok(());
        }
        self.shared.output_queue.extend(&samples);
        self.start_playback()
    }

    /// Values are clamped to [0.0, 1.0] and apply to subsequent frames only.
    pub fn set_volumes(&self, input: Option<f32>, output: Option<f32>) {
        if let Some(v) = input {
            store_f32(&self.shared.input_volume, clamp_volume(v));
        }
        if let Some(v) = output {
            store_f32(&self.shared.output_volume, clamp_volume(v));
        }
    }

    pub fn volumes(&self) -> (f32, f32) {
        (
            load_f32(&self.shared.input_volume),
            load_f32(&self.shared.output_volume),
        )
    }

    /// Drop all buffered input frames and pending output samples.
    pub fn clear_queues(&self) {
        self.shared.input_queue.clear();
        self.shared.output_queue.clear();
    }

    pub fn is_speech_detected(&self) -> bool {
        self.shared.vad.is_speech_active()
    }

    /// RMS of the most recent captured frame, for level meters.
    pub fn input_level(&self) -> f32 {
        load_f32(&self.shared.input_level)
    }

    /// Replace (or with `None`, remove) the per-frame input callback.
    pub fn set_input_callback(&self, callback: Option<InputCallback>) {
        *self
            .shared
            .input_callback
            .write()
            .unwrap_or_else(|e| e.into_inner()) = callback;
    }

    /// Next captured frame, waiting at most `timeout`.
    pub fn next_input_frame(&self, timeout: Duration) -> Option<AudioFrame> {
        self.shared.input_queue.pop_timeout(timeout)
    }

    pub fn pending_input_frames(&self) -> usize {
        self.shared.input_queue.len()
    }

    pub fn pending_output_samples(&self) -> usize {
        self.shared.output_queue.len()
    }

    pub fn shutdown(&self) {
        self.stop_capture();
        self.stop_playback();
        self.clear_queues();
        self.shared.vad.reset();
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::mock::ScriptedDevices;
    use crate::audio::frame::pcm16_to_le_bytes;

    fn settings() -> AudioSettings {
        AudioSettings {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            sample_rate: 24000,
            channels: 1,
            frame_size: 8,
            vad_threshold: 0.01,
            silence_duration: Duration::from_millis(500),
            input_queue_frames: 16,
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn system(devices: ScriptedDevices) -> AudioSystem {
        AudioSystem::new(settings(), Arc::new(devices))
    }

    #[test]
    fn volumes_are_clamped() {
        let audio = system(ScriptedDevices::new(Vec::new()));
        audio.set_volumes(Some(-1.0), Some(2.0));
        assert_eq!(audio.volumes(), (0.0, 1.0));
        audio.set_volumes(Some(0.25), None);
        assert_eq!(audio.volumes(), (0.25, 1.0));
        audio.set_volumes(None, Some(f32::NAN));
        assert_eq!(audio.volumes(), (0.25, 0.0));
    }

    #[test]
    fn capture_callback_applies_input_volume() {
        let audio = system(ScriptedDevices::new(Vec::new()));
        let raw = [1000, -2000, 4000, 0];
        let unscaled = audio.shared.on_capture_frame(&raw);
        audio.set_volumes(Some(0.5), None);
        let scaled = audio.shared.on_capture_frame(&raw);

        for (s, u) in scaled.samples().iter().zip(unscaled.samples()) {
            assert_eq!(*s as f32, *u as f32 * 0.5);
        }
        assert_eq!(scaled.samples(), &[500, -1000, 2000, 0]);

        let queued = audio.next_input_frame(Duration::ZERO).unwrap();
        assert_eq!(queued, unscaled);
    }

    #[test]
    fn capture_callback_updates_vad_and_level() {
        let audio = system(ScriptedDevices::new(Vec::new()));
        audio.shared.on_capture_frame(&[10; 8]);
        assert!(!audio.is_speech_detected());
        audio.shared.on_capture_frame(&[8000; 8]);
        assert!(audio.is_speech_detected());
        assert!(audio.input_level() > 0.2);
    }

    #[test]
    fn playback_pads_underfilled_window_with_silence() {
        let audio = system(ScriptedDevices::new(Vec::new()));
        audio.set_volumes(None, Some(0.5));
        audio.shared.output_queue.extend(&[1000, 2000, 3000]);
        let mut window = [7i16; 8];
        let n = audio.shared.fill_playback(&mut window);
        assert_eq!(n, 3);
        assert_eq!(window, [500, 1000, 1500, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn device_open_failure_leaves_engine_stopped() {
        let audio = system(ScriptedDevices::failing());
        match audio.start_capture() {
            Err(AudioError::Device(msg)) => assert!(msg.contains("no capture device")),
            other => panic!("expected device error, got {:?}", other.map(|_| ())),
        }
        assert!(!audio.is_capturing());
        assert!(audio.start_playback().is_err());
        assert!(!audio.is_playing());
        audio.stop_capture();
        audio.stop_playback();
    }

    #[test]
    fn captured_frames_arrive_in_order() {
        let frames: Vec<Vec<i16>> = (1..=5).map(|i| vec![i * 100; 8]).collect();
        let audio = system(ScriptedDevices::new(frames));
        audio.start_capture().unwrap();
        assert!(audio.is_capturing());

        let mut got = Vec::new();
        while got.len() < 5 {
            let frame = audio
                .next_input_frame(Duration::from_secs(2))
                .expect("frame within timeout");
            got.push(frame.samples()[0]);
        }
        assert_eq!(got, vec![100, 200, 300, 400, 500]);

        audio.stop_capture();
        audio.stop_capture();
        assert!(!audio.is_capturing());
    }

    #[test]
    fn enqueue_starts_playback_lazily() {
        let devices = Arc::new(ScriptedDevices::new(Vec::new()));
        let audio = AudioSystem::new(settings(), devices.clone());
        assert!(!audio.is_playing());

        audio.enqueue_playback(&pcm16_to_le_bytes(&[300; 16])).unwrap();
        assert!(audio.is_playing());

        let deadline = Instant::now() + Duration::from_secs(2);
        while devices.played().len() < 16 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(devices.played(), vec![300; 16]);

        audio.stop_playback();
        assert!(!audio.is_playing());
    }

    #[test]
    fn clear_queues_drops_buffered_audio() {
        let audio = system(ScriptedDevices::new(Vec::new()));
        audio.shared.on_capture_frame(&[1; 8]);
        audio.shared.output_queue.extend(&[1, 2, 3]);
        assert_eq!(audio.pending_input_frames(), 1);
        audio.clear_queues();
        assert_eq!(audio.pending_input_frames(), 0);
        assert!(audio.next_input_frame(Duration::ZERO).is_none());
        assert_eq!(audio.pending_output_samples(), 0);
    }

    #[test]
    fn input_callback_sees_each_frame_and_survives_panics() {
        let audio = system(ScriptedDevices::new(Vec::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        audio.set_input_callback(Some(Box::new(move |frame: &AudioFrame| {
            sink.lock().unwrap().push(frame.samples()[0]);
        })));
        audio.shared.on_capture_frame(&[10; 8]);
        audio.shared.on_capture_frame(&[20; 8]);
        assert_eq!(*seen.lock().unwrap(), vec![10, 20]);

        audio.set_input_callback(Some(Box::new(|_: &AudioFrame| panic!("boom"))));
        let frame = audio.shared.on_capture_frame(&[30; 8]);
        assert_eq!(frame.len(), 8);
        assert_eq!(audio.pending_input_frames(), 3);

        audio.set_input_callback(None);
        audio.shared.on_capture_frame(&[40; 8]);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn hung_device_does_not_stall_stop() {
        let devices = Arc::new(ScriptedDevices::hanging());
        let mut settings = settings();
        settings.shutdown_timeout = Duration::from_millis(200);
        let audio = AudioSystem::new(settings, devices.clone());
        audio.start_capture().unwrap();
        audio.start_playback().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        audio.stop_capture();
        audio.stop_playback();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "returned early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "stop stalled for {:?}", elapsed);
        assert!(!audio.is_capturing());
        assert!(!audio.is_playing());
        devices.release();
    }

    #[test]
    fn join_gives_up_on_stuck_thread() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        });
        assert!(!join_with_timeout(handle, Duration::from_millis(50), "stuck"));
        released.store(true, Ordering::SeqCst);

        let quick = thread::spawn(|| {});
        assert!(join_with_timeout(quick, Duration::from_secs(1), "quick"));
    }
}
