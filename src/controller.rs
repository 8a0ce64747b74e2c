use crate::audio::{join_with_timeout, lock, pcm16_to_le_bytes, AudioFrame, AudioSystem};
use crate::config::{Config, DialogueSettings};
use crate::error::SessionError;
use crate::net_link::Connector;
use crate::persona::{self, VoiceRegistry};
use crate::session::{RealtimeSession, SessionEvent};
use crate::state_machine::{PendingSnapshot, SessionState};
use crate::ui_bridge::UiBridge;
use crate::utterance::{SpeechGate, UtteranceAccumulator};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Upper bound on how long the commit loop waits for a frame before it
/// re-checks the voice-mode flag.
const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SESSION_EVENT_CAPACITY: usize = 64;
const DEFAULT_PREVIEW_LINE: &str = "Hello, this is my voice!";

/// What happened to one accumulated chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    NotReady,
    /// Ready but zero-length; nothing was sent.
    Empty,
    /// Appended to the server buffer; a response is already pending.
    Appended,
    Committed,
    /// Not connected or the send failed.
    Dropped,
}

struct CommitWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Point-in-time view of the conversation for the front end.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueStatus {
    pub persona: String,
    pub state: SessionState,
    pub session_id: Option<String>,
    /// Persona the server-side session is currently configured for
    pub configured_for: Option<String>,
    pub pending: PendingSnapshot,
    pub voice_mode: bool,
    pub voice_enabled: bool,
    pub capturing: bool,
    pub playing: bool,
    pub speech_detected: bool,
    pub input_level: f32,
    pub volumes: (f32, f32),
    pub queued_input_frames: usize,
    pub queued_output_samples: usize,
}

impl fmt::Display for DialogueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "persona: {} | session: {} ({}) configured for {}",
            self.persona,
            self.state,
            self.session_id.as_deref().unwrap_or("-"),
            self.configured_for.as_deref().unwrap_or("-"),
        )?;
        writeln!(
            f,
            "response: processing={} playing={} interrupted={}",
            self.pending.is_processing, self.pending.is_playing, self.pending.interrupted,
        )?;
        write!(
            f,
            "voice: mode={} enabled={} capture={} playback={} speech={} level={:.3} volume={:.2}/{:.2} queued in/out={}/{}",
            self.voice_mode,
            self.voice_enabled,
            self.capturing,
            self.playing,
            self.speech_detected,
            self.input_level,
            self.volumes.0,
            self.volumes.1,
            self.queued_input_frames,
            self.queued_output_samples,
        )
    }
}

/// Binds one audio engine and one realtime session into a conversation
/// and turns front-end intents into audio and protocol calls.
pub struct DialogueController {
    audio: Arc<AudioSystem>,
    session: Arc<RealtimeSession>,
    ui: UiBridge,
    settings: DialogueSettings,
    sample_rate: u32,
    shutdown_timeout: Duration,
    persona: Mutex<String>,
    voice_mode: AtomicBool,
    /// Cleared for good by a non-recoverable session error
    voice_enabled: AtomicBool,
    commit_worker: Mutex<Option<CommitWorker>>,
    runtime: Handle,
}

impl DialogueController {
    /// Must be called from within a tokio runtime; spawns the event pump.
    pub fn new(
        config: &Config,
        audio: Arc<AudioSystem>,
        connector: Arc<dyn Connector>,
        ui: UiBridge,
    ) -> Arc<Self> {
        let (tx_event, rx_event) = mpsc::channel::<SessionEvent>(SESSION_EVENT_CAPACITY);
        let registry = VoiceRegistry::new(config.personas.clone(), &config.dialogue.default_persona);
        let default_persona = registry.fallback_id().to_string();
        let session = Arc::new(RealtimeSession::new(
            connector,
            &config.network,
            config.session.clone(),
            registry,
            tx_event,
        ));

        let controller = Arc::new(Self {
            sample_rate: audio.settings().sample_rate,
            shutdown_timeout: audio.settings().shutdown_timeout,
            audio,
            session,
            ui,
            settings: config.dialogue.clone(),
            persona: Mutex::new(default_persona),
            voice_mode: AtomicBool::new(false),
            voice_enabled: AtomicBool::new(true),
            commit_worker: Mutex::new(None),
            runtime: Handle::current(),
        });

        tokio::spawn(event_pump(Arc::downgrade(&controller), rx_event));
        controller
    }

    pub fn current_persona(&self) -> String {
        lock(&self.persona).clone()
    }

    pub fn is_voice_mode(&self) -> bool {
        self.voice_mode.load(Ordering::SeqCst)
    }

    pub fn is_voice_enabled(&self) -> bool {
        self.voice_enabled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DialogueStatus {
        DialogueStatus {
            persona: self.current_persona(),
            state: self.session.state(),
            session_id: self.session.session_id(),
            configured_for: self.session.active_persona(),
            pending: self.session.pending(),
            voice_mode: self.is_voice_mode(),
            voice_enabled: self.is_voice_enabled(),
            capturing: self.audio.is_capturing(),
            playing: self.audio.is_playing(),
            speech_detected: self.audio.is_speech_detected(),
            input_level: self.audio.input_level(),
            volumes: self.audio.volumes(),
            queued_input_frames: self.audio.pending_input_frames(),
            queued_output_samples: self.audio.pending_output_samples(),
        }
    }

    pub fn persona_ids(&self) -> Vec<String> {
        self.session.persona_ids()
    }

    /// Greet the user as `persona_id` and bring the session up for it.
    /// Unknown ids fall back to the default persona. Returns whether the
    /// session is connected and configured.
    pub async fn start_conversation(&self, persona_id: &str) -> bool {
        let profile = self.session.voice_profile(persona_id);
        *lock(&self.persona) = profile.persona_id.clone();
        log::info!("Conversation started with {}", profile.persona_id);

        if let Some(greeting) = &profile.sample {
            self.ui.text(greeting.clone(), true).await;
        }

        if !self.session.is_connected() && !self.session.connect().await {
            self.ui
                .status("Voice service unavailable, replies will be local")
                .await;
            return false;
        }
        self.session
            .configure_session(&profile.voice, &profile.instructions, &profile.persona_id)
            .await
    }

    /// Switch voice mode on or off and return the new mode.
    pub async fn toggle_voice_mode(&self) -> bool {
        if self.is_voice_mode() {
            self.leave_voice_mode().await;
            return false;
        }
        if !self.is_voice_enabled() {
            log::warn!("Speech mode toggle attempted but speech is disabled");
            self.ui.error("Voice mode is disabled.").await;
            return false;
        }

        if !self.session.is_connected() && !self.reconnect().await {
            log::error!("Failed to connect to realtime API");
            self.ui
                .error("Voice API connection failed. Please try again.")
                .await;
            return false;
        }

        if let Err(e) = self.audio.start_capture() {
            log::error!("Failed to start voice mode: {}", e);
            self.ui.error(format!("Failed to start voice mode: {}", e)).await;
            return false;
        }
        if let Err(e) = self.audio.start_playback() {
            log::error!("Failed to start voice mode: {}", e);
            self.audio.stop_capture();
            self.ui.error(format!("Failed to start voice mode: {}", e)).await;
            return false;
        }

        self.watch_speech_onset();
        self.voice_mode.store(true, Ordering::SeqCst);
        match self.spawn_commit_loop() {
            Ok(worker) => {
                *lock(&self.commit_worker) = Some(worker);
            }
            Err(e) => {
                log::error!("Failed to spawn commit loop: {}", e);
                self.voice_mode.store(false, Ordering::SeqCst);
                self.teardown_audio(None).await;
                self.ui.error(format!("Failed to start voice mode: {}", e)).await;
                return false;
            }
        }

        log::info!("Microphone and speaker streams started. Listening for user speech.");
        self.ui.status("Voice mode on").await;
        true
    }

    /// Bounded reconnect. A connect that outlives the wait keeps running in
    /// the background.
    async fn reconnect(&self) -> bool {
        log::warn!("Realtime client not connected. Attempting to reconnect...");
        let session = self.session.clone();
        let persona = self.current_persona();
        let attempt = tokio::spawn(async move {
            session.connect().await && session.configure_persona(&persona).await
        });
        match tokio::time::timeout(self.settings.reconnect_wait, attempt).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                log::error!("Reconnect task failed: {}", e);
                false
            }
            Err(_) => {
                log::warn!("Reconnect still pending after {:?}", self.settings.reconnect_wait);
                self.session.is_connected()
            }
        }
    }

    fn speech_gate(&self) -> SpeechGate {
        let audio = self.audio.settings();
        SpeechGate::new(audio.vad_threshold, audio.silence_duration, audio.sample_rate)
    }

    /// Status line each time the user starts talking after a pause.
    fn watch_speech_onset(&self) {
        let ui = self.ui.clone();
        let gate = Mutex::new(self.speech_gate());
        self.audio.set_input_callback(Some(Box::new(move |frame: &AudioFrame| {
            let mut gate = lock(&gate);
            let was_open = gate.is_open();
            if gate.admit(frame) && !was_open {
                ui.try_status("Hearing you...");
            }
        })));
    }

    fn spawn_commit_loop(&self) -> std::io::Result<CommitWorker> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            let audio = self.audio.clone();
            let session = self.session.clone();
            let runtime = self.runtime.clone();
            let accumulator = UtteranceAccumulator::new(self.settings.min_commit, self.sample_rate);
            let gate = self.speech_gate();
            thread::Builder::new()
                .name("utterance-commit".into())
                .spawn(move || commit_loop(&audio, &session, &runtime, &running, gate, accumulator))?
        };
        Ok(CommitWorker { running, handle })
    }

    async fn leave_voice_mode(&self) {
        if !self.voice_mode.swap(false, Ordering::SeqCst) {
            return;
        }
        let worker = lock(&self.commit_worker).take();
        self.teardown_audio(worker).await;
        log::info!("Voice mode stopped");
        self.ui.status("Voice mode off").await;
    }

    async fn teardown_audio(&self, worker: Option<CommitWorker>) {
        self.audio.set_input_callback(None);
        let audio = self.audio.clone();
        let timeout = self.shutdown_timeout;
        let joined = tokio::task::spawn_blocking(move || {
            if let Some(worker) = worker {
                worker.running.store(false, Ordering::SeqCst);
                join_with_timeout(worker.handle, timeout, "utterance-commit");
            }
            audio.stop_capture();
            audio.stop_playback();
            audio.clear_queues();
        })
        .await;
        if let Err(e) = joined {
            log::error!("Voice mode teardown failed: {}", e);
        }
    }

    /// Send a typed message as the current persona. Any reply in flight is
    /// interrupted first. Returns whether the message reached the service.
    pub async fn send_text_message(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }

        self.interrupt().await;

        let persona = self.current_persona();
        log::info!("User text message: {}", text);
        if self.session.is_connected() {
            self.session.send_text_message(text, Some(&persona), false).await
        } else {
            log::warn!("Realtime API not connected, using fallback response");
            let profile = self.session.voice_profile(&persona);
            self.ui
                .text(persona::fallback_reply(&profile, text), true)
                .await;
            false
        }
    }

    /// Stop local playback, drop queued audio and cancel the server
    /// response. Safe with nothing in flight.
    pub async fn interrupt(&self) {
        let audio = self.audio.clone();
        let stopped = tokio::task::spawn_blocking(move || {
            audio.stop_playback();
            audio.clear_queues();
        })
        .await;
        if let Err(e) = stopped {
            log::error!("Failed to stop playback: {}", e);
        }

        if self.session.is_connected() {
            self.session.interrupt_response().await;
            log::info!("Speech interrupted by player");
        } else {
            log::info!("Speech interrupted locally (no active connection)");
        }
    }

    /// Speak `persona_id`'s sample line in its own voice.
    pub async fn preview_voice(&self, persona_id: &str) -> bool {
        if !self.session.is_known_persona(persona_id) {
            log::warn!("No voice profile for '{}'", persona_id);
            return false;
        }
        if !self.session.is_connected() {
            self.ui.status("Realtime API not connected.").await;
            return false;
        }
        let profile = self.session.voice_profile(persona_id);
        let line = profile
            .sample
            .unwrap_or_else(|| DEFAULT_PREVIEW_LINE.to_string());
        self.ui.status(format!("Previewing {}...", persona_id)).await;
        self.session.send_text_message(&line, Some(persona_id), true).await
    }

    /// Change the voice a known persona speaks with. Applies from the next
    /// session configuration for that persona.
    pub fn set_persona_voice(&self, persona_id: &str, voice: &str) -> bool {
        if !self.session.is_known_persona(persona_id) {
            log::warn!("No voice profile for '{}'", persona_id);
            return false;
        }
        let mut profile = self.session.voice_profile(persona_id);
        profile.voice = voice.to_string();
        self.session.set_voice_profile(profile);
        true
    }

    pub fn set_volumes(&self, input: Option<f32>, output: Option<f32>) {
        self.audio.set_volumes(input, output);
    }

    /// Leave voice mode, close the session and release the devices.
    pub async fn end_conversation(&self) {
        self.leave_voice_mode().await;
        self.session.disconnect().await;
        let audio = self.audio.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || audio.shutdown()).await {
            log::error!("Audio shutdown failed: {}", e);
        }
        log::info!("Conversation with {} ended", self.current_persona());
    }

    async fn on_session_error(&self, error: SessionError) {
        log::error!("Realtime API error: {}", error);
        self.ui.error(error.to_string()).await;

        if error.is_recoverable() {
            return;
        }
        // A failed connect is the caller's to retry; anything else turns
        // voice off until the process restarts.
        if !matches!(error, SessionError::ConnectionFailed { .. }) {
            self.voice_enabled.store(false, Ordering::SeqCst);
        }
        if self.is_voice_mode() {
            self.leave_voice_mode().await;
            log::info!("Speech mode disabled due to error, fallback to text mode");
            self.ui
                .status("Voice mode disabled, text input still available")
                .await;
        }
    }
}

/// Accumulate captured frames and ship them once enough audio is buffered.
/// Runs on its own OS thread until `running` is cleared.
fn commit_loop(
    audio: &AudioSystem,
    session: &RealtimeSession,
    runtime: &Handle,
    running: &AtomicBool,
    mut gate: SpeechGate,
    mut accumulator: UtteranceAccumulator,
) {
    log::info!("Utterance commit loop started");
    while running.load(Ordering::SeqCst) {
        if let Some(frame) = audio.next_input_frame(FRAME_POLL_INTERVAL) {
            if !gate.admit(&frame) {
                continue;
            }
            accumulator.push(frame);
            flush_ready_chunk(&mut accumulator, session, runtime);
        }
    }
    log::info!("Utterance commit loop stopped");
}

fn flush_ready_chunk(
    accumulator: &mut UtteranceAccumulator,
    session: &RealtimeSession,
    runtime: &Handle,
) -> ChunkOutcome {
    if !accumulator.should_commit() {
        return ChunkOutcome::NotReady;
    }
    if accumulator.is_empty() {
        log::info!("Audio buffer empty, skipping commit");
        return ChunkOutcome::Empty;
    }
    let duration = accumulator.duration();
    let chunk = accumulator.drain();

    let pcm = pcm16_to_le_bytes(&chunk);
    log::debug!("Sending {:?} of audio ({} samples)", duration, chunk.len());
    runtime.block_on(async {
        if !session.send_audio_chunk(&pcm).await {
            return ChunkOutcome::Dropped;
        }
        // One commit per pending response; the rest waits in the server buffer
        if session.pending().is_processing {
            return ChunkOutcome::Appended;
        }
        if session.commit_audio_buffer().await {
            ChunkOutcome::Committed
        } else {
            ChunkOutcome::Dropped
        }
    })
}

/// Reply text accumulated across deltas.
#[derive(Default)]
struct ReplyText {
    text: String,
    transcript: String,
    /// The complete text of the current response has been delivered
    delivered: bool,
}

async fn event_pump(controller: Weak<DialogueController>, mut rx: mpsc::Receiver<SessionEvent>) {
    let mut reply = ReplyText::default();
    while let Some(event) = rx.recv().await {
        let Some(ctl) = controller.upgrade() else {
            break;
        };
        ctl.handle_session_event(event, &mut reply).await;
    }
    log::debug!("Session event pump finished");
}

impl DialogueController {
    async fn handle_session_event(&self, event: SessionEvent, reply: &mut ReplyText) {
        match event {
            SessionEvent::SessionCreated(_) => {
                *reply = ReplyText::default();
                log::info!("Realtime session created successfully");
                self.ui.status("Session ready").await;
            }
            SessionEvent::ResponseStarted => {
                *reply = ReplyText::default();
            }
            SessionEvent::TextDelta(delta) => {
                reply.text.push_str(&delta);
                self.ui.text(reply.text.clone(), false).await;
            }
            SessionEvent::TranscriptDelta(delta) => {
                reply.transcript.push_str(&delta);
                if reply.text.is_empty() {
                    self.ui.text(reply.transcript.clone(), false).await;
                }
            }
            SessionEvent::TextDone(text) => {
                let text = if text.is_empty() { std::mem::take(&mut reply.text) } else { text };
                self.deliver_complete(text, reply).await;
            }
            SessionEvent::TranscriptDone(transcript) => {
                let text = if transcript.is_empty() {
                    std::mem::take(&mut reply.transcript)
                } else {
                    transcript
                };
                self.deliver_complete(text, reply).await;
            }
            SessionEvent::AudioDelta(pcm) => {
                // May open the playback device
                let audio = self.audio.clone();
                match tokio::task::spawn_blocking(move || audio.enqueue_playback(&pcm)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("Failed to play audio response: {}", e),
                    Err(e) => log::error!("Playback task failed: {}", e),
                }
            }
            SessionEvent::SpeechStarted => {
                log::info!("API detected speech started");
                self.ui.status("Listening...").await;
            }
            SessionEvent::SpeechStopped => {
                log::info!("API detected speech stopped");
                self.ui.status("Thinking...").await;
            }
            SessionEvent::ResponseDone => {
                *reply = ReplyText::default();
            }
            SessionEvent::Error(error) => {
                // Whatever reply was streaming will not finish
                *reply = ReplyText::default();
                self.on_session_error(error).await
            }
        }
    }

    async fn deliver_complete(&self, text: String, reply: &mut ReplyText) {
        if reply.delivered {
            log::debug!("Reply already delivered, ignoring duplicate final text");
            return;
        }
        reply.delivered = true;
        reply.text.clear();
        reply.transcript.clear();
        log::info!("Complete NPC response: {}", text);
        self.ui.text(text, true).await;
    }
}
