//! Realtime voice session: one persistent connection, an explicit state
//! machine and a receive loop that turns server messages into
//! [`SessionEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::lock;
use crate::config::{NetworkConfig, SessionSettings};
use crate::error::SessionError;
use crate::net_link::{Connector, Link, NetCommand, NetEvent};
use crate::persona::{VoiceProfile, VoiceRegistry};
use crate::protocol::{
    message_type, ClientEvent, ConversationItem, ErrorClass, InputAudioTranscription,
    ResponseConfig, ServerEvent, SessionConfig, TurnDetection,
};
use crate::state_machine::{PendingResponse, PendingSnapshot, ResponseOrigin, ResponseTracker, SessionState};

const RECEIVE_LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the session reports to its owner, one per inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionCreated(Option<String>),
    /// The server started a response the client still wants.
    ResponseStarted,
    TextDelta(String),
    TextDone(String),
    TranscriptDelta(String),
    TranscriptDone(String),
    /// Decoded PCM16 LE audio
    AudioDelta(Bytes),
    SpeechStarted,
    SpeechStopped,
    ResponseDone,
    Error(SessionError),
}

/// Persona the session is currently configured for.
#[derive(Debug, Clone)]
struct ActivePersona {
    persona_id: String,
    instructions: String,
}

struct Inner {
    state: Mutex<SessionState>,
    pending: PendingResponse,
    responses: ResponseTracker,
    session_id: Mutex<Option<String>>,
    active: Mutex<Option<ActivePersona>>,
    link_tx: Mutex<Option<mpsc::Sender<NetCommand>>>,
    /// Set when we are the ones closing the transport.
    closing: AtomicBool,
    events: mpsc::Sender<SessionEvent>,
}

impl Inner {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn transition(&self, next: SessionState) -> bool {
        lock(&self.state).transition(next)
    }

    fn is_connected(&self) -> bool {
        self.state().is_connected() && lock(&self.link_tx).is_some()
    }

    async fn post(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("Session event dropped: listener is gone");
        }
    }

    async fn send(&self, event: ClientEvent) -> Result<(), SessionError> {
        let what = event.kind();
        let tx = lock(&self.link_tx).clone().ok_or_else(|| SessionError::SendFailed {
            what,
            reason: "not connected".to_string(),
        })?;
        let json = event.to_json().map_err(|e| SessionError::SendFailed {
            what,
            reason: e.to_string(),
        })?;
        tx.send(NetCommand::SendText(json))
            .await
            .map_err(|_| SessionError::SendFailed {
                what,
                reason: "transport closed".to_string(),
            })
    }

    /// Ask the transport to close without reporting it as a failure.
    async fn close_transport(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let tx = lock(&self.link_tx).take();
        if let Some(tx) = tx {
            let _ = tx.send(NetCommand::Close).await;
        }
    }

    fn on_closed(&self, reason: Option<String>) -> bool {
        lock(&self.link_tx).take();
        self.pending.clear();
        self.responses.reset();
        self.transition(SessionState::Disconnected);
        if self.closing.load(Ordering::SeqCst) {
            log::debug!("Transport closed on request");
            false
        } else {
            log::warn!("Connection closed by peer: {}", reason.as_deref().unwrap_or("no reason"));
            true
        }
    }

    /// Route one inbound message. Returns false when the loop must stop.
    async fn dispatch(&self, text: &str) -> bool {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Malformed server message: {}", e);
                self.post(SessionEvent::Error(SessionError::Protocol {
                    message: format!("Malformed server message: {}", e),
                    recoverable: true,
                }))
                .await;
                return true;
            }
        };

        let reply_part = matches!(
            event,
            ServerEvent::ResponseCreated { .. }
                | ServerEvent::TextDelta { .. }
                | ServerEvent::TextDone { .. }
                | ServerEvent::TranscriptDelta { .. }
                | ServerEvent::TranscriptDone { .. }
                | ServerEvent::AudioDelta { .. }
        );
        if reply_part {
            match self.responses.admit(event.response_id()) {
                ResponseOrigin::Cancelled => {
                    log::debug!(
                        "Dropping {} of cancelled response {}",
                        message_type(text).as_deref().unwrap_or("?"),
                        event.response_id().unwrap_or("?")
                    );
                    return true;
                }
                ResponseOrigin::New => self.post(SessionEvent::ResponseStarted).await,
                ResponseOrigin::Current => {}
            }
        }

        match event {
            ServerEvent::SessionCreated { session } => {
                log::info!("Session created: {}", session.id.as_deref().unwrap_or("?"));
                *lock(&self.session_id) = session.id.clone();
                self.post(SessionEvent::SessionCreated(session.id)).await;
            }
            ServerEvent::SessionUpdated {} => {
                log::debug!("Session configuration acknowledged");
            }
            ServerEvent::ResponseCreated { response } => {
                log::debug!("Response started: {}", response.id.as_deref().unwrap_or("?"));
            }
            ServerEvent::TextDelta { delta, .. } => self.post(SessionEvent::TextDelta(delta)).await,
            ServerEvent::TextDone { text, .. } => self.post(SessionEvent::TextDone(text)).await,
            ServerEvent::TranscriptDelta { delta, .. } => {
                self.post(SessionEvent::TranscriptDelta(delta)).await
            }
            ServerEvent::TranscriptDone { transcript, .. } => {
                self.post(SessionEvent::TranscriptDone(transcript)).await
            }
            ServerEvent::AudioDelta { delta, .. } => {
                if self.pending.is_interrupted() {
                    log::debug!("Dropping audio delta of interrupted response");
                    return true;
                }
                match BASE64_STANDARD.decode(delta.as_bytes()) {
                    Ok(pcm) => {
                        self.pending.mark_playing();
                        self.post(SessionEvent::AudioDelta(Bytes::from(pcm))).await;
                    }
                    Err(e) => {
                        self.post(SessionEvent::Error(SessionError::Protocol {
                            message: format!("Undecodable audio delta: {}", e),
                            recoverable: true,
                        }))
                        .await;
                    }
                }
            }
            ServerEvent::SpeechStarted {} => {
                log::info!("Speech started");
                self.transition(SessionState::Listening);
                self.post(SessionEvent::SpeechStarted).await;
            }
            ServerEvent::SpeechStopped {} => {
                log::info!("Speech stopped");
                if self.state() == SessionState::Listening {
                    self.transition(SessionState::Idle);
                }
                self.post(SessionEvent::SpeechStopped).await;
            }
            ServerEvent::ResponseDone { response } => {
                if self.responses.finish(response.id.as_deref()) {
                    log::debug!("Cancelled response finished");
                    return true;
                }
                self.pending.clear();
                if self.state() == SessionState::Responding {
                    self.transition(SessionState::Idle);
                }
                self.post(SessionEvent::ResponseDone).await;
            }
            ServerEvent::Error { error } => {
                let message = if error.message.is_empty() {
                    error.kind.clone()
                } else {
                    error.message.clone()
                };
                match error.classify() {
                    ErrorClass::CancelRace => {
                        log::debug!("Cancel arrived after response finished: {}", message);
                        self.pending.clear();
                        self.responses.settle();
                    }
                    ErrorClass::Recoverable => {
                        log::warn!("Request rejected by server: {}", message);
                        self.pending.clear();
                        self.responses.settle();
                        if matches!(self.state(), SessionState::Responding | SessionState::Listening) {
                            self.transition(SessionState::Idle);
                        }
                        self.post(SessionEvent::Error(SessionError::Protocol {
                            message,
                            recoverable: true,
                        }))
                        .await;
                    }
                    ErrorClass::Fatal => {
                        log::error!("Server error ({}): {}", error.kind, message);
                        self.transition(SessionState::Erroring);
                        self.pending.clear();
                        self.post(SessionEvent::Error(SessionError::Protocol {
                            message,
                            recoverable: false,
                        }))
                        .await;
                        self.close_transport().await;
                        self.transition(SessionState::Disconnected);
                        return false;
                    }
                }
            }
            ServerEvent::Unknown => {
                log::debug!(
                    "Unhandled server event: {}",
                    message_type(text).as_deref().unwrap_or("?")
                );
            }
        }
        true
    }
}

async fn receive_loop(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<NetEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = rx.recv() => match event {
                Some(NetEvent::Text(text)) => {
                    if !inner.dispatch(&text).await {
                        break;
                    }
                }
                Some(NetEvent::Closed(reason)) => {
                    if inner.on_closed(reason) {
                        inner.post(SessionEvent::Error(SessionError::ConnectionClosed)).await;
                    }
                    break;
                }
                None => {
                    if inner.on_closed(None) {
                        inner.post(SessionEvent::Error(SessionError::ConnectionClosed)).await;
                    }
                    break;
                }
            }
        }
    }
    log::debug!("Receive loop finished");
}

struct ReceiveLoop {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Client side of one realtime conversation session.
pub struct RealtimeSession {
    connector: Arc<dyn Connector>,
    connect_attempts: u32,
    retry_delay: Duration,
    settings: SessionSettings,
    registry: RwLock<VoiceRegistry>,
    inner: Arc<Inner>,
    receiver: Mutex<Option<ReceiveLoop>>,
}

impl RealtimeSession {
    pub fn new(
        connector: Arc<dyn Connector>,
        network: &NetworkConfig,
        settings: SessionSettings,
        registry: VoiceRegistry,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            connector,
            connect_attempts: network.connect_attempts.max(1),
            retry_delay: network.connect_retry_delay,
            settings,
            registry: RwLock::new(registry),
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState::Disconnected),
                pending: PendingResponse::default(),
                responses: ResponseTracker::default(),
                session_id: Mutex::new(None),
                active: Mutex::new(None),
                link_tx: Mutex::new(None),
                closing: AtomicBool::new(false),
                events,
            }),
            receiver: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn pending(&self) -> PendingSnapshot {
        self.inner.pending.snapshot()
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.session_id).clone()
    }

    pub fn active_persona(&self) -> Option<String> {
        lock(&self.inner.active).as_ref().map(|a| a.persona_id.clone())
    }

    /// Open the connection, retrying with a fixed delay. Never errors: a
    /// failure is reported as `ConnectionFailed` on the event channel.
    pub async fn connect(&self) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if state.is_connected() && lock(&self.inner.link_tx).is_some() {
                return true;
            }
            if *state == SessionState::Connecting {
                log::warn!("Connect already in progress");
                return false;
            }
            if !state.transition(SessionState::Connecting) {
                return false;
            }
        }

        for attempt in 1..=self.connect_attempts {
            match self.connector.open().await {
                Ok(link) => {
                    self.attach(link);
                    log::info!("Connected to realtime service (attempt {})", attempt);
                    return true;
                }
                Err(e) => {
                    log::warn!(
                        "Connection attempt {}/{} failed: {:#}",
                        attempt,
                        self.connect_attempts,
                        e
                    );
                    if attempt < self.connect_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.inner.transition(SessionState::Disconnected);
        log::error!("Giving up after {} connection attempts", self.connect_attempts);
        self.inner
            .post(SessionEvent::Error(SessionError::ConnectionFailed {
                attempts: self.connect_attempts,
            }))
            .await;
        false
    }

    fn attach(&self, link: Link) {
        let Link { tx, rx } = link;
        *lock(&self.inner.link_tx) = Some(tx);
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.pending.clear();
        self.inner.responses.reset();
        self.inner.transition(SessionState::Connected);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(receive_loop(self.inner.clone(), rx, shutdown_rx));
        let previous = lock(&self.receiver).replace(ReceiveLoop {
            handle,
            shutdown: shutdown_tx,
        });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Stop the receive loop and close the transport. Idempotent.
    pub async fn disconnect(&self) {
        let receiver = lock(&self.receiver).take();
        self.inner.close_transport().await;

        if let Some(ReceiveLoop { mut handle, shutdown }) = receiver {
            let _ = shutdown.send(true);
            if tokio::time::timeout(RECEIVE_LOOP_JOIN_TIMEOUT, &mut handle).await.is_err() {
                log::warn!("Receive loop did not stop within {:?}, aborting", RECEIVE_LOOP_JOIN_TIMEOUT);
                handle.abort();
            }
        }

        self.inner.pending.clear();
        if self.inner.state() != SessionState::Disconnected {
            self.inner.transition(SessionState::Disconnected);
            log::info!("Disconnected from realtime service");
        }
    }

    fn session_config(&self, voice: &str, instructions: &str) -> SessionConfig {
        SessionConfig {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: instructions.to_string(),
            voice: voice.to_string(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: InputAudioTranscription {
                model: self.settings.transcription_model.to_string(),
            },
            turn_detection: TurnDetection::server_vad(
                self.settings.turn_threshold,
                self.settings.prefix_padding_ms,
                self.settings.turn_silence_duration_ms,
            ),
            temperature: self.settings.temperature,
            max_response_output_tokens: self.settings.max_output_tokens,
        }
    }

    /// Send `session.update` for the given voice and instructions.
    /// Returns false without sending when not connected.
    pub async fn configure_session(&self, voice: &str, instructions: &str, persona_id: &str) -> bool {
        if !self.is_connected() {
            log::warn!("Cannot configure session for {}: not connected", persona_id);
            return false;
        }
        if !self.inner.transition(SessionState::Configuring) {
            return false;
        }

        let update = ClientEvent::SessionUpdate {
            session: self.session_config(voice, instructions),
        };
        match self.inner.send(update).await {
            Ok(()) => {
                *lock(&self.inner.active) = Some(ActivePersona {
                    persona_id: persona_id.to_string(),
                    instructions: instructions.to_string(),
                });
                self.inner.transition(SessionState::Idle);
                log::info!("Session configured for {} with voice {}", persona_id, voice);
                true
            }
            Err(e) => {
                log::error!("Failed to configure session: {}", e);
                self.inner.transition(SessionState::Idle);
                self.inner.post(SessionEvent::Error(e)).await;
                false
            }
        }
    }

    /// Configure for a registered persona; unknown ids use the fallback.
    pub async fn configure_persona(&self, persona_id: &str) -> bool {
        let profile = self.voice_profile(persona_id);
        self.configure_session(&profile.voice, &profile.instructions, &profile.persona_id)
            .await
    }

    /// Append PCM16 LE audio to the server input buffer. No-op when not
    /// connected.
    pub async fn send_audio_chunk(&self, pcm: &[u8]) -> bool {
        if !self.is_connected() {
            log::debug!("Dropping {} bytes of audio: not connected", pcm.len());
            return false;
        }
        match self.inner.send(ClientEvent::audio_append(pcm)).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("{}", e);
                self.inner.post(SessionEvent::Error(e)).await;
                false
            }
        }
    }

    /// Flush the server input buffer and ask for a response.
    pub async fn commit_audio_buffer(&self) -> bool {
        if !self.is_connected() {
            log::warn!("Cannot commit audio buffer: not connected");
            return false;
        }
        self.inner.pending.begin();
        match self.inner.send(ClientEvent::InputAudioBufferCommit).await {
            Ok(()) => {
                self.inner.transition(SessionState::Responding);
                log::info!("Audio buffer committed, waiting for response...");
                true
            }
            Err(e) => {
                log::error!("{}", e);
                self.inner.pending.clear();
                self.inner.post(SessionEvent::Error(e)).await;
                false
            }
        }
    }

    /// Send a user text turn and request a spoken reply. When `persona_id`
    /// is registered the session is reconfigured for it first so the reply
    /// uses that voice.
    pub async fn send_text_message(&self, text: &str, persona_id: Option<&str>, preview_mode: bool) -> bool {
        if !self.is_connected() {
            log::warn!("Cannot send text message: not connected");
            return false;
        }

        if let Some(id) = persona_id {
            let profile = {
                let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
                registry.get(id).cloned()
            };
            match profile {
                Some(p) => {
                    self.configure_session(&p.voice, &p.instructions, &p.persona_id).await;
                }
                None => log::warn!("Unknown persona '{}', keeping current configuration", id),
            }
        }

        let instructions = lock(&self.inner.active).as_ref().map(|a| a.instructions.clone());
        self.inner.pending.begin();

        let item = ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        };
        let request = ClientEvent::ResponseCreate {
            response: ResponseConfig {
                modalities: vec!["text".to_string(), "audio".to_string()],
                instructions,
            },
        };

        let sent = match self.inner.send(item).await {
            Ok(()) => self.inner.send(request).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                self.inner.transition(SessionState::Responding);
                if preview_mode {
                    log::info!("Preview mode: sent sample line for {}", persona_id.unwrap_or("?"));
                } else {
                    log::info!("Text message sent, waiting for response...");
                }
                true
            }
            Err(e) => {
                log::error!("Failed to send text message: {}", e);
                self.inner.pending.clear();
                self.inner.post(SessionEvent::Error(e)).await;
                false
            }
        }
    }

    /// Best-effort cancel of the current response. Audio for that response
    /// is dropped from here on even if the server keeps streaming.
    pub async fn interrupt_response(&self) -> bool {
        let in_flight = self.inner.pending.is_processing();
        self.inner.pending.interrupt();
        if !self.is_connected() {
            return false;
        }
        self.inner.responses.cancel_current(in_flight);
        if self.inner.state() == SessionState::Responding {
            self.inner.transition(SessionState::Idle);
        }
        match self.inner.send(ClientEvent::ResponseCancel).await {
            Ok(()) => {
                log::info!("Response interrupted by user");
                true
            }
            Err(e) => {
                log::error!("Failed to interrupt response: {}", e);
                false
            }
        }
    }

    /// Profile for `persona_id`, falling back to the default persona.
    pub fn voice_profile(&self, persona_id: &str) -> VoiceProfile {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(persona_id)
            .clone()
    }

    pub fn set_voice_profile(&self, profile: VoiceProfile) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set(profile);
    }

    pub fn is_known_persona(&self, persona_id: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_known(persona_id)
    }

    pub fn persona_ids(&self) -> Vec<String> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .persona_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net_link::mock::MockConnector;
    use crate::persona::default_profiles;
    use serde_json::Value;

    fn network() -> NetworkConfig {
        NetworkConfig {
            ws_url: "wss://example.invalid/v1/realtime",
            model: "test-model",
            api_key: "sk-test".to_string(),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(10),
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            transcription_model: "whisper-1",
            turn_threshold: 0.5,
            prefix_padding_ms: 300,
            turn_silence_duration_ms: 200,
            temperature: 0.8,
            max_output_tokens: 4096,
        }
    }

    fn session(mock: Arc<MockConnector>) -> (RealtimeSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let registry = VoiceRegistry::new(default_profiles(), "HR");
        (RealtimeSession::new(mock, &network(), settings(), registry, tx), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    async fn wait_state(session: &RealtimeSession, state: SessionState) {
        for _ in 0..200 {
            if session.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state stuck at {}, wanted {}", session.state(), state);
    }

    async fn configured(mock: &Arc<MockConnector>) -> (RealtimeSession, mpsc::Receiver<SessionEvent>) {
        let (session, rx) = session(mock.clone());
        assert!(session.connect().await);
        assert!(session.configure_persona("HR").await);
        (session, rx)
    }

    #[tokio::test]
    async fn connect_gives_up_after_three_attempts() {
        let mock = Arc::new(MockConnector::failing(10));
        let (session, mut rx) = session(mock.clone());

        assert!(!session.connect().await);
        assert_eq!(mock.attempts(), 3);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            next(&mut rx).await,
            SessionEvent::Error(SessionError::ConnectionFailed { attempts: 3 })
        );
    }

    #[tokio::test]
    async fn connect_retries_then_succeeds() {
        let mock = Arc::new(MockConnector::failing(2));
        let (session, _rx) = session(mock.clone());

        assert!(session.connect().await);
        assert_eq!(mock.attempts(), 3);
        assert_eq!(session.state(), SessionState::Connected);

        assert!(session.connect().await);
        assert_eq!(mock.attempts(), 3);
    }

    #[tokio::test]
    async fn configure_sends_session_update() {
        let mock = Arc::new(MockConnector::new());
        let (session, _rx) = session(mock.clone());
        assert!(session.connect().await);

        assert!(session.configure_session("echo", "Be bold.", "CEO").await);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.active_persona().as_deref(), Some("CEO"));

        assert!(mock.wait_for("session.update", 1).await);
        let update = &mock.sent_of_type("session.update")[0];
        let s = &update["session"];
        assert_eq!(s["voice"], "echo");
        assert_eq!(s["instructions"], "Be bold.");
        assert_eq!(s["modalities"], serde_json::json!(["text", "audio"]));
        assert_eq!(s["input_audio_format"], "pcm16");
        assert_eq!(s["output_audio_format"], "pcm16");
        assert_eq!(s["turn_detection"]["type"], "server_vad");
        assert_eq!(s["turn_detection"]["silence_duration_ms"], 200);
        assert!(update["event_id"].is_string());
    }

    #[tokio::test]
    async fn configure_requires_connection() {
        let mock = Arc::new(MockConnector::new());
        let (session, _rx) = session(mock.clone());
        assert!(!session.configure_session("alloy", "x", "HR").await);
        assert!(!session.send_audio_chunk(&[0, 0]).await);
        assert!(!session.send_text_message("hi", None, false).await);
        assert_eq!(mock.attempts(), 0);
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn text_turn_reconfigures_then_streams_reply() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;

        assert!(session.send_text_message("hello", Some("Engineer"), false).await);
        assert_eq!(session.state(), SessionState::Responding);
        assert!(session.pending().is_processing);

        assert!(mock.wait_for("response.create", 1).await);
        assert_eq!(
            mock.sent_types(),
            vec![
                "session.update",
                "session.update",
                "conversation.item.create",
                "response.create"
            ]
        );
        let update = &mock.sent_of_type("session.update")[1];
        assert_eq!(update["session"]["voice"], "fable");
        let request = &mock.sent_of_type("response.create")[0];
        assert_eq!(request["response"]["instructions"], update["session"]["instructions"]);

        mock.inject(r#"{"type":"response.text.delta","delta":"Hel"}"#).await;
        mock.inject(r#"{"type":"response.text.delta","delta":"lo"}"#).await;
        mock.inject(r#"{"type":"response.text.done","text":"Hello"}"#).await;
        mock.inject(r#"{"type":"response.done","response":{}}"#).await;

        assert_eq!(next(&mut rx).await, SessionEvent::TextDelta("Hel".into()));
        assert_eq!(next(&mut rx).await, SessionEvent::TextDelta("lo".into()));
        assert_eq!(next(&mut rx).await, SessionEvent::TextDone("Hello".into()));
        assert_eq!(next(&mut rx).await, SessionEvent::ResponseDone);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.pending().is_processing);
    }

    #[tokio::test]
    async fn interrupt_drops_audio_and_swallows_cancel_race() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;
        assert!(session.send_text_message("talk", None, false).await);

        mock.inject(r#"{"type":"response.audio.delta","delta":"AQACAA=="}"#).await;
        assert_eq!(
            next(&mut rx).await,
            SessionEvent::AudioDelta(Bytes::from_static(&[1, 0, 2, 0]))
        );

        assert!(session.interrupt_response().await);
        let pending = session.pending();
        assert!(!pending.is_processing && !pending.is_playing && pending.interrupted);
        assert!(mock.wait_for("response.cancel", 1).await);

        mock.inject(r#"{"type":"response.audio.delta","delta":"AQACAA=="}"#).await;
        mock.inject(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"response_cancel_not_active","message":"Cancellation failed: no active response found"}}"#,
        )
        .await;
        mock.inject(r#"{"type":"response.done","response":{}}"#).await;

        // Neither the late audio nor the cancel race reach the listener
        assert_eq!(next(&mut rx).await, SessionEvent::ResponseDone);
        assert_eq!(session.pending(), PendingSnapshot::default());
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn late_audio_of_cancelled_reply_is_dropped_after_resend() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;
        assert!(session.send_text_message("first", None, false).await);
        assert!(session.interrupt_response().await);
        assert!(session.send_text_message("second", None, false).await);
        assert!(mock.wait_for("response.create", 2).await);

        // The first reply was cancelled before its id was seen
        mock.inject(r#"{"type":"response.audio.delta","response_id":"resp_1","delta":"AQACAA=="}"#).await;
        mock.inject(r#"{"type":"response.text.done","response_id":"resp_1","text":"stale"}"#).await;
        mock.inject(r#"{"type":"response.done","response":{"id":"resp_1","status":"cancelled"}}"#).await;
        mock.inject(r#"{"type":"response.created","response":{"id":"resp_2"}}"#).await;
        mock.inject(r#"{"type":"response.audio.delta","response_id":"resp_2","delta":"AwAEAA=="}"#).await;

        assert_eq!(next(&mut rx).await, SessionEvent::ResponseStarted);
        assert_eq!(
            next(&mut rx).await,
            SessionEvent::AudioDelta(Bytes::from_static(&[3, 0, 4, 0]))
        );
        assert!(session.pending().is_processing);
        assert_eq!(session.state(), SessionState::Responding);

        mock.inject(r#"{"type":"response.done","response":{"id":"resp_2"}}"#).await;
        assert_eq!(next(&mut rx).await, SessionEvent::ResponseDone);
        assert!(!session.pending().is_processing);
    }

    #[tokio::test]
    async fn cancel_of_known_response_drops_its_events_by_id() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;
        assert!(session.send_text_message("first", None, false).await);
        mock.inject(r#"{"type":"response.created","response":{"id":"resp_1"}}"#).await;
        assert_eq!(next(&mut rx).await, SessionEvent::ResponseStarted);

        assert!(session.interrupt_response().await);
        assert!(session.send_text_message("second", None, false).await);
        mock.inject(r#"{"type":"response.text.delta","response_id":"resp_1","delta":"old"}"#).await;
        mock.inject(r#"{"type":"response.done","response":{"id":"resp_1","status":"cancelled"}}"#).await;
        mock.inject(r#"{"type":"response.text.delta","response_id":"resp_2","delta":"new"}"#).await;

        assert_eq!(next(&mut rx).await, SessionEvent::ResponseStarted);
        assert_eq!(next(&mut rx).await, SessionEvent::TextDelta("new".into()));
        assert!(session.pending().is_processing);
    }

    #[tokio::test]
    async fn recoverable_error_keeps_session() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;
        assert!(session.commit_audio_buffer().await);
        assert_eq!(session.state(), SessionState::Responding);

        mock.inject(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"input_audio_buffer_commit_empty","message":"buffer too small"}}"#,
        )
        .await;
        match next(&mut rx).await {
            SessionEvent::Error(e) => {
                assert!(e.is_recoverable());
                assert_eq!(e.to_string(), "buffer too small");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.pending().is_processing);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn fatal_error_disconnects() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;

        mock.inject(r#"{"type":"error","error":{"type":"server_error","message":"internal"}}"#)
            .await;
        assert_eq!(
            next(&mut rx).await,
            SessionEvent::Error(SessionError::Protocol {
                message: "internal".into(),
                recoverable: false
            })
        );
        wait_state(&session, SessionState::Disconnected).await;
        assert!(!session.is_connected());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_close_reports_connection_closed() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;

        mock.drop_connection().await;
        assert_eq!(next(&mut rx).await, SessionEvent::Error(SessionError::ConnectionClosed));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.send_audio_chunk(&[1, 0]).await);
    }

    #[tokio::test]
    async fn malformed_message_is_recoverable() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;

        mock.inject("{not json").await;
        match next(&mut rx).await {
            SessionEvent::Error(SessionError::Protocol { recoverable, .. }) => assert!(recoverable),
            other => panic!("unexpected {:?}", other),
        }

        mock.inject(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).await;
        mock.inject(r#"{"type":"session.created","session":{"id":"sess_42"}}"#).await;
        assert_eq!(next(&mut rx).await, SessionEvent::SessionCreated(Some("sess_42".into())));
        assert_eq!(session.session_id().as_deref(), Some("sess_42"));
    }

    #[tokio::test]
    async fn speech_events_move_between_idle_and_listening() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;

        mock.inject(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":0}"#).await;
        assert_eq!(next(&mut rx).await, SessionEvent::SpeechStarted);
        assert_eq!(session.state(), SessionState::Listening);

        mock.inject(r#"{"type":"input_audio_buffer.speech_stopped","audio_end_ms":900}"#).await;
        assert_eq!(next(&mut rx).await, SessionEvent::SpeechStopped);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn audio_chunk_is_base64_appended() {
        let mock = Arc::new(MockConnector::new());
        let (session, _rx) = configured(&mock).await;
        assert!(session.send_audio_chunk(&[0xff, 0x7f]).await);
        assert!(mock.wait_for("input_audio_buffer.append", 1).await);
        let append: &Value = &mock.sent_of_type("input_audio_buffer.append")[0];
        assert_eq!(append["audio"], "/38=");
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_silent() {
        let mock = Arc::new(MockConnector::new());
        let (session, mut rx) = configured(&mock).await;

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        assert!(session.connect().await);
        assert_eq!(mock.attempts(), 2);
    }

    #[tokio::test]
    async fn unknown_persona_uses_default_profile() {
        let mock = Arc::new(MockConnector::new());
        let (session, _rx) = session(mock);
        let profile = session.voice_profile("Janitor");
        assert_eq!(profile.persona_id, "HR");
        assert_eq!(profile.voice, "alloy");

        session.set_voice_profile(VoiceProfile::new("Janitor", "shimmer", "Sweep.", None));
        assert_eq!(session.voice_profile("Janitor").voice, "shimmer");
    }
}
