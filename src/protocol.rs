//! JSON messages exchanged with the realtime voice service.
//!
//! Outbound: session.update, input_audio_buffer.append/commit,
//! conversation.item.create, response.create, response.cancel.
//! Inbound: session.created, response.{text,audio,audio_transcript}.*,
//! input_audio_buffer.speech_started/stopped, response.done, error.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error code the service uses when a cancel arrives after the response
/// already finished.
pub const CANCEL_NOT_ACTIVE_CODE: &str = "response_cancel_not_active";
const CANCEL_NOT_ACTIVE_TEXT: &str = "no active response found";

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: InputAudioTranscription,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl TurnDetection {
    pub fn server_vad(threshold: f32, prefix_padding_ms: u32, silence_duration_ms: u32) -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ConversationItem {
    pub fn user_text(text: &str) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseConfig {
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Messages sent to the service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseConfig },

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

#[derive(Serialize)]
struct Envelope<'a> {
    event_id: String,
    #[serde(flatten)]
    event: &'a ClientEvent,
}

impl ClientEvent {
    pub fn audio_append(pcm: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(pcm),
        }
    }

    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }

    /// Serialize with a fresh `event_id`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            event: self,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// How an inbound `error` event should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Cancel raced with the end of the response. Not an error.
    CancelRace,
    /// The request was rejected but the session is still usable.
    Recoverable,
    Fatal,
}

impl ApiError {
    pub fn classify(&self) -> ErrorClass {
        let cancel_race = match self.code.as_deref() {
            Some(code) => code == CANCEL_NOT_ACTIVE_CODE,
            None => self.message.to_lowercase().contains(CANCEL_NOT_ACTIVE_TEXT),
        };
        if cancel_race {
            ErrorClass::CancelRace
        } else if self.kind == "invalid_request_error" {
            ErrorClass::Recoverable
        } else {
            ErrorClass::Fatal
        }
    }
}

/// Messages received from the service. Kinds this client does not act on
/// decode as `Unknown`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {},

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Response this event belongs to, when the server said.
    pub fn response_id(&self) -> Option<&str> {
        match self {
            ServerEvent::ResponseCreated { response } | ServerEvent::ResponseDone { response } => {
                response.id.as_deref()
            }
            ServerEvent::TextDelta { response_id, .. }
            | ServerEvent::TextDone { response_id, .. }
            | ServerEvent::TranscriptDelta { response_id, .. }
            | ServerEvent::TranscriptDone { response_id, .. }
            | ServerEvent::AudioDelta { response_id, .. } => response_id.as_deref(),
            _ => None,
        }
    }
}

/// `type` field of a raw message, for logging unhandled kinds.
pub fn message_type(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}
