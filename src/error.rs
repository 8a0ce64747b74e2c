//! Error types surfaced by the audio engine and the realtime session

use thiserror::Error;

/// Audio hardware failures. Reported to the caller, never retried here.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),

    /// Input queue overflowed and the oldest frames were dropped.
    #[error("Audio input backpressure: dropped {dropped} frame(s)")]
    Backpressure { dropped: usize },
}

pub type AudioResult<T> = Result<T, AudioError>;

/// Errors delivered through the session's single error channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Connection failed after {attempts} attempt(s)")]
    ConnectionFailed { attempts: u32 },

    #[error("Failed to send {what}: {reason}")]
    SendFailed { what: &'static str, reason: String },

    #[error("{message}")]
    Protocol { message: String, recoverable: bool },

    #[error("Connection closed")]
    ConnectionClosed,
}

impl SessionError {
    /// Recoverable errors leave voice mode running.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Protocol { recoverable, .. } => *recoverable,
            SessionError::SendFailed { .. } => true,
            SessionError::ConnectionFailed { .. } | SessionError::ConnectionClosed => false,
        }
    }
}
