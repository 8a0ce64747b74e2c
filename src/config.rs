use std::time::Duration;

use crate::persona::{self, VoiceProfile};

/// 网络配置
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub ws_url: &'static str,
    pub model: &'static str,
    /// 运行时从环境变量读取，不写进编译产物
    pub api_key: String,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
}

impl NetworkConfig {
    /// Full endpoint including the model query parameter.
    pub fn endpoint(&self) -> String {
        format!("{}?model={}", self.ws_url, self.model)
    }
}

/// 音频配置
#[derive(Debug, Clone)]
pub struct AudioSettings {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// Samples per capture/playback window
    pub frame_size: usize,
    /// Normalised RMS above which a frame counts as speech
    pub vad_threshold: f32,
    /// How long after the last loud frame speech is still considered active
    pub silence_duration: Duration,
    /// Input queue depth in frames; the oldest frame is dropped beyond this
    pub input_queue_frames: usize,
    /// Upper bound for joining an audio thread on stop
    pub shutdown_timeout: Duration,
}

/// 会话配置 (session.update parameters)
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub transcription_model: &'static str,
    pub turn_threshold: f32,
    pub prefix_padding_ms: u32,
    pub turn_silence_duration_ms: u32,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// 对话配置
#[derive(Debug, Clone)]
pub struct DialogueSettings {
    pub default_persona: String,
    pub min_commit: Duration,
    /// Bounded wait for a reconnect when voice mode is switched on
    pub reconnect_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub network: NetworkConfig,
    pub audio: AudioSettings,
    pub session: SessionSettings,
    pub dialogue: DialogueSettings,
    pub personas: Vec<VoiceProfile>,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            network: NetworkConfig {
                ws_url: env!("WS_URL"),
                model: env!("WS_MODEL"),
                api_key: String::new(),
                connect_attempts: env!("CONNECT_ATTEMPTS").parse()
                    .map_err(|_| "Failed to parse CONNECT_ATTEMPTS")?,
                connect_retry_delay: Duration::from_millis(
                    env!("CONNECT_RETRY_DELAY_MS").parse()
                        .map_err(|_| "Failed to parse CONNECT_RETRY_DELAY_MS")?,
                ),
            },

            audio: AudioSettings {
                capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
                playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
                sample_rate: env!("AUDIO_SAMPLE_RATE").parse()
                    .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
                channels: env!("AUDIO_CHANNELS").parse()
                    .map_err(|_| "Failed to parse AUDIO_CHANNELS")?,
                frame_size: env!("AUDIO_FRAME_SIZE").parse()
                    .map_err(|_| "Failed to parse AUDIO_FRAME_SIZE")?,
                vad_threshold: env!("AUDIO_VAD_THRESHOLD").parse()
                    .map_err(|_| "Failed to parse AUDIO_VAD_THRESHOLD")?,
                silence_duration: Duration::from_millis(
                    env!("AUDIO_SILENCE_DURATION_MS").parse()
                        .map_err(|_| "Failed to parse AUDIO_SILENCE_DURATION_MS")?,
                ),
                input_queue_frames: env!("AUDIO_INPUT_QUEUE_FRAMES").parse()
                    .map_err(|_| "Failed to parse AUDIO_INPUT_QUEUE_FRAMES")?,
                shutdown_timeout: Duration::from_millis(
                    env!("AUDIO_SHUTDOWN_TIMEOUT_MS").parse()
                        .map_err(|_| "Failed to parse AUDIO_SHUTDOWN_TIMEOUT_MS")?,
                ),
            },

            session: SessionSettings {
                transcription_model: env!("SESSION_TRANSCRIPTION_MODEL"),
                turn_threshold: env!("SESSION_TURN_THRESHOLD").parse()
                    .map_err(|_| "Failed to parse SESSION_TURN_THRESHOLD")?,
                prefix_padding_ms: env!("SESSION_PREFIX_PADDING_MS").parse()
                    .map_err(|_| "Failed to parse SESSION_PREFIX_PADDING_MS")?,
                turn_silence_duration_ms: env!("SESSION_TURN_SILENCE_MS").parse()
                    .map_err(|_| "Failed to parse SESSION_TURN_SILENCE_MS")?,
                temperature: env!("SESSION_TEMPERATURE").parse()
                    .map_err(|_| "Failed to parse SESSION_TEMPERATURE")?,
                max_output_tokens: env!("SESSION_MAX_OUTPUT_TOKENS").parse()
                    .map_err(|_| "Failed to parse SESSION_MAX_OUTPUT_TOKENS")?,
            },

            dialogue: DialogueSettings {
                default_persona: env!("DIALOGUE_DEFAULT_PERSONA").to_string(),
                min_commit: Duration::from_millis(
                    env!("DIALOGUE_MIN_COMMIT_MS").parse()
                        .map_err(|_| "Failed to parse DIALOGUE_MIN_COMMIT_MS")?,
                ),
                reconnect_wait: Duration::from_millis(
                    env!("DIALOGUE_RECONNECT_WAIT_MS").parse()
                        .map_err(|_| "Failed to parse DIALOGUE_RECONNECT_WAIT_MS")?,
                ),
            },

            personas: persona::default_profiles(),
        })
    }

    /// 读取 API 密钥，OPENAI_REALTIME_API_KEY 优先，回退到 OPENAI_API_KEY
    pub fn load_api_key(&mut self) -> Result<(), &'static str> {
        let key = std::env::var("OPENAI_REALTIME_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| "OPENAI_API_KEY is required. Please set it in your environment or .env file")?;
        if key.trim().is_empty() {
            return Err("OPENAI_API_KEY is empty");
        }
        self.network.api_key = key;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_values_parse() {
        let config = Config::new().unwrap();
        assert_eq!(config.audio.sample_rate, 24000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.audio.frame_size, 1024);
        assert_eq!(config.dialogue.min_commit, Duration::from_millis(500));
        assert_eq!(config.network.connect_attempts, 3);
        assert!(config.network.api_key.is_empty());
    }

    #[test]
    fn endpoint_carries_model() {
        let config = Config::new().unwrap();
        let endpoint = config.network.endpoint();
        assert!(endpoint.starts_with(config.network.ws_url));
        assert!(endpoint.ends_with(&format!("?model={}", config.network.model)));
    }

    #[test]
    fn default_persona_is_registered() {
        let config = Config::new().unwrap();
        assert!(config
            .personas
            .iter()
            .any(|p| p.persona_id == config.dialogue.default_persona));
    }
}
