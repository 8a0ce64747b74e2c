use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    audio: Audio,
    session: Session,
    dialogue: Dialogue,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    model: String,
    connect_attempts: u32,
    connect_retry_delay_ms: u64,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    channels: u32,
    frame_size: usize,
    vad_threshold: f32,
    silence_duration_ms: u64,
    input_queue_frames: usize,
    shutdown_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Session {
    transcription_model: String,
    turn_threshold: f32,
    prefix_padding_ms: u32,
    turn_silence_duration_ms: u32,
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct Dialogue {
    default_persona: String,
    min_commit_ms: u64,
    reconnect_wait_ms: u64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_MODEL={}", config.network.model);
    println!("cargo:rustc-env=CONNECT_ATTEMPTS={}", config.network.connect_attempts);
    println!("cargo:rustc-env=CONNECT_RETRY_DELAY_MS={}", config.network.connect_retry_delay_ms);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_FRAME_SIZE={}", config.audio.frame_size);
    println!("cargo:rustc-env=AUDIO_VAD_THRESHOLD={}", config.audio.vad_threshold);
    println!("cargo:rustc-env=AUDIO_SILENCE_DURATION_MS={}", config.audio.silence_duration_ms);
    println!("cargo:rustc-env=AUDIO_INPUT_QUEUE_FRAMES={}", config.audio.input_queue_frames);
    println!("cargo:rustc-env=AUDIO_SHUTDOWN_TIMEOUT_MS={}", config.audio.shutdown_timeout_ms);

    // 会话配置
    println!("cargo:rustc-env=SESSION_TRANSCRIPTION_MODEL={}", config.session.transcription_model);
    println!("cargo:rustc-env=SESSION_TURN_THRESHOLD={}", config.session.turn_threshold);
    println!("cargo:rustc-env=SESSION_PREFIX_PADDING_MS={}", config.session.prefix_padding_ms);
    println!("cargo:rustc-env=SESSION_TURN_SILENCE_MS={}", config.session.turn_silence_duration_ms);
    println!("cargo:rustc-env=SESSION_TEMPERATURE={}", config.session.temperature);
    println!("cargo:rustc-env=SESSION_MAX_OUTPUT_TOKENS={}", config.session.max_output_tokens);

    // 对话配置
    println!("cargo:rustc-env=DIALOGUE_DEFAULT_PERSONA={}", config.dialogue.default_persona);
    println!("cargo:rustc-env=DIALOGUE_MIN_COMMIT_MS={}", config.dialogue.min_commit_ms);
    println!("cargo:rustc-env=DIALOGUE_RECONNECT_WAIT_MS={}", config.dialogue.reconnect_wait_ms);
}
