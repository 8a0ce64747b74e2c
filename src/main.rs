mod audio;
mod config;
mod controller;
mod error;
mod net_link;
mod persona;
mod protocol;
mod session;
mod state_machine;
mod ui_bridge;
mod utterance;

use audio::AudioSystem;
use config::Config;
use controller::DialogueController;
use net_link::WsConnector;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use ui_bridge::{UiBridge, UiEvent};

const HELP: &str = "\
Type a message and press Enter to talk. Commands:
  /voice              toggle voice mode
  /interrupt          stop the current reply
  /persona <id>       talk to another persona
  /preview <id>       hear a persona's voice
  /personas           list personas
  /setvoice <id> <v>  change a persona's voice
  /status             show session and audio state
  /volume <in> <out>  set input/output volume (0.0 - 1.0)
  /quit               leave";

/// Front-end command parsed from one input line.
#[derive(Debug, PartialEq)]
enum Command {
    Say(String),
    ToggleVoice,
    Interrupt,
    Persona(String),
    Preview(String),
    Personas,
    SetVoice(String, String),
    Status,
    Volume(Option<f32>, Option<f32>),
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Say(line.to_string()));
    };
    let mut parts = rest.split_whitespace();
    let cmd = match parts.next().unwrap_or("") {
        "voice" | "v" => Command::ToggleVoice,
        "interrupt" | "i" => Command::Interrupt,
        "persona" | "p" => match parts.next() {
            Some(id) => Command::Persona(id.to_string()),
            None => Command::Unknown(line.to_string()),
        },
        "preview" => match parts.next() {
            Some(id) => Command::Preview(id.to_string()),
            None => Command::Unknown(line.to_string()),
        },
        "personas" => Command::Personas,
        "setvoice" => match (parts.next(), parts.next()) {
            (Some(id), Some(voice)) => Command::SetVoice(id.to_string(), voice.to_string()),
            _ => Command::Unknown(line.to_string()),
        },
        "status" | "s" => Command::Status,
        "volume" => {
            let input = parts.next().and_then(|v| v.parse().ok());
            let output = parts.next().and_then(|v| v.parse().ok());
            Command::Volume(input, output)
        }
        "help" | "h" => Command::Help,
        "quit" | "q" | "exit" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    };
    Some(cmd)
}

fn render(event: UiEvent, persona: &str) {
    match event {
        UiEvent::Text { text, complete: false } => {
            print!("\r{}: {}", persona, text);
            let _ = std::io::stdout().flush();
        }
        UiEvent::Text { text, complete: true } => println!("\r{}: {}", persona, text),
        UiEvent::Error(message) => println!("[error] {}", message),
        UiEvent::Status(message) => println!("[{}]", message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 先加载 .env，再初始化日志，RUST_LOG 也可以写在 .env 里
    dotenvy::dotenv().ok();
    env_logger::init();

    // 加载配置
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    config.load_api_key().map_err(anyhow::Error::msg)?;
    log::info!("{} v{} starting", config.app_name, config.app_version);

    // 创建通道，对话核心通过它把文本和状态推给终端
    let (tx_ui, mut rx_ui) = mpsc::channel::<UiEvent>(100);

    let audio = Arc::new(AudioSystem::alsa(config.audio.clone()));
    let connector = Arc::new(WsConnector::new(config.network.clone()));
    let controller = DialogueController::new(&config, audio, connector, UiBridge::new(tx_ui));

    // 后台建立会话，不阻塞输入
    {
        let controller = controller.clone();
        let persona = config.dialogue.default_persona.clone();
        tokio::spawn(async move {
            controller.start_conversation(&persona).await;
        });
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(event) = rx_ui.recv() => render(event, &controller.current_persona()),

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                let Some(command) = parse_command(&line) else {
                    continue;
                };

                // 命令放到独立任务里执行，主循环继续渲染事件
                let controller = controller.clone();
                match command {
                    Command::Quit => break,
                    Command::Help => println!("{}", HELP),
                    Command::Unknown(text) => println!("Unknown command: {} (try /help)", text),
                    Command::Status => println!("{}", controller.status()),
                    Command::Personas => println!("Personas: {}", controller.persona_ids().join(", ")),
                    Command::SetVoice(id, voice) => {
                        if controller.set_persona_voice(&id, &voice) {
                            println!("[{} now speaks as {}]", id, voice);
                        } else {
                            println!("Unknown persona: {}", id);
                        }
                    }
                    Command::Volume(input, output) => {
                        controller.set_volumes(input, output);
                        println!("[volume updated]");
                    }
                    Command::Say(text) => {
                        tokio::spawn(async move {
                            controller.send_text_message(&text).await;
                        });
                    }
                    Command::ToggleVoice => {
                        tokio::spawn(async move {
                            let on = controller.toggle_voice_mode().await;
                            log::info!("Voice mode toggled to: {}", if on { "ON" } else { "OFF" });
                        });
                    }
                    Command::Interrupt => {
                        tokio::spawn(async move {
                            controller.interrupt().await;
                        });
                    }
                    Command::Persona(id) => {
                        tokio::spawn(async move {
                            controller.interrupt().await;
                            controller.start_conversation(&id).await;
                        });
                    }
                    Command::Preview(id) => {
                        tokio::spawn(async move {
                            controller.preview_voice(&id).await;
                        });
                    }
                }
            }
        }
    }

    controller.end_conversation().await;
    Ok(())
}
