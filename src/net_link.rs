use crate::config::NetworkConfig;
use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

#[derive(Debug)]
pub enum NetEvent {
    Text(String),
    /// Transport is gone. Carries the peer's reason when it sent one.
    Closed(Option<String>),
}

#[derive(Debug)]
pub enum NetCommand {
    SendText(String),
    Close,
}

/// One live connection: commands in, events out.
pub struct Link {
    pub tx: mpsc::Sender<NetCommand>,
    pub rx: mpsc::Receiver<NetEvent>,
}

/// Opens transport connections. One call = one connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> anyhow::Result<Link>;
}

pub struct WsConnector {
    config: NetworkConfig,
}

impl WsConnector {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    // 根据配置构建WebSocket请求
    fn request(&self) -> anyhow::Result<tokio_tungstenite::tungstenite::http::Request<()>> {
        let endpoint = self.config.endpoint();
        let url = Url::parse(&endpoint).context("Invalid realtime endpoint")?;
        let host = url.host_str().context("Realtime endpoint has no host")?;

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(endpoint.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .body(())?;
        Ok(request)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> anyhow::Result<Link> {
        let request = self.request()?;

        log::info!("Connecting to {}...", self.config.endpoint());
        let (ws_stream, _) = connect_async(request).await?;
        log::info!("Connected!");

        let (tx_event, rx_event) = mpsc::channel::<NetEvent>(100);
        let (tx_cmd, rx_cmd) = mpsc::channel::<NetCommand>(100);
        tokio::spawn(pump(ws_stream, tx_event, rx_cmd));

        Ok(Link {
            tx: tx_cmd,
            rx: rx_event,
        })
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

// 主循环，处理读取和写入；结束时总会发出一个 Closed 事件
async fn pump(ws_stream: WsStream, tx: mpsc::Sender<NetEvent>, mut rx_cmd: mpsc::Receiver<NetCommand>) {
    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        log::debug!("Received Text: {} bytes", text.len());
                        if tx.send(NetEvent::Text(text.to_string())).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring binary frame of {} bytes", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        break frame.map(|f| f.reason.as_str().to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("WebSocket read error: {}", e);
                        break Some(e.to_string());
                    }
                    None => break Some("stream ended".to_string()),
                }
            }
            cmd = rx_cmd.recv() => {
                match cmd {
                    Some(NetCommand::SendText(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            log::error!("WebSocket write error: {}", e);
                            break Some(e.to_string());
                        }
                    }
                    Some(NetCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break None;
                    }
                }
            }
        }
    };

    let _ = write.close().await;
    let _ = tx.send(NetEvent::Closed(reason)).await;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// In-memory transport. Records every outbound frame and lets the test
    /// push inbound frames into the current connection.
    #[derive(Default)]
    pub struct MockConnector {
        failures_left: AtomicU32,
        attempts: AtomicU32,
        sent: Arc<Mutex<Vec<String>>>,
        inbound: Mutex<Option<mpsc::Sender<NetEvent>>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the first `n` attempts.
        pub fn failing(n: u32) -> Self {
            let mock = Self::default();
            mock.failures_left.store(n, Ordering::SeqCst);
            mock
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_types(&self) -> Vec<String> {
            self.sent()
                .iter()
                .filter_map(|t| crate::protocol::message_type(t))
                .collect()
        }

        pub fn sent_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
            self.sent()
                .iter()
                .filter_map(|t| serde_json::from_str::<serde_json::Value>(t).ok())
                .filter(|v| v["type"] == kind)
                .collect()
        }

        /// Poll until `kind` has been sent `count` times.
        pub async fn wait_for(&self, kind: &str, count: usize) -> bool {
            for _ in 0..400 {
                if self.sent_of_type(kind).len() >= count {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            false
        }

        fn inbound(&self) -> mpsc::Sender<NetEvent> {
            self.inbound
                .lock()
                .unwrap()
                .clone()
                .expect("no open connection")
        }

        pub async fn inject(&self, text: &str) {
            self.inbound()
                .send(NetEvent::Text(text.to_string()))
                .await
                .unwrap();
        }

        /// Simulate the peer dropping the connection.
        pub async fn drop_connection(&self) {
            self.inbound()
                .send(NetEvent::Closed(Some("reset by peer".to_string())))
                .await
                .unwrap();
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(&self) -> anyhow::Result<Link> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("connection refused");
            }

            let (tx_event, rx_event) = mpsc::channel::<NetEvent>(100);
            let (tx_cmd, mut rx_cmd) = mpsc::channel::<NetCommand>(100);
            *self.inbound.lock().unwrap() = Some(tx_event.clone());

            let sent = self.sent.clone();
            tokio::spawn(async move {
                while let Some(cmd) = rx_cmd.recv().await {
                    match cmd {
                        NetCommand::SendText(text) => sent.lock().unwrap().push(text),
                        NetCommand::Close => break,
                    }
                }
                let _ = tx_event.send(NetEvent::Closed(None)).await;
            });

            Ok(Link {
                tx: tx_cmd,
                rx: rx_event,
            })
        }
    }
}
