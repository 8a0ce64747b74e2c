use tokio::sync::mpsc;

/// What the dialogue core tells the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// NPC speech text. `complete` is false for streaming partials, each of
    /// which carries the whole text accumulated so far.
    Text { text: String, complete: bool },
    Error(String),
    Status(String),
}

// 对话核心通过 mpsc 通道把文本、错误和状态推给前端
#[derive(Clone)]
pub struct UiBridge {
    tx: mpsc::Sender<UiEvent>,
}

impl UiBridge {
    pub fn new(tx: mpsc::Sender<UiEvent>) -> Self {
        Self { tx }
    }

    async fn send(&self, event: UiEvent) {
        if let Err(e) = self.tx.send(event).await {
            log::warn!("Failed to send to UI: {}", e);
        }
    }

    pub async fn text(&self, text: impl Into<String>, complete: bool) {
        self.send(UiEvent::Text {
            text: text.into(),
            complete,
        })
        .await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.send(UiEvent::Error(message.into())).await;
    }

    pub async fn status(&self, message: impl Into<String>) {
        self.send(UiEvent::Status(message.into())).await;
    }

    /// For callers off the runtime, like audio threads. The status is
    /// dropped when the front end is not keeping up.
    pub fn try_status(&self, message: impl Into<String>) {
        if let Err(e) = self.tx.try_send(UiEvent::Status(message.into())) {
            log::debug!("UI status dropped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let ui = UiBridge::new(tx);
        ui.status("Connecting").await;
        ui.text("Hel", false).await;
        ui.text("Hello", true).await;
        ui.error("boom").await;

        assert_eq!(rx.recv().await, Some(UiEvent::Status("Connecting".into())));
        assert_eq!(
            rx.recv().await,
            Some(UiEvent::Text { text: "Hel".into(), complete: false })
        );
        assert_eq!(
            rx.recv().await,
            Some(UiEvent::Text { text: "Hello".into(), complete: true })
        );
        assert_eq!(rx.recv().await, Some(UiEvent::Error("boom".into())));
    }

    #[tokio::test]
    async fn closed_ui_is_not_fatal() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let ui = UiBridge::new(tx);
        ui.text("nobody listening", true).await;
        ui.status("still fine").await;
    }

    #[tokio::test]
    async fn try_status_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let ui = UiBridge::new(tx);
        ui.try_status("Hearing you...");
        ui.try_status("lost");
        assert_eq!(rx.recv().await, Some(UiEvent::Status("Hearing you...".into())));
        assert!(rx.try_recv().is_err());

        drop(rx);
        ui.try_status("nobody listening");
    }
}
