//! In-app console channel.
//!
//! Messages are published on a broadcast channel; the websocket surface
//! subscribes and forwards them to connected browsers.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::{Capabilities, ChannelDriver, SendParams, WEBCONSOLE};
use crate::Result;
use crate::database::models::NotificationPriority;
use crate::database::time::now_ms;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InAppMessage {
    pub receiver_id: String,
    pub title: String,
    pub content: String,
    pub topic: String,
    pub priority: NotificationPriority,
    pub created_at: i64,
}

pub struct WebconsoleDriver {
    sender: broadcast::Sender<InAppMessage>,
}

impl WebconsoleDriver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InAppMessage> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl ChannelDriver for WebconsoleDriver {
    fn channel_type(&self) -> &'static str {
        WEBCONSOLE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            is_personal: true,
            is_system_config: true,
            ..Default::default()
        }
    }

    async fn send(&self, params: &SendParams) -> Result<()> {
        let recipient = params.single()?;
        let message = InAppMessage {
            receiver_id: recipient.contact.clone(),
            title: params.title.clone(),
            content: params.message.clone(),
            topic: params.topic.clone(),
            priority: params.priority,
            created_at: now_ms(),
        };
        // Nobody listening is not a delivery failure; the row is the record.
        if self.sender.send(message).is_err() {
            trace!(receiver_id = %recipient.contact, "No in-app subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Recipient;
    use super::*;

    #[tokio::test]
    async fn test_send_broadcasts() {
        let driver = WebconsoleDriver::new(8);
        let mut rx = driver.subscribe();
        let params = SendParams {
            receivers: vec![Recipient::new("u1", "D1")],
            title: "T".to_string(),
            message: "hello".to_string(),
            ..Default::default()
        };
        driver.send(&params).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.receiver_id, "u1");
        assert_eq!(msg.content, "hello");
    }

    #[tokio::test]
    async fn test_send_without_subscribers_succeeds() {
        let driver = WebconsoleDriver::new(8);
        let params = SendParams {
            receivers: vec![Recipient::new("u1", "D1")],
            ..Default::default()
        };
        assert!(driver.send(&params).await.is_ok());
    }
}
