//! Chat room adapter: one configured room, token-authenticated HTTP API.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{PoolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatColor {
    Red,
    Green,
}

impl ChatColor {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatColor::Red => "red",
            ChatColor::Green => "green",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatNotification {
    pub message: String,
    pub color: String,
    pub notify: bool,
    pub message_format: String,
}

impl ChatNotification {
    pub fn new(message: impl Into<String>, color: ChatColor) -> Self {
        Self {
            message: message.into(),
            color: color.as_str().to_string(),
            notify: true,
            message_format: "text".to_string(),
        }
    }
}

/// Room notification line for a finished bucket.
pub fn bucket_message(
    project: &str,
    bucket: &str,
    repaired: bool,
    gui_url: &str,
    cc: Option<&str>,
) -> String {
    let verdict = if repaired { "repaired" } else { "failed" };
    let cc = cc.map(|user| format!(" /cc @{user}")).unwrap_or_default();
    format!("[{project}] {bucket} {verdict} - {gui_url}{cc}")
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post(&self, notification: &ChatNotification) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ChatRoomConfig {
    pub api_base: String,
    pub room_id: String,
    pub token: String,
}

/// Posts notifications to the configured room over HTTP.
pub struct HttpChatRoom {
    http: reqwest::Client,
    config: ChatRoomConfig,
}

impl HttpChatRoom {
    pub fn new(config: ChatRoomConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpChatRoom {
    async fn post(&self, notification: &ChatNotification) -> Result<()> {
        let url = format!(
            "{}/room/{}/notification?auth_token={}",
            self.config.api_base, self.config.room_id, self.config.token
        );
        let response = self.http.post(&url).json(notification).send().await?;
        if !response.status().is_success() {
            return Err(PoolError::Notify(format!(
                "chat API returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
