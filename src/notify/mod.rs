//! Outbound notifications for finished buckets and operator reports.
//!
//! The [`Notifier`] decides what to send; actual delivery goes through
//! the mail and chat transport seams. Either channel may be absent, in
//! which case the corresponding notification is skipped silently.

pub mod chat;
pub mod mail;

use std::sync::Arc;

pub use chat::{
    bucket_message, ChatColor, ChatNotification, ChatRoomConfig, ChatTransport, HttpChatRoom,
};
pub use mail::{MailMessage, MailTransport, Mailer, SendmailTransport};

use crate::error::Result;
use crate::store::{Bucket, Build, Project};

pub struct Notifier {
    mailer: Option<Mailer>,
    chat: Option<Arc<dyn ChatTransport>>,
    gui_base_url: String,
}

impl Notifier {
    pub fn new(
        mailer: Option<Mailer>,
        chat: Option<Arc<dyn ChatTransport>>,
        gui_base_url: &str,
    ) -> Self {
        Self {
            mailer,
            chat,
            gui_base_url: gui_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Notifier with no channels configured; everything is a no-op.
    pub fn disabled() -> Self {
        Self::new(None, None, "")
    }

    fn gui_url(&self, project: &Project) -> String {
        format!("{}/projects/{}", self.gui_base_url, project.name)
    }

    pub async fn bucket_failed(
        &self,
        project: &Project,
        build: &Build,
        bucket: &Bucket,
    ) -> Result<()> {
        if let (Some(mailer), Some(to)) = (&self.mailer, project.plan.notify_email.as_deref()) {
            mailer
                .send(mailer.failure_message(project, build, bucket, to))
                .await?;
        }
        if let Some(chat) = &self.chat {
            let message = bucket_message(
                &project.name,
                &bucket.name,
                false,
                &self.gui_url(project),
                project.plan.chat_cc.as_deref(),
            );
            chat.post(&ChatNotification::new(message, ChatColor::Red))
                .await?;
        }
        Ok(())
    }

    pub async fn bucket_repaired(
        &self,
        project: &Project,
        build: &Build,
        bucket: &Bucket,
    ) -> Result<()> {
        if let (Some(mailer), Some(to)) = (&self.mailer, project.plan.notify_email.as_deref()) {
            mailer
                .send(mailer.fixed_message(project, build, bucket, to))
                .await?;
        }
        if let Some(chat) = &self.chat {
            let message = bucket_message(
                &project.name,
                &bucket.name,
                true,
                &self.gui_url(project),
                project.plan.chat_cc.as_deref(),
            );
            chat.post(&ChatNotification::new(message, ChatColor::Green))
                .await?;
        }
        Ok(())
    }

    pub async fn operator(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        if let Some(mailer) = &self.mailer {
            mailer
                .send(mailer.operator_message(to, subject, body))
                .await?;
        }
        Ok(())
    }
}
