//! Mail adapter. Message composition lives in [`Mailer`]; delivery goes
//! through the [`MailTransport`] seam so tests can record instead of send.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{PoolError, Result};
use crate::store::{Bucket, Build, Project};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: &MailMessage) -> Result<()>;
}

/// Pipes RFC 822 messages into a local sendmail binary.
pub struct SendmailTransport {
    command: String,
}

impl SendmailTransport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for SendmailTransport {
    fn default() -> Self {
        Self::new("/usr/sbin/sendmail")
    }
}

#[async_trait]
impl MailTransport for SendmailTransport {
    async fn deliver(&self, message: &MailMessage) -> Result<()> {
        let mut child = Command::new(&self.command)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let rfc822 = format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}",
            message.from, message.to, message.subject, message.body
        );
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(rfc822.as_bytes()).await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(PoolError::Notify(format!(
                "sendmail exited with {status}"
            )));
        }
        Ok(())
    }
}

pub struct Mailer {
    transport: Arc<dyn MailTransport>,
    from: String,
}

impl Mailer {
    pub fn new(transport: Arc<dyn MailTransport>, from: &str) -> Self {
        Self {
            transport,
            from: from.to_string(),
        }
    }

    pub fn failure_message(
        &self,
        project: &Project,
        build: &Build,
        bucket: &Bucket,
        to: &str,
    ) -> MailMessage {
        let error = bucket
            .error_log
            .as_deref()
            .or(bucket.log.as_deref())
            .unwrap_or("(no output captured)");
        MailMessage {
            to: to.to_string(),
            from: self.from.clone(),
            subject: format!(
                "[{}] {} failed in build {}",
                project.name, bucket.name, build.number
            ),
            body: format!(
                "Commit {} broke bucket {} of {}.\n\n{}",
                build.commit, bucket.name, project.name, error
            ),
        }
    }

    pub fn fixed_message(
        &self,
        project: &Project,
        build: &Build,
        bucket: &Bucket,
        to: &str,
    ) -> MailMessage {
        MailMessage {
            to: to.to_string(),
            from: self.from.clone(),
            subject: format!(
                "[{}] {} repaired in build {}",
                project.name, bucket.name, build.number
            ),
            body: format!(
                "Commit {} repaired bucket {} of {}.\n",
                build.commit, bucket.name, project.name
            ),
        }
    }

    pub fn operator_message(&self, to: &str, subject: &str, body: &str) -> MailMessage {
        MailMessage {
            to: to.to_string(),
            from: self.from.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }

    pub async fn send(&self, message: MailMessage) -> Result<()> {
        tracing::info!(to = %message.to, subject = %message.subject, "Sending mail");
        self.transport.deliver(&message).await
    }
}
