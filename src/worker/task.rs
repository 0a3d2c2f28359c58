//! Runs one task as an isolated child process.
//!
//! The task is spawned as `sh -c <command>` with stdout and stderr teed
//! into a dedicated log file; the child shares no memory or store handles
//! with the worker. While the child runs, the parent tails the file from
//! the last byte offset on every poll, transcodes the bytes and appends
//! them as a log fragment. A child killed by SIGABRT is retried exactly
//! once; the second outcome is final. The log file is removed after reap.

use std::io::SeekFrom;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{Store, Task};

pub const ABORT_RETRY_MARKER: &str = "\n\n------ Task aborted, retrying once ------\n\n";

const ABORT_SIGNAL: i32 = 6;

/// Decode bytes read from the log file as latin-1 and re-encode as UTF-8.
/// Every latin-1 byte maps to a valid scalar value, so nothing is lost
/// and downstream consumers always see well-formed text.
pub fn latin1_to_utf8(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Result of running one task, including the retried attempt if any.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: String,
    pub output: String,
    pub success: bool,
}

#[derive(Debug)]
struct Attempt {
    success: bool,
    aborted: bool,
    output: String,
}

pub struct TaskRunner {
    store: Arc<dyn Store>,
    poll_interval: Duration,
    log_root: PathBuf,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration, log_root: PathBuf) -> Self {
        Self {
            store,
            poll_interval,
            log_root,
        }
    }

    /// Run `task` in `dir`, streaming its output into the bucket's log
    /// fragments. Never propagates a non-zero exit as an error; that is a
    /// normal task failure reported through the outcome.
    pub async fn run(
        &self,
        bucket_id: Uuid,
        task: &Task,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<TaskOutcome> {
        let first = self.attempt(bucket_id, task, dir, env).await?;
        if !first.aborted {
            return Ok(TaskOutcome {
                name: task.name.clone(),
                output: first.output,
                success: first.success,
            });
        }

        tracing::warn!(bucket_id = %bucket_id, task = %task.name, "Task aborted, retrying once");
        self.store
            .append_fragment(bucket_id, ABORT_RETRY_MARKER)
            .await?;
        let second = self.attempt(bucket_id, task, dir, env).await?;
        Ok(TaskOutcome {
            name: task.name.clone(),
            output: format!("{}{}{}", first.output, ABORT_RETRY_MARKER, second.output),
            success: second.success,
        })
    }

    async fn attempt(
        &self,
        bucket_id: Uuid,
        task: &Task,
        dir: &Path,
        env: &[(String, String)],
    ) -> Result<Attempt> {
        let log_path = self.log_root.join(format!("task-{}.log", Uuid::new_v4()));
        let log_file = std::fs::File::create(&log_path)?;
        let stderr_file = log_file.try_clone()?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&task.command)
            .current_dir(dir)
            .envs(env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn()?;

        let mut offset: u64 = 0;
        let mut output = String::new();
        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.drain(bucket_id, &log_path, &mut offset, &mut output).await?;
                }
            }
        };
        // Drain whatever arrived between the last poll and the reap.
        self.drain(bucket_id, &log_path, &mut offset, &mut output)
            .await?;

        if let Err(e) = tokio::fs::remove_file(&log_path).await {
            tracing::warn!(path = %log_path.display(), error = %e, "Could not remove task log file");
        }

        let aborted = status.signal() == Some(ABORT_SIGNAL);
        tracing::debug!(
            bucket_id = %bucket_id,
            task = %task.name,
            code = ?status.code(),
            signal = ?status.signal(),
            "Task reaped"
        );
        Ok(Attempt {
            success: status.success(),
            aborted,
            output,
        })
    }

    /// Tail-read the log file from the last offset. The offset only
    /// advances by the bytes actually read, so nothing is skipped or
    /// duplicated across polls.
    async fn drain(
        &self,
        bucket_id: Uuid,
        path: &Path,
        offset: &mut u64,
        collected: &mut String,
    ) -> Result<()> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(*offset)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        if bytes.is_empty() {
            return Ok(());
        }
        *offset += bytes.len() as u64;

        let text = latin1_to_utf8(&bytes);
        collected.push_str(&text);
        self.store.append_fragment(bucket_id, &text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_high_bytes_become_valid_utf8() {
        // 0xE9 is 'é' in latin-1.
        let decoded = latin1_to_utf8(&[b'c', b'a', b'f', 0xE9, b'\n']);
        assert_eq!(decoded, "café\n");
        assert!(decoded.is_ascii() || decoded.chars().all(|c| c.len_utf8() <= 2));
    }

    #[test]
    fn latin1_is_byte_transparent_for_ascii() {
        let decoded = latin1_to_utf8(b"plain ascii output\n");
        assert_eq!(decoded, "plain ascii output\n");
    }
}
