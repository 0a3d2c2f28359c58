//! Working-copy synchronisation ahead of bucket execution.
//!
//! The executor only depends on the [`SourceSync`] contract: after a
//! successful `sync`, the working directory holds a pristine checkout of
//! the requested commit. The git implementation shells out to the CLI and
//! force-resets when the current commit differs.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{PoolError, Result};

#[async_trait]
pub trait SourceSync: Send + Sync {
    async fn sync(&self, url: &str, dir: &Path, commit: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct GitSync;

impl GitSync {
    pub fn new() -> Self {
        Self
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(PoolError::SourceSync(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceSync for GitSync {
    async fn sync(&self, url: &str, dir: &Path, commit: &str) -> Result<()> {
        if !dir.join(".git").exists() {
            if let Some(parent) = dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let dir_str = dir.to_string_lossy().to_string();
            self.git(Path::new("."), &["clone", url, &dir_str]).await?;
        }

        let current = self.git(dir, &["rev-parse", "HEAD"]).await?;
        if current == commit {
            return Ok(());
        }

        self.git(dir, &["fetch", "origin"]).await?;
        self.git(dir, &["checkout", "-f", commit]).await?;
        self.git(dir, &["clean", "-d", "-f", "-x"]).await?;
        Ok(())
    }
}
