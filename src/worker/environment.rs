//! Sanitised build environment.
//!
//! Task children must not inherit the runtime-manager and
//! dependency-manager variables of the worker process itself. The guard
//! snapshots the whole environment, scrubs the known offenders, and
//! restores the exact prior state when dropped, so the invariant holds
//! even when the guarded block panics.

use std::collections::HashMap;
use std::ffi::OsString;

const SCRUBBED_EXACT: &[&str] = &["GEM_PATH", "GEM_HOME", "RUBYOPT", "RUBYLIB", "RAILS_ENV"];
const SCRUBBED_SUFFIXES: &[&str] = &["_VERSION", "_DIR"];
const SCRUBBED_PREFIXES: &[&str] = &["BUNDLE_"];

fn is_scrubbed(name: &str) -> bool {
    SCRUBBED_EXACT.contains(&name)
        || SCRUBBED_SUFFIXES.iter().any(|s| name.ends_with(s))
        || SCRUBBED_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub struct EnvironmentGuard {
    saved: HashMap<OsString, OsString>,
}

impl EnvironmentGuard {
    /// Scrub the process environment, remembering everything needed to
    /// put it back.
    pub fn sanitize() -> Self {
        let saved: HashMap<OsString, OsString> = std::env::vars_os().collect();

        for (name, _) in &saved {
            if let Some(name_str) = name.to_str() {
                if is_scrubbed(name_str) {
                    std::env::remove_var(name);
                }
            }
        }

        // Strip rbenv shim directories from PATH.
        if let (Ok(rbenv_root), Ok(path)) = (std::env::var("RBENV_ROOT"), std::env::var("PATH")) {
            let versions_prefix = format!("{}/versions/", rbenv_root.trim_end_matches('/'));
            let stripped: Vec<&str> = path
                .split(':')
                .filter(|entry| !entry.starts_with(&versions_prefix))
                .collect();
            std::env::set_var("PATH", stripped.join(":"));
        }

        Self { saved }
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        let current: Vec<OsString> = std::env::vars_os().map(|(name, _)| name).collect();
        for name in current {
            if !self.saved.contains_key(&name) {
                std::env::remove_var(&name);
            }
        }
        for (name, value) in &self.saved {
            std::env::set_var(name, value);
        }
    }
}

/// Run `f` with the sanitised environment; the prior environment is
/// restored on exit regardless of the block's outcome.
pub fn with_environment<T>(f: impl FnOnce() -> T) -> T {
    let _guard = EnvironmentGuard::sanitize();
    f()
}
