//! Proxy supervisor.
//!
//! haproxy itself is a black box invoked as a child process. Robin never
//! terminates traffic itself. This module validates a candidate
//! configuration, atomically moves it into place, and launches the proxy
//! with the previous PID so it can perform socket handoff and drain the
//! old process: spawn a task, await completion, log the outcome.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Drives one external proxy binary against one canonical config path.
/// Holds the current child's PID so the next reload can pass `-sf <pid>`
/// for graceful handoff.
pub struct ProxySupervisor {
    binary: PathBuf,
    config_path: PathBuf,
    current_pid: Arc<AtomicU32>,
}

impl ProxySupervisor {
    pub fn new(binary: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            current_pid: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The PID of the currently running proxy, if any has been launched.
    pub fn current_pid(&self) -> Option<u32> {
        match self.current_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// `proxy -c -f <tmp>`. A non-zero exit is a validation
    /// failure; the caller must abort the apply and keep the previous
    /// proxy running.
    async fn validate(&self, candidate: &std::path::Path) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("-c")
            .arg("-f")
            .arg(candidate)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::ValidationFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }

    /// Writes `config` to a temp file next to the canonical path, validates
    /// it, and only on success moves it into place (overwrite, 0664)
    /// and launches the proxy with `-sf <oldPid>` if one was already
    /// running. On validation failure the previous
    /// proxy and config are left untouched and the tool's stderr is
    /// returned for the caller to log.
    pub async fn apply(&self, config: &str) -> Result<()> {
        let tmp_path = self.config_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, config).await?;

        if let Err(err) = self.validate(&tmp_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o664)).await?;
        tokio::fs::rename(&tmp_path, &self.config_path).await?;

        self.reload().await
    }

    /// `proxy -f <path> [-sf <oldPid>]`. The new proxy binds the sockets,
    /// signals the old one to stop accepting, and the old one drains; on
    /// spawn failure the previous PID is retained.
    async fn reload(&self) -> Result<()> {
        let old_pid = self.current_pid();

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f").arg(&self.config_path);
        if let Some(pid) = old_pid {
            cmd.arg("-sf").arg(pid.to_string());
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                // Parent-death notification: if the supervisor dies, haproxy
                // receives SIGTERM instead of being orphaned.
                let _ = nix::sys::prctl::set_pdeathsig(Some(nix::sys::signal::Signal::SIGTERM));
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .expect("child pid is available immediately after a successful spawn");

        self.current_pid.store(pid, Ordering::SeqCst);
        info!(pid, ?old_pid, "reloaded haproxy with graceful handoff");

        self.spawn_reaper(child, pid);
        Ok(())
    }

    /// Awaits the child's exit in its own task and logs the outcome,
    /// clearing `current_pid` only if no later reload has already replaced
    /// it.
    fn spawn_reaper(&self, mut child: Child, pid: u32) {
        let current_pid = self.current_pid.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!(pid, "haproxy process exited"),
                Ok(status) => warn!(pid, %status, "haproxy process exited with non-zero status"),
                Err(err) => error!(pid, %err, "failed to wait on haproxy child"),
            }
            let _ = current_pid.compare_exchange(pid, 0, Ordering::SeqCst, Ordering::SeqCst);
        });
    }
}
