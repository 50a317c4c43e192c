//! Remote image copy.
//!
//! [`RsyncTransfer`] shells out to `rsync` over ssh and reports a structured
//! [`TransferOutcome`] instead of discarding the exit status.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::{Result, SyncError};

/// Copy `source` on `host` to the local `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub user: String,
    pub host: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl TransferRequest {
    /// `user@host:/path` as understood by rsync.
    pub fn remote_spec(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.source.display())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub success: bool,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl TransferOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Turn a failed outcome into an error so it can be retried.
    pub fn into_result(self) -> Result<()> {
        if self.success {
            return Ok(());
        }
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(SyncError::Transfer(format!(
            "exit status {code}: {}",
            self.stderr.trim()
        )))
    }
}

#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Run one transfer to completion. `Err` means the transfer could not be
    /// started at all; a finished-but-failed transfer is an `Ok` outcome with
    /// `success == false`.
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome>;
}

/// `rsync -a -e 'ssh -o StrictHostKeyChecking=no' user@host:src dest`
#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    program: String,
    ssh_command: String,
}

impl RsyncTransfer {
    pub fn new() -> Self {
        Self {
            program: "rsync".to_string(),
            ssh_command: "ssh -o StrictHostKeyChecking=no".to_string(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn build_command(&self, request: &TransferRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-a")
            .arg("-e")
            .arg(&self.ssh_command)
            .arg(request.remote_spec())
            .arg(&request.destination);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl Default for RsyncTransfer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileTransfer for RsyncTransfer {
    #[instrument(skip(self), fields(source = %request.remote_spec(), dest = %request.destination.display()))]
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        debug!("spawning {}", self.program);

        let output = self
            .build_command(request)
            .output()
            .await
            .map_err(|e| SyncError::Transfer(format!("failed to spawn {}: {e}", self.program)))?;

        if output.status.success() {
            debug!("{} succeeded", self.program);
            return Ok(TransferOutcome::succeeded());
        }

        Ok(TransferOutcome::failed(
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}
