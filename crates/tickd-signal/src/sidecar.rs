//! Sidecar process runner.
//!
//! Every invocation is `<exe> -a <account> <verb> [args…]`; stdout is the
//! result, a non-zero exit with stderr content is a transport error. The
//! sidecar returns promptly when it has nothing to deliver, so no explicit
//! timeout is applied here.

use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SignalError};

/// Handle on the sidecar executable for one Signal account.
#[derive(Debug, Clone)]
pub struct Sidecar {
    exe: String,
    account: String,
}

impl Sidecar {
    pub fn new(exe: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            account: account.into(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Run one sidecar verb and return its stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(exe = %self.exe, account = %self.account, ?args, "sidecar invocation");

        let output = Command::new(&self.exe)
            .arg("-a")
            .arg(&self.account)
            .args(args)
            .output()
            .await
            .map_err(|e| SignalError::Transport(format!("failed to spawn {}: {e}", self.exe)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SignalError::Transport(format!(
                "sidecar exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
