use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::AsyncWrite;

use crate::console::ConsoleExit;
use crate::{Error, Result, quote};

/// Writer that receives streamed remote output.
pub type OutputSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Captured result of a remote command.
///
/// A non-zero `exit_code` is data, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: u32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A connected shell on a sandbox.
///
/// `SshSession` is the production implementation; tests substitute fakes.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` to completion and capture its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Run `command`, forwarding output as it arrives. Returns the exit code.
    async fn exec_streaming(
        &self,
        command: &str,
        timeout: Duration,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<u32>;

    /// Attach the local terminal to an interactive remote shell.
    async fn console(&self) -> Result<ConsoleExit>;

    /// Write `content` to `remote_path` with permission bits `mode`.
    ///
    /// Decode, write and chmod happen in one remote command.
    async fn transfer_file(&self, content: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let output = self.exec(&transfer_command(content, remote_path, mode)).await?;
        if !output.success() {
            return Err(Error::Execution(format!(
                "write {remote_path} failed (exit {}): {}",
                output.exit_code,
                output.stderr_lossy().trim()
            )));
        }
        Ok(())
    }
}

/// Build the single shell command that materialises `content` at `remote_path`.
///
/// The payload is base64 so it contains no quote or shell metacharacters.
pub fn transfer_command(content: &[u8], remote_path: &str, mode: u32) -> String {
    let encoded = STANDARD.encode(content);
    let path = quote(remote_path);
    format!("printf '%s' '{encoded}' | base64 -d > {path} && chmod {mode:04o} {path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_command_encodes_payload() {
        let cmd = transfer_command(b"echo 'hi' && rm -rf $HOME\n", "/tmp/x.sh", 0o755);
        assert_eq!(
            cmd,
            "printf '%s' 'ZWNobyAnaGknICYmIHJtIC1yZiAkSE9NRQo=' | base64 -d > '/tmp/x.sh' && chmod 0755 '/tmp/x.sh'"
        );
    }

    #[test]
    fn transfer_command_quotes_path() {
        let cmd = transfer_command(b"", "/tmp/it's here", 0o600);
        assert!(cmd.ends_with(r"chmod 0600 '/tmp/it'\''s here'"));
    }
}
