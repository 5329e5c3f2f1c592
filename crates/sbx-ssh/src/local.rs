//! `RemoteShell` backed by the local `sh`, for exercising remote protocols
//! (file transfer, init scripts) without a VM.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::console::ConsoleExit;
use crate::remote::{ExecOutput, OutputSink, RemoteShell};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct LocalShell {
    consoles: AtomicUsize,
}

impl LocalShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `console` was called.
    pub fn consoles_opened(&self) -> usize {
        self.consoles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteShell for LocalShell {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let output = Command::new("sh").arg("-c").arg(command).output().await?;
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(255) as u32,
        })
    }

    async fn exec_streaming(
        &self,
        command: &str,
        timeout: Duration,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<u32> {
        let run = async {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            let mut out_pipe = child.stdout.take().ok_or_else(|| Error::Execution("no stdout pipe".into()))?;
            let mut err_pipe = child.stderr.take().ok_or_else(|| Error::Execution("no stderr pipe".into()))?;

            let mut out_buf = Vec::new();
            let mut err_buf = Vec::new();
            let (out_res, err_res) = tokio::join!(
                out_pipe.read_to_end(&mut out_buf),
                err_pipe.read_to_end(&mut err_buf)
            );
            out_res?;
            err_res?;
            stdout.write_all(&out_buf).await?;
            stderr.write_all(&err_buf).await?;

            let status = child.wait().await?;
            Ok(status.code().unwrap_or(255) as u32)
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| Error::Timeout {
                operation: "exec",
                after: timeout,
            })?
    }

    async fn console(&self) -> Result<ConsoleExit> {
        self.consoles.fetch_add(1, Ordering::SeqCst);
        Ok(ConsoleExit::Detached)
    }
}
