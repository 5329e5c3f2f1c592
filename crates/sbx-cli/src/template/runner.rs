use std::time::Duration;

use sbx_ssh::RemoteShell;
use sbx_ssh::remote::OutputSink;
use tracing::{info, warn};

use crate::error::CliError;

pub const REMOTE_SCRIPT_PATH: &str = "/tmp/sbx-init.sh";

/// Exit statuses coreutils `timeout` uses for TERM and KILL.
const TIMEOUT_EXIT: u32 = 124;
const KILLED_EXIT: u32 = 137;

/// Runs a template's init script on a VM.
///
/// The script is bounded on the VM by `timeout(1)`; the client waits a little
/// longer than that in case the remote side hangs.
#[derive(Debug, Clone)]
pub struct TemplateRunner {
    pub remote_path: String,
    pub kill_after: Duration,
    pub client_grace: Duration,
}

impl Default for TemplateRunner {
    fn default() -> Self {
        Self {
            remote_path: REMOTE_SCRIPT_PATH.to_string(),
            kill_after: Duration::from_secs(10),
            client_grace: Duration::from_secs(30),
        }
    }
}

impl TemplateRunner {
    pub fn command(&self, timeout: Duration) -> String {
        format!(
            "timeout --kill-after={} {} {}",
            self.kill_after.as_secs(),
            timeout.as_secs(),
            sbx_ssh::quote(&self.remote_path)
        )
    }

    /// Transfer `script` and run it, streaming output. The VM is never
    /// touched on failure.
    pub async fn run(
        &self,
        shell: &dyn RemoteShell,
        session: &str,
        template: &str,
        script: &[u8],
        timeout: Duration,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<(), CliError> {
        shell.transfer_file(script, &self.remote_path, 0o755).await?;
        info!(session, template, "running init script");

        let timed_out = || CliError::TemplateTimeout {
            session: session.to_string(),
            template: template.to_string(),
            after: timeout,
        };

        let code = match shell
            .exec_streaming(
                &self.command(timeout),
                timeout + self.kill_after + self.client_grace,
                stdout,
                stderr,
            )
            .await
        {
            Ok(code) => code,
            Err(sbx_ssh::Error::Timeout { .. }) => {
                warn!(session, template, "init script outlived its remote timeout");
                return Err(timed_out());
            }
            Err(e) => return Err(e.into()),
        };

        match code {
            0 => {
                info!(session, template, "init script finished");
                Ok(())
            }
            TIMEOUT_EXIT | KILLED_EXIT => Err(timed_out()),
            exit_code => Err(CliError::TemplateExecutionFailed {
                session: session.to_string(),
                template: template.to_string(),
                exit_code,
            }),
        }
    }
}
