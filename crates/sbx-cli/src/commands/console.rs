use std::sync::Arc;

use sbx_ssh::{ConsoleExit, RemoteShell};
use sbx_store::{Session, SessionStatus};
use tracing::debug;

use crate::error::{CliError, exit};
use crate::provision::Connector;
use crate::state::AppState;

pub async fn run(state: &AppState, name: &str) -> Result<i32, CliError> {
    let (session, shell) = open_shell(state, name).await?;
    let outcome = shell.console().await?;
    Ok(report_exit(&session.id, outcome))
}

/// Look up a session and open an SSH session to its VM.
pub(super) async fn open_shell(
    state: &AppState,
    name: &str,
) -> Result<(Session, Arc<dyn RemoteShell>), CliError> {
    let session = state.store.get(name)?;
    if session.status == SessionStatus::Failed {
        return Err(CliError::NotReady {
            session: session.id,
            reason: "provisioning failed".into(),
        });
    }
    let address = state.address(&session).await?;
    debug!(session = %session.id, %address, key = %state.config.ssh_key.describe(), "connecting");
    let shell = state.connector().connect(&address).await?;
    Ok((session, shell))
}

/// Exit code for an ended console; a detach leaves the remote shell running.
pub(super) fn report_exit(session: &str, outcome: ConsoleExit) -> i32 {
    match outcome {
        ConsoleExit::Exited(code) => code as i32,
        ConsoleExit::Detached => {
            eprintln!("\r\ndetached from {session}; the sandbox keeps running");
            exit::SUCCESS
        }
        ConsoleExit::Closed => {
            eprintln!("\r\nconnection to {session} closed");
            exit::SUCCESS
        }
    }
}
