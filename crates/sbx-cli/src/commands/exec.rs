use crate::error::CliError;
use crate::state::AppState;

/// Run `argv` on the sandbox, streaming output. The remote exit status
/// becomes ours.
pub async fn run(state: &AppState, name: &str, argv: &[String]) -> Result<i32, CliError> {
    let command = join_command(argv)?;
    let (session, shell) = super::console::open_shell(state, name).await?;
    tracing::debug!(session = %session.id, %command, "exec");

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let code = shell
        .exec_streaming(
            &command,
            state.connect_options().command_timeout,
            &mut stdout,
            &mut stderr,
        )
        .await?;
    Ok(code as i32)
}

/// Arguments are passed through unquoted, so `sbx exec box -- 'ls | wc -l'`
/// runs a pipeline remotely.
fn join_command(argv: &[String]) -> Result<String, CliError> {
    let command = argv.join(" ");
    if command.trim().is_empty() {
        return Err(CliError::Invalid("empty command".into()));
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_arguments_verbatim() {
        let argv = vec!["ls".to_string(), "-la".into(), "| wc -l".into()];
        assert_eq!(join_command(&argv).unwrap(), "ls -la | wc -l");
    }

    #[test]
    fn blank_command_rejected() {
        assert!(join_command(&[" ".to_string()]).is_err());
    }
}
