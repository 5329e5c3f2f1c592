mod console;
mod create;
mod destroy;
mod exec;
mod init;
mod list;
mod template;

use crate::cli::{Cli, Command};
use crate::config;
use crate::error::CliError;
use crate::state::AppState;

/// Dispatch a parsed command line. Returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32, CliError> {
    let dir = config::config_dir(cli.config_dir)?;

    match cli.command {
        Command::Init(args) => init::run(&dir, args).await,
        Command::Create(args) => create::run(&AppState::load(&dir, true)?, args).await,
        Command::List { json } => list::run(&AppState::load(&dir, true)?, json).await,
        Command::Console { name } => console::run(&AppState::load(&dir, false)?, &name).await,
        Command::Exec { name, command } => {
            exec::run(&AppState::load(&dir, false)?, &name, &command).await
        }
        Command::Destroy { name } => destroy::run(&AppState::load(&dir, true)?, &name).await,
        Command::Template { action } => template::run(&dir, action),
    }
}
