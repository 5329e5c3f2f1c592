use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use sbx_infra::ProviderName;

#[derive(Parser)]
#[command(name = "sbx", version)]
#[command(about = "Ephemeral cloud VM sandboxes for coding agents")]
pub struct Cli {
    /// Configuration directory (default: ~/.config/sbx)
    #[arg(long, env = "SBX_CONFIG_DIR", global = true)]
    pub config_dir: Option<PathBuf>,

    /// Verbose logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write the configuration file
    Init(InitArgs),

    /// Create a sandbox VM
    Create(CreateArgs),

    /// List sandboxes after reconciling with the providers
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Open an interactive shell on a sandbox (`~.` detaches)
    Console { name: String },

    /// Run a command on a sandbox and exit with its status
    Exec {
        name: String,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Destroy a sandbox VM and forget it
    Destroy { name: String },

    /// Manage init-script templates
    Template {
        #[command(subcommand)]
        action: TemplateCommand,
    },
}

#[derive(Args)]
pub struct InitArgs {
    #[arg(long, default_value = "hetzner")]
    pub provider: ProviderName,

    /// Provider API token (default: HETZNER_API_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub instance_type: Option<String>,

    #[arg(long)]
    pub image: Option<String>,

    /// Private key file; its public key is read from `<path>.pub`
    #[arg(long, value_name = "PATH", conflicts_with = "agent_key")]
    pub ssh_key: Option<PathBuf>,

    /// Use the agent key with this fingerprint
    #[arg(long, value_name = "FINGERPRINT")]
    pub agent_key: Option<String>,

    /// Overwrite an existing configuration
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct CreateArgs {
    /// Sandbox name (default: generated)
    pub name: Option<String>,

    #[arg(long)]
    pub provider: Option<ProviderName>,

    /// Run this template's init script once the VM is up
    #[arg(long)]
    pub template: Option<String>,

    /// Git repository to clone into the user's home directory
    #[arg(long)]
    pub repo: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub instance_type: Option<String>,

    #[arg(long)]
    pub image: Option<String>,

    /// Intended lifetime in minutes, recorded with the session
    #[arg(long, value_name = "MINUTES")]
    pub timeout: Option<u64>,

    /// Seconds to wait for SSH (default: wait_timeout_secs from config)
    #[arg(long, value_name = "SECS")]
    pub wait_timeout: Option<u64>,

    /// Open a console once the sandbox is ready
    #[arg(long)]
    pub console: bool,
}

#[derive(Subcommand)]
pub enum TemplateCommand {
    /// Add a template from a local script
    Add {
        name: String,

        #[arg(long, value_name = "PATH")]
        script: PathBuf,

        #[arg(long, default_value = "")]
        description: String,

        /// Script timeout in seconds
        #[arg(long, default_value_t = crate::template::DEFAULT_TIMEOUT_SECS)]
        timeout: u64,
    },

    /// List templates
    List,

    /// Show a template and its script
    Show { name: String },

    /// Remove a template
    Remove { name: String },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exec_takes_trailing_command() {
        let cli = Cli::parse_from(["sbx", "exec", "swift-tiger", "--", "ls", "-la", "/tmp"]);
        match cli.command {
            Command::Exec { name, command } => {
                assert_eq!(name, "swift-tiger");
                assert_eq!(command, vec!["ls", "-la", "/tmp"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn key_flags_are_exclusive() {
        let res = Cli::try_parse_from([
            "sbx", "init", "--ssh-key", "~/.ssh/id_ed25519", "--agent-key", "SHA256:x",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn unknown_provider_rejected() {
        assert!(Cli::try_parse_from(["sbx", "create", "--provider", "aws"]).is_err());
    }
}
