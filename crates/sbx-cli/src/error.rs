use std::time::Duration;

/// Process exit codes.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const API: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const NOT_READY: i32 = 5;
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Invalid(String),

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("template '{template}' failed on {session} with exit code {exit_code}")]
    TemplateExecutionFailed {
        session: String,
        template: String,
        exit_code: u32,
    },

    #[error("template '{template}' on {session} timed out after {}s", .after.as_secs())]
    TemplateTimeout {
        session: String,
        template: String,
        after: Duration,
    },

    #[error("sandbox {session} is not ready: {reason}")]
    NotReady { session: String, reason: String },

    #[error(transparent)]
    Infra(#[from] sbx_infra::Error),

    #[error(transparent)]
    Ssh(#[from] sbx_ssh::Error),

    #[error(transparent)]
    Store(#[from] sbx_store::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Yaml(_) => exit::CONFIG,
            CliError::TemplateNotFound(_) => exit::NOT_FOUND,
            CliError::NotReady { .. } => exit::NOT_READY,
            CliError::Infra(e) => infra_exit_code(e),
            CliError::Ssh(e) => match e {
                sbx_ssh::Error::AuthFailed { .. }
                | sbx_ssh::Error::Unreachable { .. }
                | sbx_ssh::Error::Timeout { .. } => exit::NOT_READY,
                sbx_ssh::Error::AgentUnavailable { .. }
                | sbx_ssh::Error::KeyNotFound(_)
                | sbx_ssh::Error::Key(_) => exit::CONFIG,
                sbx_ssh::Error::Execution(_) | sbx_ssh::Error::Io(_) => exit::GENERAL,
            },
            CliError::Store(sbx_store::Error::NotFound(_)) => exit::NOT_FOUND,
            CliError::Store(sbx_store::Error::Provider(e)) => infra_exit_code(e),
            CliError::Store(_) => exit::GENERAL,
            CliError::Invalid(_)
            | CliError::TemplateExecutionFailed { .. }
            | CliError::TemplateTimeout { .. }
            | CliError::Io(_)
            | CliError::Json(_) => exit::GENERAL,
        }
    }

    /// Next step for the operator, printed under the error message.
    pub fn hint(&self) -> Option<String> {
        match self {
            CliError::TemplateExecutionFailed { session, .. }
            | CliError::TemplateTimeout { session, .. }
            | CliError::NotReady { session, .. } => Some(format!(
                "the VM was kept for debugging: run `sbx console {session}` to inspect it, \
                 `sbx destroy {session}` to remove it"
            )),
            CliError::Config(_) | CliError::Yaml(_) => {
                Some("run `sbx init` to (re)create the configuration".into())
            }
            CliError::TemplateNotFound(_) => Some("run `sbx template list` to see templates".into()),
            CliError::Store(sbx_store::Error::NotFound(_)) => {
                Some("run `sbx list` to see known sandboxes".into())
            }
            CliError::Store(sbx_store::Error::Lock(_)) => {
                Some("another sbx process may be holding the session file".into())
            }
            CliError::Infra(sbx_infra::Error::AuthFailed(_)) => {
                Some("check the provider API token in config.yaml or HETZNER_API_TOKEN".into())
            }
            CliError::Infra(sbx_infra::Error::QuotaExceeded(_)) => {
                Some("destroy unused sandboxes or raise the project limit".into())
            }
            CliError::Ssh(sbx_ssh::Error::AgentUnavailable { .. }) => {
                Some("start an ssh agent or configure a key file with `sbx init --ssh-key`".into())
            }
            _ => None,
        }
    }
}

fn infra_exit_code(e: &sbx_infra::Error) -> i32 {
    match e {
        sbx_infra::Error::NotFound(_) => exit::NOT_FOUND,
        sbx_infra::Error::Timeout { .. } => exit::NOT_READY,
        sbx_infra::Error::Config(_) | sbx_infra::Error::UnknownProvider(_) => exit::CONFIG,
        sbx_infra::Error::AuthFailed(_)
        | sbx_infra::Error::QuotaExceeded(_)
        | sbx_infra::Error::ProvisionFailed(_)
        | sbx_infra::Error::Backend(_) => exit::API,
    }
}
