use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sbx_infra::{ProviderName, ProviderSettings};
use sbx_ssh::KeySource;
use serde::{Deserialize, Serialize};

use crate::error::CliError;

pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_SSH_USER: &str = sbx_infra::boot::DEFAULT_USER;
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub default_provider: ProviderName,
    pub ssh_key: KeySource,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
    #[serde(default)]
    pub providers: BTreeMap<ProviderName, ProviderSettings>,
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_wait_timeout() -> u64 {
    DEFAULT_WAIT_TIMEOUT_SECS
}

impl Config {
    pub fn new(default_provider: ProviderName, ssh_key: KeySource) -> Self {
        Self {
            default_provider,
            ssh_key,
            ssh_user: default_ssh_user(),
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            providers: BTreeMap::new(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).is_file()
    }

    pub fn load(dir: &Path) -> Result<Self, CliError> {
        let path = Self::path(dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CliError::Config(format!(
                    "no configuration at {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Write atomically with owner-only permissions.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, CliError> {
        std::fs::create_dir_all(dir)?;
        let path = Self::path(dir);

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        tmp.write_all(serde_yaml::to_string(self)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| CliError::Io(e.error))?;

        tracing::debug!(path = %path.display(), "config written");
        Ok(path)
    }
}

/// `--config-dir` / `SBX_CONFIG_DIR`, else `~/.config/sbx`.
pub fn config_dir(flag: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(dir) = flag {
        return Ok(sbx_ssh::key_source::expand_home(&dir));
    }
    home::home_dir()
        .map(|home| home.join(".config").join("sbx"))
        .ok_or_else(|| CliError::Config("cannot determine home directory; pass --config-dir".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(
            ProviderName::Hetzner,
            KeySource::File {
                path: "~/.ssh/id_ed25519".into(),
            },
        );
        config.providers.insert(
            ProviderName::Hetzner,
            ProviderSettings {
                token: Some("secret".into()),
                region: Some("hel1".into()),
                ..Default::default()
            },
        );

        let path = config.save(dir.path()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(Config::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn parses_agent_key_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
default_provider: hetzner
ssh_key:
  type: agent
  public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKdpcN1C/dAC3FpkWD9aHsS717mrUFJZFnhAAh51FzDk dev@laptop"
  fingerprint: "SHA256:3z9q12XtKAheOpp0umhlvsGc43mlbmdngRtX7G/rK3Y"
providers:
  hetzner:
    region: nbg1
"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert!(matches!(config.ssh_key, KeySource::Agent { .. }));
        assert_eq!(config.ssh_user, "sandbox");
        assert_eq!(config.wait_timeout_secs, 300);
        assert_eq!(
            config.providers[&ProviderName::Hetzner].region.as_deref(),
            Some("nbg1")
        );
    }

    #[test]
    fn unknown_key_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "default_provider: hetzner\nssh_key:\n  type: carrier-pigeon\n",
        )
        .unwrap();
        assert!(matches!(Config::load(dir.path()), Err(CliError::Yaml(_))));
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), crate::error::exit::CONFIG);
    }
}
