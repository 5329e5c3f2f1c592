//! User templates: an init script plus a little metadata, one directory each
//! under `<config-dir>/templates/`.

pub mod runner;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::CliError;

pub use runner::TemplateRunner;

pub const TEMPLATES_DIR: &str = "templates";
pub const METADATA_FILE: &str = "template.yaml";
pub const SCRIPT_FILE: &str = "init.sh";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of `init.sh` when it was added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Template {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn in_config_dir(dir: &Path) -> Self {
        Self::new(dir.join(TEMPLATES_DIR))
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Copy `script` into a new template directory.
    pub fn add(
        &self,
        name: &str,
        script: &Path,
        description: &str,
        timeout: Duration,
    ) -> Result<Template, CliError> {
        validate_name(name)?;
        validate_timeout(name, timeout.as_secs())?;
        let dir = self.dir(name);
        if dir.exists() {
            return Err(CliError::Invalid(format!("template '{name}' already exists")));
        }

        let content = std::fs::read(script).map_err(|e| {
            CliError::Invalid(format!("cannot read script {}: {e}", script.display()))
        })?;
        if content.is_empty() {
            return Err(CliError::Invalid(format!("script {} is empty", script.display())));
        }

        std::fs::create_dir_all(&dir)?;
        let script_path = dir.join(SCRIPT_FILE);
        std::fs::write(&script_path, &content)?;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))?;

        let template = Template {
            name: name.to_string(),
            description: description.to_string(),
            timeout_secs: timeout.as_secs(),
            created_at: Utc::now(),
            sha256: Some(sha256_hex(&content)),
        };
        std::fs::write(dir.join(METADATA_FILE), serde_yaml::to_string(&template)?)?;

        debug!(template = name, path = %dir.display(), "template added");
        Ok(template)
    }

    pub fn get(&self, name: &str) -> Result<Template, CliError> {
        validate_name(name)?;
        let path = self.dir(name).join(METADATA_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CliError::TemplateNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let template: Template = serde_yaml::from_str(&raw)?;
        validate_timeout(name, template.timeout_secs)?;
        Ok(template)
    }

    pub fn script(&self, name: &str) -> Result<Vec<u8>, CliError> {
        validate_name(name)?;
        match std::fs::read(self.dir(name).join(SCRIPT_FILE)) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CliError::TemplateNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `init.sh` changed since the template was added.
    pub fn is_modified(&self, template: &Template) -> Result<bool, CliError> {
        let Some(expected) = &template.sha256 else {
            return Ok(false);
        };
        Ok(&sha256_hex(&self.script(&template.name)?) != expected)
    }

    /// All readable templates, sorted by name.
    pub fn list(&self) -> Result<Vec<Template>, CliError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut templates = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.get(&name) {
                Ok(t) => templates.push(t),
                Err(e) => warn!(template = %name, error = %e, "skipping unreadable template"),
            }
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    pub fn remove(&self, name: &str) -> Result<(), CliError> {
        validate_name(name)?;
        let dir = self.dir(name);
        if !dir.is_dir() {
            return Err(CliError::TemplateNotFound(name.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;
        debug!(template = name, "template removed");
        Ok(())
    }
}

/// `[a-z0-9][a-z0-9-_]*`
pub fn validate_name(name: &str) -> Result<(), CliError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_lowercase() || first.is_ascii_digit())
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CliError::Invalid(format!(
            "invalid template name '{name}': use lowercase letters, digits, '-' and '_'"
        )))
    }
}

fn validate_timeout(name: &str, secs: u64) -> Result<(), CliError> {
    if secs == 0 {
        return Err(CliError::Invalid(format!(
            "template '{name}': timeout must be at least 1 second"
        )));
    }
    Ok(())
}

fn sha256_hex(content: &[u8]) -> String {
    Sha256::digest(content)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
