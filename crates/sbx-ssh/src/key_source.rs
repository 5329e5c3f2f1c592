use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where the operator's SSH identity comes from. Exactly one source is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeySource {
    /// Private key file on disk; its public half is expected at `<path>.pub`.
    File { path: PathBuf },
    /// Key held by an SSH agent, identified by fingerprint.
    Agent {
        public_key: String,
        fingerprint: String,
    },
}

impl KeySource {
    /// The public key line (`<algorithm> <base64>`) to register with providers.
    pub fn public_key(&self) -> Result<String> {
        match self {
            Self::File { path } => {
                let pub_path = public_key_path(&expand_home(path));
                let raw = std::fs::read_to_string(&pub_path).map_err(|e| {
                    Error::Key(format!("read public key {}: {e}", pub_path.display()))
                })?;
                normalize_public_key(&raw)
            }
            Self::Agent { public_key, .. } => normalize_public_key(public_key),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::File { path } => format!("file {}", path.display()),
            Self::Agent { fingerprint, .. } => format!("agent {fingerprint}"),
        }
    }
}

fn public_key_path(private: &Path) -> PathBuf {
    let mut name = private.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Expand a leading `~/` to the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match home::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Reduce an OpenSSH public key line to `<algorithm> <base64>`.
pub fn normalize_public_key(raw: &str) -> Result<String> {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .ok_or_else(|| Error::Key("public key is empty".into()))?;

    let mut tokens = line.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(algo), Some(blob)) => Ok(format!("{algo} {blob}")),
        _ => Err(Error::Key(format!(
            "malformed public key, expected \"<type> <base64> [comment]\": {line}"
        ))),
    }
}
