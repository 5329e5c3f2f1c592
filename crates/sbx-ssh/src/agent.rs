//! Read-only client for an external SSH key agent.
//!
//! Only public key blobs are ever requested; signing happens inside the
//! agent during authentication (see [`crate::session`]).

use std::path::{Path, PathBuf};

use russh::keys::agent::client::AgentClient;
use russh::keys::{HashAlg, PublicKey};
use serde::Serialize;
use tokio::net::UnixStream;
use tracing::debug;

use crate::{Error, Result};

/// Public projection of one identity advertised by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentKey {
    pub algorithm: String,
    pub fingerprint: String,
    pub comment: String,
    pub public_key: String,
}

impl AgentKey {
    pub fn from_public_key(key: &PublicKey) -> Result<Self> {
        let mut public_key = key
            .to_openssh()
            .map_err(|e| Error::Key(format!("encode public key: {e}")))?;
        // to_openssh appends the comment; keep only "<algo> <blob>" so the
        // line matches what gets written into authorized_keys.
        if let Some((algo_and_blob, _)) = split_comment(&public_key) {
            public_key = algo_and_blob;
        }

        Ok(Self {
            algorithm: key.algorithm().as_str().to_string(),
            fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
            comment: key.comment().to_string(),
            public_key,
        })
    }

    /// True when `fingerprint` names this key. The `SHA256:` prefix is optional.
    pub fn matches(&self, fingerprint: &str) -> bool {
        let wanted = fingerprint.trim();
        self.fingerprint == wanted || self.fingerprint.strip_prefix("SHA256:") == Some(wanted)
    }
}

fn split_comment(line: &str) -> Option<(String, String)> {
    let mut parts = line.splitn(3, ' ');
    let algo = parts.next()?;
    let blob = parts.next()?;
    let comment = parts.next()?;
    Some((format!("{algo} {blob}"), comment.to_string()))
}

/// Connection to a running SSH agent.
pub struct SshAgent {
    socket: PathBuf,
    client: AgentClient<UnixStream>,
}

impl std::fmt::Debug for SshAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAgent").field("socket", &self.socket).finish()
    }
}

impl SshAgent {
    /// Try each candidate socket in order and return the first that connects.
    pub async fn discover() -> Result<Self> {
        let home = home::home_dir();
        let candidates = candidate_sockets(|k| std::env::var(k).ok(), home.as_deref());
        let tried = candidates.len();

        for socket in candidates {
            if !socket.exists() {
                continue;
            }
            match AgentClient::connect_uds(&socket).await {
                Ok(client) => {
                    debug!(socket = %socket.display(), "connected to ssh agent");
                    return Ok(Self { socket, client });
                }
                Err(e) => {
                    debug!(socket = %socket.display(), error = %e, "ssh agent socket did not answer");
                }
            }
        }

        Err(Error::AgentUnavailable { tried })
    }

    /// Like [`SshAgent::discover`] but treats a missing agent as `None`.
    pub async fn try_discover() -> Option<Self> {
        match Self::discover().await {
            Ok(agent) => Some(agent),
            Err(e) => {
                debug!(error = %e, "continuing without ssh agent");
                None
            }
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub async fn list_keys(&mut self) -> Result<Vec<AgentKey>> {
        self.identities()
            .await?
            .iter()
            .map(AgentKey::from_public_key)
            .collect()
    }

    pub async fn get_by_fingerprint(&mut self, fingerprint: &str) -> Result<AgentKey> {
        self.list_keys()
            .await?
            .into_iter()
            .find(|k| k.matches(fingerprint))
            .ok_or_else(|| Error::KeyNotFound(fingerprint.to_string()))
    }

    /// Raw identity used to drive agent-signed authentication.
    pub(crate) async fn identity(&mut self, fingerprint: &str) -> Result<PublicKey> {
        for key in self.identities().await? {
            if AgentKey::from_public_key(&key)?.matches(fingerprint) {
                return Ok(key);
            }
        }
        Err(Error::KeyNotFound(fingerprint.to_string()))
    }

    pub(crate) fn client_mut(&mut self) -> &mut AgentClient<UnixStream> {
        &mut self.client
    }

    async fn identities(&mut self) -> Result<Vec<PublicKey>> {
        self.client
            .request_identities()
            .await
            .map_err(|e| Error::Key(format!("request agent identities: {e}")))
    }
}

/// Ordered list of sockets an agent may listen on.
pub fn candidate_sockets(env: impl Fn(&str) -> Option<String>, home: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();

    if let Some(sock) = env("SSH_AUTH_SOCK").filter(|s| !s.is_empty()) {
        out.push(PathBuf::from(sock));
    }

    if let Some(home) = home {
        out.push(home.join(".1password").join("agent.sock"));
        out.push(
            home.join("Library")
                .join("Group Containers")
                .join("2BUA8C4S2C.com.1password")
                .join("t")
                .join("agent.sock"),
        );
    }

    if let Some(runtime) = env("XDG_RUNTIME_DIR").filter(|s| !s.is_empty()) {
        let runtime = PathBuf::from(runtime);
        out.push(runtime.join("ssh-agent.socket"));
        out.push(runtime.join("gcr").join("ssh"));
    }

    if let Some(home) = home {
        out.push(home.join(".gnupg").join("S.gpg-agent.ssh"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKdpcN1C/dAC3FpkWD9aHsS717mrUFJZFnhAAh51FzDk dev@laptop";
    const FINGERPRINT: &str = "SHA256:3z9q12XtKAheOpp0umhlvsGc43mlbmdngRtX7G/rK3Y";

    fn agent_key() -> AgentKey {
        let key = PublicKey::from_openssh(KEY).unwrap();
        AgentKey::from_public_key(&key).unwrap()
    }

    #[test]
    fn projects_public_key_fields() {
        let key = agent_key();
        assert_eq!(key.algorithm, "ssh-ed25519");
        assert_eq!(key.fingerprint, FINGERPRINT);
        assert_eq!(key.comment, "dev@laptop");
        assert_eq!(
            key.public_key,
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKdpcN1C/dAC3FpkWD9aHsS717mrUFJZFnhAAh51FzDk"
        );
    }

    #[test]
    fn fingerprint_prefix_is_optional() {
        let key = agent_key();
        assert!(key.matches(FINGERPRINT));
        assert!(key.matches("3z9q12XtKAheOpp0umhlvsGc43mlbmdngRtX7G/rK3Y"));
        assert!(!key.matches("SHA256:nope"));
    }

    #[test]
    fn candidates_start_with_auth_sock() {
        let env = |k: &str| match k {
            "SSH_AUTH_SOCK" => Some("/tmp/agent.1".to_string()),
            "XDG_RUNTIME_DIR" => Some("/run/user/1000".to_string()),
            _ => None,
        };
        let sockets = candidate_sockets(env, Some(Path::new("/home/dev")));
        assert_eq!(sockets[0], PathBuf::from("/tmp/agent.1"));
        assert_eq!(sockets[1], PathBuf::from("/home/dev/.1password/agent.sock"));
        assert!(sockets.contains(&PathBuf::from("/run/user/1000/ssh-agent.socket")));
        assert_eq!(
            sockets.last().unwrap(),
            &PathBuf::from("/home/dev/.gnupg/S.gpg-agent.ssh")
        );
    }

    #[test]
    fn empty_auth_sock_is_skipped() {
        let env = |k: &str| (k == "SSH_AUTH_SOCK").then(String::new);
        let sockets = candidate_sockets(env, None);
        assert!(sockets.is_empty());
    }
}
