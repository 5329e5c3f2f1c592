//! SSH plumbing for sandbox VMs.
//!
//! Covers agent discovery (public keys only), authenticated sessions
//! (file- or agent-backed), remote command execution, interactive consoles
//! and quoting-safe file transfer.

pub mod agent;
mod console;
pub mod key_source;
#[cfg(any(test, feature = "testing"))]
pub mod local;
pub mod remote;
pub mod session;

use std::time::Duration;

pub use agent::{AgentKey, SshAgent};
pub use console::ConsoleExit;
pub use key_source::KeySource;
pub use remote::{ExecOutput, RemoteShell};
pub use session::{ConnectOptions, SshSession};

/// Default SSH port on sandbox VMs.
pub const SSH_PORT: u16 = 22;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ssh authentication failed for {user}@{host}: {reason}")]
    AuthFailed {
        user: String,
        host: String,
        reason: String,
    },

    #[error("ssh host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("ssh {operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("ssh execution error: {0}")]
    Execution(String),

    #[error("no ssh agent reachable (tried {tried} socket(s))")]
    AgentUnavailable { tried: usize },

    #[error("ssh agent holds no key with fingerprint {0}")]
    KeyNotFound(String),

    #[error("ssh key error: {0}")]
    Key(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<russh::Error> for Error {
    fn from(e: russh::Error) -> Self {
        Error::Execution(e.to_string())
    }
}

/// Quote a value for POSIX `sh` by wrapping it in single quotes.
///
/// Embedded single quotes become `'\''`.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Check whether a TCP connection to `host:port` can be established within
/// `timeout`. Used as the transport-level readiness probe for SSH.
pub async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(host, port, error = %e, "port probe refused");
            false
        }
        Err(_) => {
            tracing::debug!(host, port, "port probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_plain_value() {
        assert_eq!(quote("/tmp/init.sh"), "'/tmp/init.sh'");
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn quote_keeps_metacharacters_inert() {
        assert_eq!(quote("$(rm -rf /); `x`"), "'$(rm -rf /); `x`'");
    }

    #[tokio::test]
    async fn port_open_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_open("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn port_open_false_when_nothing_listens() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!port_open("127.0.0.1", port, Duration::from_secs(1)).await);
    }
}
