use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{ChannelMsg, Disconnect};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::agent::SshAgent;
use crate::console::{self, ConsoleExit};
use crate::key_source::{KeySource, expand_home};
use crate::remote::{ExecOutput, OutputSink, RemoteShell};
use crate::{Error, Result, SSH_PORT};

/// Tunables for a single SSH connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: SSH_PORT,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(600),
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

/// Sandboxes are created on demand and torn down soon after, so their host
/// keys are accepted on first sight.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH connection to one sandbox.
pub struct SshSession {
    handle: Handle<ClientHandler>,
    host: String,
    user: String,
    command_timeout: Duration,
}

impl SshSession {
    /// Open a connection and authenticate with the configured key source.
    ///
    /// Fails with `Timeout`, `Unreachable` or `AuthFailed`; never with `Execution`.
    pub async fn connect(host: &str, user: &str, source: &KeySource, opts: &ConnectOptions) -> Result<Self> {
        let handshake = async {
            let config = Arc::new(client::Config {
                keepalive_interval: Some(opts.keepalive_interval),
                keepalive_max: 3,
                ..Default::default()
            });

            let mut handle = client::connect(config, (host, opts.port), ClientHandler)
                .await
                .map_err(|e| Error::Unreachable {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?;

            let auth = authenticate(&mut handle, host, user, source).await?;
            if !auth.success() {
                return Err(Error::AuthFailed {
                    user: user.to_string(),
                    host: host.to_string(),
                    reason: format!("server rejected {}", source.describe()),
                });
            }
            Ok(handle)
        };

        let handle = tokio::time::timeout(opts.connect_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout {
                operation: "connect",
                after: opts.connect_timeout,
            })??;

        info!(host, user, "ssh: connected");

        Ok(Self {
            handle,
            host: host.to_string(),
            user: user.to_string(),
            command_timeout: opts.command_timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub async fn disconnect(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            warn!(host = %self.host, error = %e, "ssh: error during disconnect");
        }
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    host: &str,
    user: &str,
    source: &KeySource,
) -> Result<AuthResult> {
    let rsa_hash = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| handshake_error(host, user, e))?
        .flatten();

    match source {
        KeySource::File { path } => {
            let path = expand_home(path);
            let key = load_secret_key(&path, None)
                .map_err(|e| Error::Key(format!("load {}: {e}", path.display())))?;
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash))
                .await
                .map_err(|e| handshake_error(host, user, e))
        }
        KeySource::Agent { fingerprint, .. } => {
            let mut agent = SshAgent::discover().await?;
            let key = agent.identity(fingerprint).await?;
            debug!(socket = %agent.socket().display(), %fingerprint, "ssh: authenticating via agent");
            handle
                .authenticate_publickey_with(user, key, rsa_hash, agent.client_mut())
                .await
                .map_err(|e| Error::AuthFailed {
                    user: user.to_string(),
                    host: host.to_string(),
                    reason: format!("agent signing failed: {e}"),
                })
        }
    }
}

/// Classify a failure during key exchange or authentication. A dropped
/// transport means the host is not up yet; anything else is an auth problem.
fn handshake_error(host: &str, user: &str, e: russh::Error) -> Error {
    match e {
        russh::Error::Disconnect
        | russh::Error::HUP
        | russh::Error::IO(_)
        | russh::Error::ConnectionTimeout
        | russh::Error::KeepaliveTimeout
        | russh::Error::InactivityTimeout
        | russh::Error::SendError => Error::Unreachable {
            host: host.to_string(),
            reason: e.to_string(),
        },
        e => Error::AuthFailed {
            user: user.to_string(),
            host: host.to_string(),
            reason: e.to_string(),
        },
    }
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = self
            .exec_streaming(command, self.command_timeout, &mut stdout, &mut stderr)
            .await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn exec_streaming(
        &self,
        command: &str,
        timeout: Duration,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<u32> {
        let run = async {
            let mut channel = self.handle.channel_open_session().await?;
            channel.exec(true, command).await?;

            let mut exit_code = None;
            let mut signal = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.write_all(&data[..]).await?,
                    ChannelMsg::ExtendedData { data, ext: 1 } => stderr.write_all(&data[..]).await?,
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::ExitSignal { signal_name, .. } => signal = Some(format!("{signal_name:?}")),
                    _ => {}
                }
            }
            stdout.flush().await?;
            stderr.flush().await?;

            match (exit_code, signal) {
                (Some(code), _) => Ok(code),
                (None, Some(sig)) => Err(Error::Execution(format!("remote command killed by signal {sig}"))),
                (None, None) => Err(Error::Execution("remote command ended without exit status".into())),
            }
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| Error::Timeout {
                operation: "exec",
                after: timeout,
            })?
    }

    async fn console(&self) -> Result<ConsoleExit> {
        let channel = self.handle.channel_open_session().await?;
        console::attach(channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_transport_is_unreachable() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        for e in [russh::Error::Disconnect, russh::Error::HUP, russh::Error::IO(reset)] {
            assert!(
                matches!(handshake_error("192.0.2.1", "root", e), Error::Unreachable { .. }),
                "transport failure should be retryable as Unreachable"
            );
        }
    }

    #[test]
    fn protocol_failure_is_auth_failed() {
        let err = handshake_error("192.0.2.1", "root", russh::Error::NotAuthenticated);
        match err {
            Error::AuthFailed { user, host, .. } => {
                assert_eq!(user, "root");
                assert_eq!(host, "192.0.2.1");
            }
            other => panic!("expected AuthFailed, got {other:?}"),
        }
        assert!(matches!(
            handshake_error("192.0.2.1", "root", russh::Error::Kex),
            Error::AuthFailed { .. }
        ));
    }
}
