//! Interactive console: local terminal in raw mode wired to a remote PTY.

use crossterm::terminal;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{SignalKind, signal};
use tracing::debug;

use crate::Result;

/// How an interactive console ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The remote shell exited with this status.
    Exited(u32),
    /// The operator detached (`~.` or SIGINT); the remote side was not signalled.
    Detached,
    /// The server closed the channel without reporting a status.
    Closed,
}

/// Puts the terminal in raw mode and restores it when dropped, including
/// on early returns and panics.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            debug!(error = %e, "failed to restore terminal mode");
        }
    }
}

pub(crate) async fn attach(mut channel: Channel<Msg>) -> Result<ConsoleExit> {
    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".into());
    channel
        .request_pty(false, &term, cols.into(), rows.into(), 0, 0, &[])
        .await?;
    channel.request_shell(true).await?;

    let _raw = RawModeGuard::enable()?;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut resize = signal(SignalKind::window_change())?;
    let mut escape = EscapeDetector::default();
    let mut buf = vec![0u8; 4096];
    let mut stdin_open = true;

    let exit = loop {
        tokio::select! {
            read = stdin.read(&mut buf), if stdin_open => {
                let n = read?;
                if n == 0 {
                    stdin_open = false;
                    channel.eof().await?;
                    continue;
                }
                match escape.feed(&buf[..n]) {
                    Filtered::Forward(bytes) => {
                        if !bytes.is_empty() {
                            channel.data(&bytes[..]).await?;
                        }
                    }
                    Filtered::Detach(bytes) => {
                        if !bytes.is_empty() {
                            channel.data(&bytes[..]).await?;
                        }
                        break ConsoleExit::Detached;
                    }
                }
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    stdout.write_all(&data[..]).await?;
                    stdout.flush().await?;
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    stderr.write_all(&data[..]).await?;
                    stderr.flush().await?;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => break ConsoleExit::Exited(exit_status),
                Some(_) => {}
                None => break ConsoleExit::Closed,
            },
            _ = resize.recv() => {
                if let Ok((cols, rows)) = terminal::size() {
                    channel.window_change(cols.into(), rows.into(), 0, 0).await?;
                }
            }
            // Raw mode turns a typed ^C into byte 0x03 for the remote, so
            // only a SIGINT from outside the terminal lands here.
            _ = tokio::signal::ctrl_c() => break ConsoleExit::Detached,
        }
    };

    debug!(?exit, "console ended");
    Ok(exit)
}

/// Result of running keyboard input through the escape detector.
#[derive(Debug, PartialEq, Eq)]
enum Filtered {
    Forward(Vec<u8>),
    /// Detach requested; bytes before the escape still need forwarding.
    Detach(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum EscapeState {
    #[default]
    LineStart,
    MidLine,
    Tilde,
}

/// OpenSSH-style `~.` detection. The escape is only recognised at the
/// start of a line; `~~` sends a literal tilde.
#[derive(Debug, Default)]
struct EscapeDetector {
    state: EscapeState,
}

impl EscapeDetector {
    fn feed(&mut self, input: &[u8]) -> Filtered {
        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            match self.state {
                EscapeState::Tilde => match b {
                    b'.' => return Filtered::Detach(out),
                    b'~' => {
                        out.push(b'~');
                        self.state = EscapeState::MidLine;
                    }
                    _ => {
                        out.extend_from_slice(&[b'~', b]);
                        self.state = Self::after(b);
                    }
                },
                EscapeState::LineStart if b == b'~' => self.state = EscapeState::Tilde,
                _ => {
                    out.push(b);
                    self.state = Self::after(b);
                }
            }
        }
        Filtered::Forward(out)
    }

    fn after(b: u8) -> EscapeState {
        if b == b'\r' || b == b'\n' {
            EscapeState::LineStart
        } else {
            EscapeState::MidLine
        }
    }
}
