//! Readiness polling shared by every provider's `wait_ready`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::clock::{Clock, TokioClock};
use crate::types::{Vm, VmId, VmStatus};
use crate::{Error, Provider, Result};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Decides whether a VM's SSH endpoint accepts connections.
#[async_trait]
pub trait SshProbe: Send + Sync {
    async fn reachable(&self, address: &str) -> bool;
}

/// Plain TCP connect to the SSH port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            port: sbx_ssh::SSH_PORT,
            timeout: PROBE_TIMEOUT,
        }
    }
}

#[async_trait]
impl SshProbe for TcpProbe {
    async fn reachable(&self, address: &str) -> bool {
        sbx_ssh::port_open(address, self.port, self.timeout).await
    }
}

/// Probe with a fixed answer.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl SshProbe for StaticProbe {
    async fn reachable(&self, _address: &str) -> bool {
        self.0
    }
}

#[derive(Clone)]
pub struct ReadyPoller {
    clock: Arc<dyn Clock>,
    probe: Arc<dyn SshProbe>,
    interval: Duration,
}

impl ReadyPoller {
    pub fn new(clock: Arc<dyn Clock>, probe: Arc<dyn SshProbe>, interval: Duration) -> Self {
        Self {
            clock,
            probe,
            interval,
        }
    }

    /// Real clock, TCP probe on port 22, 5s interval.
    pub fn standard() -> Self {
        Self::new(Arc::new(TokioClock), Arc::new(TcpProbe::default()), POLL_INTERVAL)
    }

    /// Poll `provider` until `id` is running with an address whose SSH port
    /// answers, or until `timeout` elapses.
    ///
    /// `Backend` errors are retried until the deadline. A VM reported as
    /// failed or deleted ends the wait immediately.
    pub async fn wait<P: Provider + ?Sized>(
        &self,
        provider: &P,
        id: &VmId,
        timeout: Duration,
    ) -> Result<Vm> {
        let started = self.clock.now();
        let deadline = started + timeout;

        loop {
            match provider.get(id).await {
                Ok(vm) => match vm.status {
                    VmStatus::Failed => {
                        return Err(Error::ProvisionFailed(format!(
                            "vm {id} entered failed state while booting"
                        )));
                    }
                    VmStatus::Deleted => {
                        return Err(Error::NotFound(format!("vm {id} was deleted while booting")));
                    }
                    VmStatus::Running => match vm.address.as_deref() {
                        Some(address) => {
                            if self.probe.reachable(address).await {
                                info!(
                                    vm_id = %id,
                                    address,
                                    waited_secs = (self.clock.now() - started).as_secs(),
                                    "vm ready"
                                );
                                return Ok(vm);
                            }
                            debug!(vm_id = %id, address, "ssh not answering yet");
                        }
                        None => debug!(vm_id = %id, "running but no address yet"),
                    },
                    status => debug!(vm_id = %id, %status, "waiting for vm"),
                },
                Err(Error::Backend(e)) => warn!(vm_id = %id, error = %e, "transient error while polling"),
                Err(e) => return Err(e),
            }

            let now = self.clock.now();
            if now >= deadline {
                return Err(Error::Timeout {
                    id: id.to_string(),
                    waited: timeout,
                });
            }
            self.clock.sleep(self.interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryProvider;
    use crate::types::CreateOptions;

    fn poller(clock: Arc<ManualClock>, reachable: bool) -> ReadyPoller {
        ReadyPoller::new(clock, Arc::new(StaticProbe(reachable)), POLL_INTERVAL)
    }

    #[tokio::test]
    async fn never_ready_times_out_at_deadline() {
        let provider = MemoryProvider::new();
        provider.never_ready();
        let vm = provider.create(&CreateOptions::new("slow-otter", "ssh-ed25519 AAAA")).await.unwrap();

        let clock = Arc::new(ManualClock::new());
        let err = poller(clock.clone(), true)
            .wait(&provider, &vm.id, Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn becomes_ready_after_a_few_polls() {
        let provider = MemoryProvider::new();
        provider.ready_after(3);
        let vm = provider.create(&CreateOptions::new("quick-fox", "ssh-ed25519 AAAA")).await.unwrap();

        let clock = Arc::new(ManualClock::new());
        let ready = poller(clock.clone(), true)
            .wait(&provider, &vm.id, Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(ready.status, VmStatus::Running);
        assert!(ready.address.is_some());
        assert_eq!(clock.elapsed(), POLL_INTERVAL * 2);
    }

    #[tokio::test]
    async fn running_without_ssh_is_not_ready() {
        let provider = MemoryProvider::new();
        let vm = provider.create(&CreateOptions::new("mute-owl", "ssh-ed25519 AAAA")).await.unwrap();

        let clock = Arc::new(ManualClock::new());
        let err = poller(clock, false)
            .wait(&provider, &vm.id, Duration::from_secs(12))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn failed_vm_aborts_wait() {
        let provider = MemoryProvider::new();
        let vm = provider.create(&CreateOptions::new("sad-crab", "ssh-ed25519 AAAA")).await.unwrap();
        provider.set_status(&vm.id, VmStatus::Failed);

        let clock = Arc::new(ManualClock::new());
        let err = poller(clock.clone(), true)
            .wait(&provider, &vm.id, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProvisionFailed(_)));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn vanished_vm_is_not_found() {
        let provider = MemoryProvider::new();
        let clock = Arc::new(ManualClock::new());
        let err = poller(clock, true)
            .wait(&provider, &VmId("404".into()), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
