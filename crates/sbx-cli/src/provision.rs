//! Create pipeline: create, record, wait, connect, init script, console.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sbx_infra::Provider;
use sbx_infra::boot::{BOOT_MARKER, BootScript};
use sbx_infra::clock::Clock;
use sbx_infra::types::CreateOptions;
use sbx_ssh::remote::OutputSink;
use sbx_ssh::{ConnectOptions, ConsoleExit, KeySource, RemoteShell, SshSession};
use sbx_store::{Session, SessionStatus, SessionStore};
use tracing::{debug, info, warn};

use crate::error::CliError;
use crate::template::{TemplateRunner, TemplateStore};

pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Opens shells on sandbox VMs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RemoteShell>, sbx_ssh::Error>;
}

pub struct SshConnector {
    pub user: String,
    pub key: KeySource,
    pub options: ConnectOptions,
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn RemoteShell>, sbx_ssh::Error> {
        let session = SshSession::connect(address, &self.user, &self.key, &self.options).await?;
        Ok(Arc::new(session))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub name: String,
    pub ssh_public_key: String,
    pub ssh_user: String,
    pub region: Option<String>,
    pub instance_type: Option<String>,
    pub image: Option<String>,
    pub repo: Option<String>,
    pub template: Option<String>,
    /// Advisory lifetime recorded on the session.
    pub lifetime: Option<Duration>,
    pub wait_timeout: Duration,
    pub console: bool,
}

pub struct Provisioner<'a> {
    pub provider: Arc<dyn Provider>,
    pub store: &'a SessionStore,
    pub templates: &'a TemplateStore,
    pub connector: &'a dyn Connector,
    pub clock: Arc<dyn Clock>,
    pub runner: TemplateRunner,
    pub boot_marker: String,
    pub retry_interval: Duration,
}

/// What a successful pipeline run produced.
#[derive(Debug)]
pub struct Provisioned {
    pub session: Session,
    pub console: Option<ConsoleExit>,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: &'a SessionStore,
        templates: &'a TemplateStore,
        connector: &'a dyn Connector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            templates,
            connector,
            clock,
            runner: TemplateRunner::default(),
            boot_marker: BOOT_MARKER.to_string(),
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Run the pipeline. Once the VM exists it is never destroyed here: every
    /// later failure leaves the VM and its session record in place.
    pub async fn run(
        &self,
        req: &ProvisionRequest,
        stdout: OutputSink<'_>,
        stderr: OutputSink<'_>,
    ) -> Result<Provisioned, CliError> {
        // Resolve the template before paying for a VM.
        let template = match &req.template {
            Some(name) => {
                let template = self.templates.get(name)?;
                if self.templates.is_modified(&template)? {
                    warn!(template = %name, "init.sh changed since the template was added");
                }
                let script = self.templates.script(name)?;
                Some((template, script))
            }
            None => None,
        };

        let mut boot = BootScript {
            user: req.ssh_user.clone(),
            ..BootScript::default()
        };
        if let Some(repo) = &req.repo {
            boot = boot.with_repo(repo.clone());
        }
        let opts = CreateOptions {
            name: req.name.clone(),
            ssh_public_key: req.ssh_public_key.clone(),
            region: req.region.clone(),
            instance_type: req.instance_type.clone(),
            image: req.image.clone(),
            boot_script: Some(boot.render()),
        };

        let vm = self.provider.create(&opts).await?;
        let mut session = Session::provisioning(self.provider.name(), &vm);
        if let Some(lifetime) = req.lifetime {
            session = session.with_timeout(lifetime);
        }
        if let Some(name) = &req.template {
            session = session.with_template(name.clone());
        }
        self.store.add(session.clone())?;
        info!(session = %session.id, vm_id = %vm.id, "sandbox created, waiting for it to boot");

        let vm = match self.provider.wait_ready(&vm.id, req.wait_timeout).await {
            Ok(vm) => vm,
            Err(sbx_infra::Error::Timeout { waited, .. }) => {
                return Err(CliError::NotReady {
                    session: session.id,
                    reason: format!("not reachable over ssh after {}s", waited.as_secs()),
                });
            }
            Err(e @ sbx_infra::Error::ProvisionFailed(_)) => {
                self.store.update_status(&session.id, SessionStatus::Failed)?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let address = vm.address.clone().ok_or_else(|| CliError::NotReady {
            session: session.id.clone(),
            reason: "provider reported no address".into(),
        })?;
        let session = self.store.update(&session.id, |s| {
            s.status = SessionStatus::Running;
            s.address = Some(address.clone());
        })?;

        if template.is_none() && !req.console {
            return Ok(Provisioned {
                session,
                console: None,
            });
        }

        let deadline = self.clock.now() + req.wait_timeout;
        let shell = self.connect_with_retry(&session.id, &address, deadline).await?;
        self.wait_for_boot(shell.as_ref(), &session.id, deadline).await?;

        if let Some((template, script)) = &template {
            self.runner
                .run(
                    shell.as_ref(),
                    &session.id,
                    &template.name,
                    script,
                    template.timeout(),
                    stdout,
                    stderr,
                )
                .await?;
        }

        let console = if req.console {
            Some(shell.console().await?)
        } else {
            None
        };

        Ok(Provisioned { session, console })
    }

    /// Sshd can accept TCP before the boot script has created the user, so
    /// connection and auth failures are retried until `deadline`.
    async fn connect_with_retry(
        &self,
        session: &str,
        address: &str,
        deadline: std::time::Instant,
    ) -> Result<Arc<dyn RemoteShell>, CliError> {
        loop {
            match self.connector.connect(address).await {
                Ok(shell) => return Ok(shell),
                Err(
                    e @ (sbx_ssh::Error::AuthFailed { .. }
                    | sbx_ssh::Error::Unreachable { .. }
                    | sbx_ssh::Error::Timeout { .. }),
                ) => {
                    if self.clock.now() >= deadline {
                        return Err(CliError::NotReady {
                            session: session.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    debug!(session, error = %e, "ssh not accepting logins yet");
                }
                Err(e) => return Err(e.into()),
            }
            self.clock.sleep(self.retry_interval).await;
        }
    }

    async fn wait_for_boot(
        &self,
        shell: &dyn RemoteShell,
        session: &str,
        deadline: std::time::Instant,
    ) -> Result<(), CliError> {
        let probe = format!("test -f {}", sbx_ssh::quote(&self.boot_marker));
        loop {
            if shell.exec(&probe).await?.success() {
                debug!(session, "boot script finished");
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(CliError::NotReady {
                    session: session.to_string(),
                    reason: "boot script has not finished".into(),
                });
            }
            self.clock.sleep(self.retry_interval).await;
        }
    }
}
