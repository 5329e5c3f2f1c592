//! Hetzner Cloud provider.

mod hcloud_api;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

pub use hcloud_api::HcloudApi;

use crate::boot::BootScript;
use crate::keys::{self, KeyCache, SshKeyRecord};
use crate::ready::ReadyPoller;
use crate::types::{CreateOptions, Vm, VmId};
use crate::{Error, Provider, ProviderName, ProviderSettings, Result};

pub const DEFAULT_REGION: &str = "fsn1";
pub const DEFAULT_INSTANCE_TYPE: &str = "cx22";
pub const DEFAULT_IMAGE: &str = "ubuntu-24.04";

/// Label attached to every server this tool creates. `list` only returns
/// servers carrying it.
pub const MANAGED_LABEL: (&str, &str) = ("managed-by", "sbx");

/// Resolved Hetzner settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HetznerSettings {
    pub token: String,
    pub region: String,
    pub instance_type: String,
    pub image: String,
}

impl HetznerSettings {
    /// Apply defaults to the configured values. The token falls back to
    /// `HETZNER_API_TOKEN`.
    pub fn resolve(settings: &ProviderSettings) -> Result<Self> {
        let token = settings
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var("HETZNER_API_TOKEN").ok().filter(|t| !t.is_empty()))
            .ok_or_else(|| Error::Config("no Hetzner API token configured".into()))?;

        Ok(Self {
            token,
            region: settings.region.clone().unwrap_or_else(|| DEFAULT_REGION.into()),
            instance_type: settings
                .instance_type
                .clone()
                .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.into()),
            image: settings.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.into()),
        })
    }
}

/// Server creation request, already resolved against defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub user_data: String,
    pub labels: HashMap<String, String>,
    pub ssh_keys: Vec<String>,
}

/// The subset of the Hetzner Cloud API the provider needs.
#[async_trait]
pub trait HetznerApi: Send + Sync + 'static {
    async fn create_server(&self, request: ServerRequest) -> Result<Vm>;

    async fn get_server(&self, id: i64) -> Result<Vm>;

    async fn list_servers(&self, label_selector: &str) -> Result<Vec<Vm>>;

    async fn delete_server(&self, id: i64) -> Result<()>;

    async fn find_ssh_key(&self, fingerprint: &str) -> Result<Option<SshKeyRecord>>;

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKeyRecord>;
}

pub struct HetznerProvider {
    api: Arc<dyn HetznerApi>,
    settings: HetznerSettings,
    keys: Arc<KeyCache>,
    poller: ReadyPoller,
}

impl HetznerProvider {
    pub fn new(api: Arc<dyn HetznerApi>, settings: HetznerSettings, keys: Arc<KeyCache>) -> Self {
        Self {
            api,
            settings,
            keys,
            poller: ReadyPoller::standard(),
        }
    }

    /// Build against the real API. Fails with `Config` when no token is available.
    pub fn from_settings(settings: &ProviderSettings, keys: Arc<KeyCache>) -> Result<Self> {
        let settings = HetznerSettings::resolve(settings)?;
        let api = Arc::new(HcloudApi::new(&settings.token));
        Ok(Self::new(api, settings, keys))
    }

    pub fn with_poller(mut self, poller: ReadyPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn settings(&self) -> &HetznerSettings {
        &self.settings
    }

    /// Make sure `public_key` is registered with the project, registering it
    /// under a deterministic name if needed.
    ///
    /// Returns the record and whether it came from the local cache.
    pub async fn ensure_ssh_key(&self, public_key: &str) -> Result<(SshKeyRecord, bool)> {
        let fingerprint = keys::md5_fingerprint(public_key)?;

        if let Some(record) = self.keys.get(ProviderName::Hetzner, &fingerprint) {
            debug!(fingerprint, key_id = %record.id, "hetzner: ssh key from cache");
            return Ok((record, true));
        }

        let record = match self.api.find_ssh_key(&fingerprint).await? {
            Some(record) => {
                debug!(fingerprint, key_id = %record.id, "hetzner: ssh key already registered");
                record
            }
            None => {
                let name = keys::key_name(&fingerprint);
                match self.api.create_ssh_key(&name, public_key).await {
                    Ok(record) => {
                        info!(fingerprint, key_id = %record.id, name, "hetzner: ssh key registered");
                        record
                    }
                    // Lost a race with a concurrent registration.
                    Err(e) => match self.api.find_ssh_key(&fingerprint).await? {
                        Some(record) => record,
                        None => return Err(e),
                    },
                }
            }
        };

        if let Err(e) = self.keys.insert(ProviderName::Hetzner, record.clone()) {
            warn!(error = %e, "hetzner: cannot persist ssh key cache");
        }
        Ok((record, false))
    }

    fn server_request(&self, opts: &CreateOptions, key: &SshKeyRecord) -> ServerRequest {
        let user_data = opts
            .boot_script
            .clone()
            .unwrap_or_else(|| BootScript::default().render());

        ServerRequest {
            name: opts.name.clone(),
            server_type: opts
                .instance_type
                .clone()
                .unwrap_or_else(|| self.settings.instance_type.clone()),
            image: opts.image.clone().unwrap_or_else(|| self.settings.image.clone()),
            location: opts.region.clone().unwrap_or_else(|| self.settings.region.clone()),
            user_data,
            labels: HashMap::from([(MANAGED_LABEL.0.to_string(), MANAGED_LABEL.1.to_string())]),
            ssh_keys: vec![key.id.clone()],
        }
    }

    fn parse_id(id: &VmId) -> Result<i64> {
        id.0
            .parse::<i64>()
            .map_err(|_| Error::NotFound(format!("no Hetzner server with id {id:?}")))
    }
}

#[async_trait]
impl Provider for HetznerProvider {
    async fn create(&self, opts: &CreateOptions) -> Result<Vm> {
        let (key, cached) = self.ensure_ssh_key(&opts.ssh_public_key).await?;

        let vm = match self.api.create_server(self.server_request(opts, &key)).await {
            // A cached key may have been deleted out of band.
            Err(Error::NotFound(msg)) if cached => {
                warn!(key_id = %key.id, "hetzner: cached ssh key rejected ({msg}), re-resolving");
                if let Err(e) = self.keys.forget(ProviderName::Hetzner, &key.fingerprint) {
                    warn!(error = %e, "hetzner: cannot persist ssh key cache");
                }
                let (key, _) = self.ensure_ssh_key(&opts.ssh_public_key).await?;
                self.api.create_server(self.server_request(opts, &key)).await?
            }
            other => other?,
        };

        info!(server_id = %vm.id, name = %vm.name, region = %vm.region, "hetzner: server created");
        Ok(vm)
    }

    async fn get(&self, id: &VmId) -> Result<Vm> {
        self.api.get_server(Self::parse_id(id)?).await
    }

    async fn delete(&self, id: &VmId) -> Result<()> {
        let server_id = match Self::parse_id(id) {
            Ok(server_id) => server_id,
            Err(_) => {
                warn!(server_id = %id, "hetzner: not a server id, nothing to delete");
                return Ok(());
            }
        };

        match self.api.delete_server(server_id).await {
            Ok(()) => {
                info!(server_id = %id, "hetzner: server destroyed");
                Ok(())
            }
            Err(Error::NotFound(_)) => {
                warn!(server_id = %id, "hetzner: server already destroyed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<Vm>> {
        let selector = format!("{}={}", MANAGED_LABEL.0, MANAGED_LABEL.1);
        self.api.list_servers(&selector).await
    }

    async fn wait_ready(&self, id: &VmId, timeout: Duration) -> Result<Vm> {
        self.poller.wait(self, id, timeout).await
    }

    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ready::{POLL_INTERVAL, StaticProbe};
    use crate::types::VmStatus;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKdpcN1C/dAC3FpkWD9aHsS717mrUFJZFnhAAh51FzDk dev@laptop";
    const FP: &str = "18:68:0c:f0:ed:da:f8:99:a7:14:21:00:8f:5d:21:80";

    #[derive(Default)]
    struct FakeState {
        servers: Vec<(Vm, HashMap<String, String>)>,
        keys: Vec<SshKeyRecord>,
        requests: Vec<ServerRequest>,
        key_creates: usize,
        next_id: i64,
    }

    #[derive(Default)]
    struct FakeApi {
        state: Mutex<FakeState>,
    }

    impl FakeApi {
        fn add_foreign_server(&self, name: &str) {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let vm = fake_vm(state.next_id, name);
            state.servers.push((vm, HashMap::new()));
        }
    }

    fn fake_vm(id: i64, name: &str) -> Vm {
        Vm {
            id: VmId(id.to_string()),
            name: name.to_string(),
            status: VmStatus::Provisioning,
            address: Some(format!("10.0.0.{id}")),
            created_at: Utc::now(),
            region: DEFAULT_REGION.into(),
            instance_type: DEFAULT_INSTANCE_TYPE.into(),
        }
    }

    #[async_trait]
    impl HetznerApi for FakeApi {
        async fn create_server(&self, request: ServerRequest) -> Result<Vm> {
            let mut state = self.state.lock().unwrap();
            for key in &request.ssh_keys {
                if !state.keys.iter().any(|k| &k.id == key) {
                    return Err(Error::NotFound(format!("ssh key {key}")));
                }
            }
            if state.servers.iter().any(|(vm, _)| vm.name == request.name) {
                return Err(Error::ProvisionFailed("server name is already used".into()));
            }
            state.next_id += 1;
            let mut vm = fake_vm(state.next_id, &request.name);
            vm.region = request.location.clone();
            vm.instance_type = request.server_type.clone();
            state.servers.push((vm.clone(), request.labels.clone()));
            state.requests.push(request);
            Ok(vm)
        }

        async fn get_server(&self, id: i64) -> Result<Vm> {
            let mut state = self.state.lock().unwrap();
            let (vm, _) = state
                .servers
                .iter_mut()
                .find(|(vm, _)| vm.id.0 == id.to_string())
                .ok_or_else(|| Error::NotFound(format!("server {id}")))?;
            vm.status = VmStatus::Running;
            Ok(vm.clone())
        }

        async fn list_servers(&self, label_selector: &str) -> Result<Vec<Vm>> {
            let (k, v) = label_selector.split_once('=').unwrap();
            let state = self.state.lock().unwrap();
            Ok(state
                .servers
                .iter()
                .filter(|(_, labels)| labels.get(k).map(String::as_str) == Some(v))
                .map(|(vm, _)| vm.clone())
                .collect())
        }

        async fn delete_server(&self, id: i64) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let before = state.servers.len();
            state.servers.retain(|(vm, _)| vm.id.0 != id.to_string());
            if state.servers.len() == before {
                return Err(Error::NotFound(format!("server {id}")));
            }
            Ok(())
        }

        async fn find_ssh_key(&self, fingerprint: &str) -> Result<Option<SshKeyRecord>> {
            let state = self.state.lock().unwrap();
            Ok(state.keys.iter().find(|k| k.fingerprint == fingerprint).cloned())
        }

        async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKeyRecord> {
            let mut state = self.state.lock().unwrap();
            assert!(name.starts_with("sbx-"));
            let fingerprint = keys::md5_fingerprint(public_key)?;
            if state.keys.iter().any(|k| k.fingerprint == fingerprint) {
                return Err(Error::ProvisionFailed("SSH key not unique".into()));
            }
            state.key_creates += 1;
            let record = SshKeyRecord {
                id: format!("{}", 100 + state.key_creates),
                fingerprint,
            };
            state.keys.push(record.clone());
            Ok(record)
        }
    }

    fn settings() -> HetznerSettings {
        HetznerSettings::resolve(&ProviderSettings {
            token: Some("test-token".into()),
            ..Default::default()
        })
        .unwrap()
    }

    fn provider(api: Arc<FakeApi>, keys: Arc<KeyCache>) -> HetznerProvider {
        let poller = ReadyPoller::new(
            Arc::new(ManualClock::new()),
            Arc::new(StaticProbe(true)),
            POLL_INTERVAL,
        );
        HetznerProvider::new(api, settings(), keys).with_poller(poller)
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let s = settings();
        assert_eq!(s.region, "fsn1");
        assert_eq!(s.instance_type, "cx22");
        assert_eq!(s.image, "ubuntu-24.04");

        let s = HetznerSettings::resolve(&ProviderSettings {
            token: Some("t".into()),
            region: Some("hel1".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.region, "hel1");
    }

    #[tokio::test]
    async fn ssh_key_registered_once() {
        let api = Arc::new(FakeApi::default());
        let hetzner = provider(api.clone(), Arc::new(KeyCache::memory()));

        let (first, _) = hetzner.ensure_ssh_key(KEY).await.unwrap();
        let (second, cached) = hetzner.ensure_ssh_key(KEY).await.unwrap();

        assert_eq!(first, second);
        assert!(cached);
        assert_eq!(first.fingerprint, FP);
        assert_eq!(api.state.lock().unwrap().key_creates, 1);
    }

    #[tokio::test]
    async fn existing_remote_key_is_reused() {
        let api = Arc::new(FakeApi::default());
        api.state.lock().unwrap().keys.push(SshKeyRecord {
            id: "7".into(),
            fingerprint: FP.into(),
        });
        let hetzner = provider(api.clone(), Arc::new(KeyCache::memory()));

        let (record, cached) = hetzner.ensure_ssh_key(KEY).await.unwrap();
        assert_eq!(record.id, "7");
        assert!(!cached);
        assert_eq!(api.state.lock().unwrap().key_creates, 0);
    }

    #[tokio::test]
    async fn create_labels_server_and_applies_defaults() {
        let api = Arc::new(FakeApi::default());
        let hetzner = provider(api.clone(), Arc::new(KeyCache::memory()));

        let mut opts = CreateOptions::new("brave-lynx", KEY);
        opts.region = Some("nbg1".into());
        let vm = hetzner.create(&opts).await.unwrap();
        assert_eq!(vm.name, "brave-lynx");
        assert_eq!(vm.region, "nbg1");

        let state = api.state.lock().unwrap();
        let request = &state.requests[0];
        assert_eq!(request.server_type, "cx22");
        assert_eq!(request.image, "ubuntu-24.04");
        assert_eq!(request.labels.get("managed-by").map(String::as_str), Some("sbx"));
        assert!(request.user_data.contains("/var/lib/sbx/boot-finished"));
    }

    #[tokio::test]
    async fn stale_cached_key_is_re_registered() {
        let api = Arc::new(FakeApi::default());
        let cache = Arc::new(KeyCache::memory());
        cache
            .insert(
                ProviderName::Hetzner,
                SshKeyRecord {
                    id: "999".into(),
                    fingerprint: FP.into(),
                },
            )
            .unwrap();
        let hetzner = provider(api.clone(), cache.clone());

        hetzner.create(&CreateOptions::new("calm-seal", KEY)).await.unwrap();

        assert_eq!(api.state.lock().unwrap().key_creates, 1);
        assert_ne!(cache.get(ProviderName::Hetzner, FP).unwrap().id, "999");
    }

    #[tokio::test]
    async fn list_only_returns_managed_servers() {
        let api = Arc::new(FakeApi::default());
        api.add_foreign_server("someone-elses-db");
        let hetzner = provider(api.clone(), Arc::new(KeyCache::memory()));
        hetzner.create(&CreateOptions::new("tidy-wren", KEY)).await.unwrap();

        let names: Vec<_> = hetzner.list().await.unwrap().into_iter().map(|vm| vm.name).collect();
        assert_eq!(names, vec!["tidy-wren"]);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let api = Arc::new(FakeApi::default());
        let hetzner = provider(api, Arc::new(KeyCache::memory()));
        let vm = hetzner.create(&CreateOptions::new("gone-gull", KEY)).await.unwrap();

        hetzner.delete(&vm.id).await.unwrap();
        hetzner.delete(&vm.id).await.unwrap();
        hetzner.delete(&VmId("not-a-number".into())).await.unwrap();
        assert!(matches!(hetzner.get(&vm.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn wait_ready_uses_poller() {
        let api = Arc::new(FakeApi::default());
        let hetzner = provider(api, Arc::new(KeyCache::memory()));
        let vm = hetzner.create(&CreateOptions::new("keen-mole", KEY)).await.unwrap();
        assert_eq!(vm.status, VmStatus::Provisioning);

        let ready = hetzner.wait_ready(&vm.id, Duration::from_secs(60)).await.unwrap();
        assert_eq!(ready.status, VmStatus::Running);
    }

    #[tokio::test]
    async fn get_with_malformed_id_is_not_found() {
        let api = Arc::new(FakeApi::default());
        let hetzner = provider(api, Arc::new(KeyCache::memory()));
        assert!(matches!(
            hetzner.get(&VmId("abc".into())).await,
            Err(Error::NotFound(_))
        ));
    }
}
