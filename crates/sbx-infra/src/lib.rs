pub mod boot;
pub mod clock;
pub mod hetzner;
pub mod keys;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod ready;
pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{CreateOptions, Vm, VmId};

/// Closed set of provider failures. Vendor-specific errors are mapped into
/// these variants at the provider boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider authentication failed: {0}")]
    AuthFailed(String),

    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("vm {id} not ready after {}s", .waited.as_secs())]
    Timeout { id: String, waited: Duration },

    #[error("provider backend error: {0}")]
    Backend(String),

    #[error("provider configuration error: {0}")]
    Config(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known VM provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    Hetzner,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hetzner => "hetzner",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hetzner" => Ok(Self::Hetzner),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Per-provider settings as they appear in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Backend-agnostic VM lifecycle contract.
///
/// Each vendor implements this trait and owns its own configuration.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Create and boot a VM. Fails with `ProvisionFailed`, `AuthFailed` or `QuotaExceeded`.
    async fn create(&self, opts: &CreateOptions) -> Result<Vm>;

    /// Fetch a fresh snapshot of one VM. Fails with `NotFound`.
    async fn get(&self, id: &VmId) -> Result<Vm>;

    /// Destroy a VM. Deleting a VM that is already gone succeeds.
    async fn delete(&self, id: &VmId) -> Result<()>;

    /// All VMs this tool manages, read from the backend on every call.
    async fn list(&self) -> Result<Vec<Vm>>;

    /// Poll until the VM is running and its SSH port accepts connections.
    ///
    /// On `Timeout` the VM is left running.
    async fn wait_ready(&self, id: &VmId, timeout: Duration) -> Result<Vm>;

    fn name(&self) -> ProviderName;
}

/// Registry of configured providers, built once at startup and passed to
/// command handlers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider, replacing any previous one with the same name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: ProviderName) -> Result<&Arc<dyn Provider>> {
        self.providers
            .get(&name)
            .ok_or_else(|| Error::UnknownProvider(format!("{name} is not configured")))
    }

    /// Names of all registered providers, sorted.
    pub fn available(&self) -> Vec<ProviderName> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Build every provider that has usable settings.
///
/// Providers with missing credentials are skipped with a debug log.
/// Returns an error only if no provider could be constructed at all.
pub fn build_providers(
    settings: &BTreeMap<ProviderName, ProviderSettings>,
    keys: Arc<keys::KeyCache>,
) -> Result<ProviderRegistry> {
    dotenvy::dotenv().ok();

    let mut registry = ProviderRegistry::new();

    let hetzner_settings = settings
        .get(&ProviderName::Hetzner)
        .cloned()
        .unwrap_or_default();
    match hetzner::HetznerProvider::from_settings(&hetzner_settings, keys) {
        Ok(p) => {
            tracing::info!("registered Hetzner Cloud provider");
            registry.register(Arc::new(p));
        }
        Err(e) => tracing::debug!("skipping Hetzner provider: {e}"),
    }

    if registry.is_empty() {
        return Err(Error::Config(
            "no providers configured (run `sbx init` or set HETZNER_API_TOKEN)".into(),
        ));
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;

    #[test]
    fn provider_name_round_trips_through_str() {
        let name: ProviderName = "hetzner".parse().unwrap();
        assert_eq!(name, ProviderName::Hetzner);
        assert_eq!(name.to_string(), "hetzner");
        assert!(matches!(
            "digitalocean".parse::<ProviderName>(),
            Err(Error::UnknownProvider(_))
        ));
    }

    #[test]
    fn registry_lookup() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.get(ProviderName::Hetzner).is_err());

        registry.register(Arc::new(MemoryProvider::new()));
        assert_eq!(registry.available(), vec![ProviderName::Hetzner]);
        assert_eq!(registry.get(ProviderName::Hetzner).unwrap().name(), ProviderName::Hetzner);
    }

    #[test]
    fn settings_parse_from_yaml_shaped_json() {
        let raw = r#"{"hetzner": {"token": "t", "region": "nbg1"}}"#;
        let parsed: BTreeMap<ProviderName, ProviderSettings> = serde_json::from_str(raw).unwrap();
        let hetzner = &parsed[&ProviderName::Hetzner];
        assert_eq!(hetzner.token.as_deref(), Some("t"));
        assert_eq!(hetzner.region.as_deref(), Some("nbg1"));
        assert!(hetzner.image.is_none());
    }
}
