use std::path::Path;
use std::sync::Arc;

use sbx_infra::ProviderRegistry;
use sbx_infra::keys::KeyCache;
use sbx_ssh::ConnectOptions;
use sbx_store::{Session, SessionStore};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::CliError;
use crate::provision::SshConnector;
use crate::template::TemplateStore;

pub const KEY_CACHE_FILE: &str = "ssh-keys.json";

/// Everything a command handler needs, built once per invocation.
pub struct AppState {
    pub config: Config,
    pub providers: ProviderRegistry,
    pub store: SessionStore,
    pub templates: TemplateStore,
}

impl AppState {
    /// Load config and build providers. With `require_providers` unset a
    /// registry that cannot be built is replaced by an empty one, which is
    /// enough for commands that only talk SSH.
    pub fn load(config_dir: &Path, require_providers: bool) -> Result<Self, CliError> {
        let config = Config::load(config_dir)?;
        let keys = Arc::new(KeyCache::load(config_dir.join(KEY_CACHE_FILE)));

        let providers = match sbx_infra::build_providers(&config.providers, keys) {
            Ok(providers) => {
                info!(providers = ?providers.available(), "providers ready");
                providers
            }
            Err(e) if !require_providers => {
                debug!(error = %e, "continuing without providers");
                ProviderRegistry::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            store: SessionStore::in_dir(config_dir),
            templates: TemplateStore::in_config_dir(config_dir),
            config,
            providers,
        })
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::default()
    }

    pub fn connector(&self) -> SshConnector {
        SshConnector {
            user: self.config.ssh_user.clone(),
            key: self.config.ssh_key.clone(),
            options: self.connect_options(),
        }
    }

    /// Address to SSH into, asking the provider when the record has none.
    pub async fn address(&self, session: &Session) -> Result<String, CliError> {
        if let Some(address) = &session.address {
            return Ok(address.clone());
        }
        let provider = self.providers.get(session.provider)?;
        let vm = provider.get(&session.provider_id).await?;
        let address = vm.address.ok_or_else(|| CliError::NotReady {
            session: session.id.clone(),
            reason: "no address assigned yet".into(),
        })?;
        self.store.set_address(&session.id, Some(address.clone()))?;
        Ok(address)
    }
}
