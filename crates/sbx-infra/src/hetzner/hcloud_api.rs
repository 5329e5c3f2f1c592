use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hcloud::apis::configuration::Configuration;
use hcloud::apis::{servers_api, ssh_keys_api};
use hcloud::models;
use tracing::warn;

use super::{HetznerApi, ServerRequest};
use crate::keys::SshKeyRecord;
use crate::types::{Vm, VmId, VmStatus};
use crate::{Error, Result};

const PAGE_SIZE: i64 = 50;

/// `HetznerApi` on top of the `hcloud` crate.
pub struct HcloudApi {
    config: Configuration,
}

impl HcloudApi {
    pub fn new(token: &str) -> Self {
        let mut config = Configuration::new();
        config.bearer_access_token = Some(token.to_string());
        Self { config }
    }
}

#[async_trait]
impl HetznerApi for HcloudApi {
    async fn create_server(&self, request: ServerRequest) -> Result<Vm> {
        let resp = servers_api::create_server(
            &self.config,
            servers_api::CreateServerParams {
                create_server_request: models::CreateServerRequest {
                    name: request.name,
                    server_type: request.server_type,
                    image: request.image,
                    location: Some(request.location),
                    user_data: Some(request.user_data),
                    networks: None,
                    firewalls: None,
                    ssh_keys: Some(request.ssh_keys),
                    volumes: None,
                    start_after_create: Some(true),
                    automount: None,
                    datacenter: None,
                    labels: Some(request.labels),
                    placement_group: None,
                    public_net: None,
                },
            },
        )
        .await
        .map_err(|e| api_error("create server", e, true))?;

        Ok(to_vm(&resp.server))
    }

    async fn get_server(&self, id: i64) -> Result<Vm> {
        let resp = servers_api::get_server(&self.config, servers_api::GetServerParams { id })
            .await
            .map_err(|e| api_error("get server", e, false))?;

        resp.server
            .map(|server| to_vm(&server))
            .ok_or_else(|| Error::NotFound(format!("server {id}")))
    }

    async fn list_servers(&self, label_selector: &str) -> Result<Vec<Vm>> {
        let mut vms = Vec::new();
        let mut page = 1;
        loop {
            let resp = servers_api::list_servers(
                &self.config,
                servers_api::ListServersParams {
                    label_selector: Some(label_selector.to_string()),
                    page: Some(page),
                    per_page: Some(PAGE_SIZE),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| api_error("list servers", e, false))?;

            let count = resp.servers.len() as i64;
            vms.extend(resp.servers.iter().map(to_vm));
            if count < PAGE_SIZE {
                return Ok(vms);
            }
            page += 1;
        }
    }

    async fn delete_server(&self, id: i64) -> Result<()> {
        servers_api::delete_server(&self.config, servers_api::DeleteServerParams { id })
            .await
            .map_err(|e| api_error("delete server", e, false))?;
        Ok(())
    }

    async fn find_ssh_key(&self, fingerprint: &str) -> Result<Option<SshKeyRecord>> {
        let resp = ssh_keys_api::list_ssh_keys(
            &self.config,
            ssh_keys_api::ListSshKeysParams {
                fingerprint: Some(fingerprint.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| api_error("list ssh keys", e, false))?;

        Ok(resp.ssh_keys.first().map(|key| SshKeyRecord {
            id: key.id.to_string(),
            fingerprint: key.fingerprint.clone(),
        }))
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<SshKeyRecord> {
        let resp = ssh_keys_api::create_ssh_key(
            &self.config,
            ssh_keys_api::CreateSshKeyParams {
                create_ssh_key_request: models::CreateSshKeyRequest {
                    name: name.to_string(),
                    public_key: public_key.to_string(),
                    labels: None,
                },
            },
        )
        .await
        .map_err(|e| api_error("create ssh key", e, false))?;

        Ok(SshKeyRecord {
            id: resp.ssh_key.id.to_string(),
            fingerprint: resp.ssh_key.fingerprint.clone(),
        })
    }
}

fn api_error<T: std::fmt::Debug>(context: &str, e: hcloud::apis::Error<T>, creating: bool) -> Error {
    match e {
        hcloud::apis::Error::ResponseError(resp) => {
            classify(resp.status.as_u16(), &resp.content, creating, context)
        }
        other => Error::Backend(format!("{context}: {other}")),
    }
}

/// Map a Hetzner error response onto the provider error taxonomy.
///
/// Hetzner bodies look like `{"error": {"code": "...", "message": "..."}}`;
/// the code is authoritative, the HTTP status is the fallback.
fn classify(status: u16, body: &str, creating: bool, context: &str) -> Error {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/code"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(|v| v.as_str())
        .unwrap_or(body);
    let detail = format!("{context}: {message}");

    match (code, status) {
        ("resource_limit_exceeded", _) => Error::QuotaExceeded(detail),
        ("unauthorized", _) | ("forbidden", _) | (_, 401) | (_, 403) => Error::AuthFailed(detail),
        ("not_found", _) | (_, 404) => Error::NotFound(detail),
        ("rate_limit_exceeded", _) | (_, 429) => Error::Backend(detail),
        (_, 500..) => Error::Backend(detail),
        _ if creating => Error::ProvisionFailed(detail),
        _ => Error::Backend(detail),
    }
}

fn to_vm(server: &models::Server) -> Vm {
    let created_at = DateTime::parse_from_rfc3339(&server.created)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!(server_id = server.id, error = %e, "hetzner: unparseable creation time");
            Utc::now()
        });

    Vm {
        id: VmId(server.id.to_string()),
        name: server.name.clone(),
        status: parse_status(&server.status),
        address: server.public_net.ipv4.as_ref().map(|v| v.ip.clone()),
        created_at,
        region: server.datacenter.location.name.clone(),
        instance_type: server.server_type.name.clone(),
    }
}

fn parse_status(status: &models::server::Status) -> VmStatus {
    match status {
        models::server::Status::Running => VmStatus::Running,
        models::server::Status::Off | models::server::Status::Stopping => VmStatus::Stopped,
        models::server::Status::Deleting => VmStatus::Deleted,
        _ => VmStatus::Provisioning,
    }
}
