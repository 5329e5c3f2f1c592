use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sbx_infra::ProviderName;
use sbx_infra::types::{Vm, VmId, VmStatus};
use serde::{Deserialize, Serialize};

pub const FILE_VERSION: u32 = 1;

// ── Session ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Provisioning,
    Running,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Session status for a VM state. `Deleted` has no session counterpart.
    pub fn from_vm(status: VmStatus) -> Option<Self> {
        match status {
            VmStatus::Provisioning => Some(Self::Provisioning),
            VmStatus::Running => Some(Self::Running),
            VmStatus::Stopped => Some(Self::Stopped),
            VmStatus::Failed => Some(Self::Failed),
            VmStatus::Deleted => None,
        }
    }

    pub fn to_vm(self) -> VmStatus {
        match self {
            Self::Provisioning => VmStatus::Provisioning,
            Self::Running => VmStatus::Running,
            Self::Stopped => VmStatus::Stopped,
            Self::Failed => VmStatus::Failed,
        }
    }

    /// Same forward-only rule as the VM state: no step backwards, and
    /// `Failed` never changes.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        self.to_vm().can_transition_to(next.to_vm())
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local record of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Sandbox name; unique within the store ignoring case.
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub provider: ProviderName,
    /// Fixed for the life of the session.
    pub provider_id: VmId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Synthesized by reconciliation rather than created by this tool.
    #[serde(default)]
    pub recovered: bool,
}

impl Session {
    /// Record for a VM that `Provider::create` just returned.
    pub fn provisioning(provider: ProviderName, vm: &Vm) -> Self {
        Self {
            id: vm.name.clone(),
            status: SessionStatus::Provisioning,
            created_at: vm.created_at,
            timeout_secs: None,
            provider,
            provider_id: vm.id.clone(),
            address: vm.address.clone(),
            template: None,
            recovered: false,
        }
    }

    /// Record for a live VM that had no local counterpart.
    pub fn recovered(provider: ProviderName, vm: &Vm) -> Option<Self> {
        Some(Self {
            id: vm.name.clone(),
            status: SessionStatus::from_vm(vm.status)?,
            created_at: vm.created_at,
            timeout_secs: None,
            provider,
            provider_id: vm.id.clone(),
            address: vm.address.clone(),
            template: None,
            recovered: true,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.timeout_secs?).ok()?;
        self.created_at
            .checked_add_signed(chrono::Duration::try_seconds(secs)?)
    }

    pub fn matches_id(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }
}

// ── Session file ────────────────────────────────────────────────────

/// On-disk shape of `sessions.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSet {
    pub version: u32,
    pub sessions: Vec<Session>,
}

impl Default for SessionSet {
    fn default() -> Self {
        Self {
            version: FILE_VERSION,
            sessions: Vec::new(),
        }
    }
}

impl SessionSet {
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.matches_id(id))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.matches_id(id))
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let idx = self.sessions.iter().position(|s| s.matches_id(id))?;
        Some(self.sessions.remove(idx))
    }

    pub fn find_by_provider_id(&self, provider: ProviderName, provider_id: &VmId) -> Option<&Session> {
        self.sessions
            .iter()
            .find(|s| s.provider == provider && &s.provider_id == provider_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Session {
        Session {
            id: id.into(),
            status: SessionStatus::Running,
            created_at: "2026-01-02T03:04:05Z".parse().unwrap(),
            timeout_secs: None,
            provider: ProviderName::Hetzner,
            provider_id: VmId("42".into()),
            address: Some("192.0.2.7".into()),
            template: None,
            recovered: false,
        }
    }

    #[test]
    fn status_moves_forward_only() {
        use SessionStatus::*;
        assert!(Provisioning.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Provisioning));
        assert!(!Stopped.can_transition_to(Provisioning));
        assert!(!Failed.can_transition_to(Running));
    }

    #[test]
    fn expires_at_adds_timeout() {
        let s = session("a").with_timeout(Duration::from_secs(3600));
        assert_eq!(
            s.expires_at().unwrap().to_rfc3339(),
            "2026-01-02T04:04:05+00:00"
        );
        assert!(session("a").expires_at().is_none());
    }

    #[test]
    fn serialized_shape() {
        let set = SessionSet {
            version: FILE_VERSION,
            sessions: vec![session("swift-tiger")],
        };
        let json: serde_json::Value = serde_json::to_value(&set).unwrap();
        assert_eq!(json["version"], 1);
        let s = &json["sessions"][0];
        assert_eq!(s["id"], "swift-tiger");
        assert_eq!(s["status"], "running");
        assert_eq!(s["provider"], "hetzner");
        assert_eq!(s["provider_id"], "42");
        assert!(s.get("template").is_none());
    }

    #[test]
    fn lookups_ignore_case() {
        let mut set = SessionSet::default();
        set.sessions.push(session("Swift-Tiger"));
        assert!(set.get("swift-tiger").is_some());
        assert!(set.get_mut("SWIFT-TIGER").is_some());
        assert!(set.remove("sWiFt-TiGeR").is_some());
        assert!(set.sessions.is_empty());
    }

    #[test]
    fn deleted_vm_has_no_session_status() {
        assert_eq!(SessionStatus::from_vm(VmStatus::Deleted), None);
        assert_eq!(
            SessionStatus::from_vm(VmStatus::Running),
            Some(SessionStatus::Running)
        );
    }
}
