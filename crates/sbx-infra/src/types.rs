use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque provider-side VM identifier (e.g. a Hetzner server id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(pub String);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input to `Provider::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub name: String,
    /// Public key line (`<algorithm> <base64>`) authorised on the new VM.
    pub ssh_public_key: String,
    pub region: Option<String>,
    pub instance_type: Option<String>,
    pub image: Option<String>,
    /// First-boot script. Providers fall back to a default `BootScript` when absent.
    pub boot_script: Option<String>,
}

impl CreateOptions {
    pub fn new(name: impl Into<String>, ssh_public_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ssh_public_key: ssh_public_key.into(),
            region: None,
            instance_type: None,
            image: None,
            boot_script: None,
        }
    }
}

/// Read-only snapshot of a VM as reported by its provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vm {
    pub id: VmId,
    pub name: String,
    pub status: VmStatus,
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub region: String,
    pub instance_type: String,
}

/// Provider-reported VM state.
///
/// States only move forward (`Provisioning -> Running -> Stopped -> Deleted`);
/// `Failed` is terminal and reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Provisioning,
    Running,
    Stopped,
    Deleted,
    Failed,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted | Self::Failed)
    }

    pub fn can_transition_to(&self, next: VmStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        next == Self::Failed || next.rank() >= self.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Provisioning => 0,
            Self::Running => 1,
            Self::Stopped => 2,
            Self::Deleted => 3,
            Self::Failed => 4,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
