//! Cross-check local sessions against live provider state.
//!
//! Providers are listed outside the store lock. The resulting plan is then
//! applied inside a single transaction against a fresh read of the file, so
//! sessions added concurrently are never clobbered.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use sbx_infra::types::{Vm, VmId, VmStatus};
use sbx_infra::{ProviderName, ProviderRegistry};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::models::{Session, SessionSet, SessionStatus};
use crate::store::SessionStore;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// A VM with the session's name exists under a different provider id.
    Recreated,
    /// The VM's name is already used by a session on another provider.
    NameTaken,
}

/// Local and remote state disagree in a way reconciliation refuses to guess about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub session: String,
    pub provider: ProviderName,
    /// Provider id the local record points at, if any.
    pub local_id: Option<VmId>,
    pub remote_id: VmId,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConflictKind::Recreated => write!(
                f,
                "session '{}' points at {} server {}, but a server with that name now has id {}",
                self.session,
                self.provider,
                self.local_id.as_ref().map(|id| id.0.as_str()).unwrap_or("?"),
                self.remote_id
            ),
            ConflictKind::NameTaken => write!(
                f,
                "{} server {} is named '{}', which another provider's session already uses",
                self.provider, self.remote_id, self.session
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub refreshed: Vec<String>,
    pub removed: Vec<String>,
    pub recovered: Vec<String>,
    pub conflicts: Vec<Conflict>,
    /// Providers whose listing failed; their sessions were left untouched.
    pub skipped: Vec<(ProviderName, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.skipped.is_empty()
    }

    /// Turn recorded conflicts into an error for callers that need a
    /// consistent view.
    pub fn into_result(self) -> Result<Self> {
        if self.conflicts.is_empty() {
            return Ok(self);
        }
        let detail = self
            .conflicts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::ReconciliationConflict(detail))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Refresh {
        provider: ProviderName,
        provider_id: VmId,
        status: SessionStatus,
        address: Option<String>,
    },
    Remove {
        provider: ProviderName,
        provider_id: VmId,
    },
    Recover(Session),
}

#[derive(Debug, Default)]
struct Plan {
    changes: Vec<Change>,
    conflicts: Vec<Conflict>,
}

/// Reconcile the store against every registered provider and return the
/// resulting sessions.
pub async fn reconcile(
    store: &SessionStore,
    registry: &ProviderRegistry,
) -> Result<(Vec<Session>, ReconcileReport)> {
    let snapshot = store.list()?;

    let available: HashSet<_> = registry.available().into_iter().collect();
    for session in snapshot.iter().filter(|s| !available.contains(&s.provider)) {
        debug!(session = %session.id, provider = %session.provider, "provider not configured, leaving session as is");
    }

    let mut remote = BTreeMap::new();
    let mut skipped = Vec::new();
    for name in registry.available() {
        let provider = registry.get(name)?;
        match provider.list().await {
            Ok(vms) => {
                remote.insert(name, vms);
            }
            Err(e) => {
                warn!(provider = %name, error = %e, "cannot list VMs, skipping reconciliation");
                skipped.push((name, e.to_string()));
            }
        }
    }

    let plan = plan(&snapshot, &remote);
    let mut report = store.transaction(|set| Ok(apply(set, &plan.changes)))?;
    report.conflicts = plan.conflicts;
    report.skipped = skipped;

    for conflict in &report.conflicts {
        warn!("{conflict}");
    }
    if !report.removed.is_empty() || !report.recovered.is_empty() {
        info!(
            removed = report.removed.len(),
            recovered = report.recovered.len(),
            "sessions reconciled"
        );
    }

    Ok((store.list()?, report))
}

fn plan(sessions: &[Session], remote: &BTreeMap<ProviderName, Vec<Vm>>) -> Plan {
    let mut plan = Plan::default();

    for (&provider, vms) in remote {
        let vms: Vec<&Vm> = vms.iter().filter(|vm| vm.status != VmStatus::Deleted).collect();
        let local: Vec<&Session> = sessions.iter().filter(|s| s.provider == provider).collect();
        let mut conflicted: HashSet<&VmId> = HashSet::new();

        for session in &local {
            if let Some(vm) = vms.iter().find(|vm| vm.id == session.provider_id) {
                let remote_status = SessionStatus::from_vm(vm.status).unwrap_or(session.status);
                let status = if session.status.can_transition_to(remote_status) {
                    remote_status
                } else {
                    warn!(
                        session = %session.id,
                        local = %session.status,
                        remote = %remote_status,
                        "provider reports an earlier state, keeping local status"
                    );
                    session.status
                };
                if status != session.status || vm.address != session.address {
                    plan.changes.push(Change::Refresh {
                        provider,
                        provider_id: vm.id.clone(),
                        status,
                        address: vm.address.clone(),
                    });
                }
            } else if let Some(vm) = vms.iter().find(|vm| session.matches_id(&vm.name)) {
                conflicted.insert(&vm.id);
                plan.conflicts.push(Conflict {
                    kind: ConflictKind::Recreated,
                    session: session.id.clone(),
                    provider,
                    local_id: Some(session.provider_id.clone()),
                    remote_id: vm.id.clone(),
                });
            } else {
                plan.changes.push(Change::Remove {
                    provider,
                    provider_id: session.provider_id.clone(),
                });
            }
        }

        for vm in &vms {
            if conflicted.contains(&vm.id) || local.iter().any(|s| s.provider_id == vm.id) {
                continue;
            }
            if let Some(other) = sessions
                .iter()
                .find(|s| s.provider != provider && s.matches_id(&vm.name))
            {
                plan.conflicts.push(Conflict {
                    kind: ConflictKind::NameTaken,
                    session: other.id.clone(),
                    provider,
                    local_id: None,
                    remote_id: vm.id.clone(),
                });
                continue;
            }
            if let Some(session) = Session::recovered(provider, vm) {
                plan.changes.push(Change::Recover(session));
            }
        }
    }

    plan
}

/// Apply `changes` to a fresh read of the session file. Each change is
/// re-validated so records created since the listing are left alone.
fn apply(set: &mut SessionSet, changes: &[Change]) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for change in changes {
        match change {
            Change::Refresh {
                provider,
                provider_id,
                status,
                address,
            } => {
                if let Some(session) = set
                    .sessions
                    .iter_mut()
                    .find(|s| s.provider == *provider && &s.provider_id == provider_id)
                {
                    if session.status.can_transition_to(*status) {
                        session.status = *status;
                    }
                    session.address = address.clone();
                    report.refreshed.push(session.id.clone());
                }
            }
            Change::Remove {
                provider,
                provider_id,
            } => {
                if let Some(idx) = set
                    .sessions
                    .iter()
                    .position(|s| s.provider == *provider && &s.provider_id == provider_id)
                {
                    let session = set.sessions.remove(idx);
                    info!(session = %session.id, provider_id = %provider_id, "vm gone, session removed");
                    report.removed.push(session.id);
                }
            }
            Change::Recover(session) => {
                let exists = set.get(&session.id).is_some()
                    || set
                        .find_by_provider_id(session.provider, &session.provider_id)
                        .is_some();
                if !exists {
                    info!(session = %session.id, provider_id = %session.provider_id, "recovered session for untracked vm");
                    report.recovered.push(session.id.clone());
                    set.sessions.push(session.clone());
                }
            }
        }
    }

    report
}
