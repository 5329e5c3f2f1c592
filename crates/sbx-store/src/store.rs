//! `sessions.json` with flock-guarded read-modify-write and atomic replace.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::models::{FILE_VERSION, Session, SessionSet, SessionStatus};
use crate::{Error, Result};

pub const SESSIONS_FILE: &str = "sessions.json";

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SESSIONS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of all sessions under a shared lock.
    pub fn list(&self) -> Result<Vec<Session>> {
        let _guard = self.lock(FlockArg::LockShared)?;
        Ok(self.read()?.sessions)
    }

    /// Case-insensitive lookup.
    pub fn get(&self, id: &str) -> Result<Session> {
        let _guard = self.lock(FlockArg::LockShared)?;
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Run `f` against the current file contents under an exclusive lock and
    /// write the result back if `f` succeeds and changed anything.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut SessionSet) -> Result<T>) -> Result<T> {
        let _guard = self.lock(FlockArg::LockExclusive)?;
        let before = self.read()?;
        let mut set = before.clone();
        let out = f(&mut set)?;
        if set != before {
            self.write(&set)?;
        }
        Ok(out)
    }

    /// Insert a new session.
    ///
    /// A record with the same provider id (typically one reconciliation
    /// recovered moments earlier) is replaced; any other record with the same
    /// name is a `Duplicate`.
    pub fn add(&self, session: Session) -> Result<()> {
        self.transaction(|set| {
            set.sessions.retain(|s| {
                !(s.provider == session.provider && s.provider_id == session.provider_id)
            });
            if set.get(&session.id).is_some() {
                return Err(Error::Duplicate(session.id.clone()));
            }
            debug!(session = %session.id, provider_id = %session.provider_id, "session recorded");
            set.sessions.push(session);
            Ok(())
        })
    }

    pub fn update_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        self.update(id, |s| s.status = status)
    }

    pub fn set_address(&self, id: &str, address: Option<String>) -> Result<Session> {
        self.update(id, |s| s.address = address)
    }

    /// Mutate one record. The provider binding is fixed for the record's
    /// lifetime and status only moves forward; an update breaking either is
    /// rejected and nothing is written.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut Session)) -> Result<Session> {
        self.transaction(|set| {
            let session = set
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let before = session.clone();
            f(session);
            if session.provider != before.provider || session.provider_id != before.provider_id {
                return Err(Error::InvalidUpdate(format!(
                    "'{}' is bound to {} server {}",
                    before.id, before.provider, before.provider_id
                )));
            }
            if !before.status.can_transition_to(session.status) {
                return Err(Error::InvalidUpdate(format!(
                    "'{}' cannot go from {} back to {}",
                    before.id, before.status, session.status
                )));
            }
            Ok(session.clone())
        })
    }

    pub fn remove(&self, id: &str) -> Result<Session> {
        self.transaction(|set| set.remove(id).ok_or_else(|| Error::NotFound(id.to_string())))
    }

    fn lock(&self, arg: FlockArg) -> Result<Flock<File>> {
        if let Some(dir) = self.lock_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&self.lock_path)?;
        Flock::lock(file, arg).map_err(|(_, errno)| {
            Error::Lock(format!("{}: {errno}", self.lock_path.display()))
        })
    }

    fn read(&self) -> Result<SessionSet> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionSet::default()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(SessionSet::default());
        }
        let set: SessionSet = serde_json::from_slice(&bytes)?;
        if set.version != FILE_VERSION {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported session file version {}", set.version),
            )));
        }
        Ok(set)
    }

    fn write(&self, set: &SessionSet) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        serde_json::to_writer_pretty(&mut tmp, set)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use sbx_infra::ProviderName;
    use sbx_infra::types::VmId;

    use super::*;

    fn session(id: &str, provider_id: &str) -> Session {
        Session {
            id: id.into(),
            status: SessionStatus::Provisioning,
            created_at: Utc::now(),
            timeout_secs: None,
            provider: ProviderName::Hetzner,
            provider_id: VmId(provider_id.into()),
            address: None,
            template: None,
            recovered: false,
        }
    }

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::in_dir(dir.path());
        (dir, store)
    }

    #[test]
    fn missing_file_is_empty() {
        let (_dir, store) = store();
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(store.get("x"), Err(Error::NotFound(_))));
    }

    #[test]
    fn get_is_case_insensitive() {
        let (_dir, store) = store();
        store.add(session("Swift-Tiger", "1")).unwrap();

        let lower = store.get("swift-tiger").unwrap();
        let upper = store.get("SWIFT-TIGER").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.id, "Swift-Tiger");
    }

    #[test]
    fn duplicate_names_rejected_ignoring_case() {
        let (_dir, store) = store();
        store.add(session("swift-tiger", "1")).unwrap();
        let err = store.add(session("SWIFT-tiger", "2")).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn add_claims_recovered_record_for_same_vm() {
        let (_dir, store) = store();
        let mut recovered = session("swift-tiger", "1");
        recovered.recovered = true;
        store.add(recovered).unwrap();

        store.add(session("swift-tiger", "1").with_template("rust")).unwrap();
        let sessions = store.list().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].recovered);
        assert_eq!(sessions[0].template.as_deref(), Some("rust"));
    }

    #[test]
    fn update_and_remove() {
        let (_dir, store) = store();
        store.add(session("calm-seal", "9")).unwrap();

        store.update_status("CALM-SEAL", SessionStatus::Running).unwrap();
        let updated = store.set_address("calm-seal", Some("192.0.2.9".into())).unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert_eq!(updated.address.as_deref(), Some("192.0.2.9"));

        store.remove("calm-seal").unwrap();
        assert!(matches!(store.remove("calm-seal"), Err(Error::NotFound(_))));
    }

    #[test]
    fn status_cannot_move_backwards() {
        let (_dir, store) = store();
        store.add(session("calm-seal", "9")).unwrap();
        store.update_status("calm-seal", SessionStatus::Running).unwrap();

        let err = store.update_status("calm-seal", SessionStatus::Provisioning).unwrap_err();
        assert!(matches!(err, Error::InvalidUpdate(_)));
        store.update_status("calm-seal", SessionStatus::Failed).unwrap();
        assert!(store.update_status("calm-seal", SessionStatus::Running).is_err());
        assert_eq!(store.get("calm-seal").unwrap().status, SessionStatus::Failed);
    }

    #[test]
    fn provider_binding_is_fixed() {
        let (_dir, store) = store();
        store.add(session("calm-seal", "9")).unwrap();

        let err = store
            .update("calm-seal", |s| s.provider_id = VmId("10".into()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUpdate(_)));
        assert_eq!(store.get("calm-seal").unwrap().provider_id, VmId("9".into()));
    }

    #[test]
    fn file_is_private_and_versioned() {
        let (_dir, store) = store();
        store.add(session("tidy-wren", "3")).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["sessions"][0]["id"], "tidy-wren");
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let (_dir, store) = store();
        store.add(session("keep-me", "1")).unwrap();

        let res: Result<()> = store.transaction(|set| {
            set.sessions.clear();
            Err(Error::Lock("abort".into()))
        });
        assert!(res.is_err());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let (_dir, store) = store();
        std::fs::write(store.path(), b"{\"version\":1,\"sessions\":[{").unwrap();
        assert!(matches!(store.list(), Err(Error::Json(_))));
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.add(session(&format!("box-{i}"), &i.to_string())).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.list().unwrap().len(), 8);
    }
}
