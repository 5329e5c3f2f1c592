//! Provider-side SSH key registration bookkeeping.
//!
//! Keys are identified by their MD5 colon fingerprint (the format Hetzner
//! reports) and registered under a deterministic name, so registering the
//! same public key twice resolves to the same provider record.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, ProviderName, Result};

/// A public key as registered with a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyRecord {
    pub id: String,
    pub fingerprint: String,
}

/// MD5 fingerprint of an OpenSSH public key line, as `aa:bb:...`.
pub fn md5_fingerprint(public_key: &str) -> Result<String> {
    let blob = public_key
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::Config(format!("malformed public key: {public_key:?}")))?;
    let raw = STANDARD
        .decode(blob)
        .map_err(|e| Error::Config(format!("public key is not valid base64: {e}")))?;

    let digest = Md5::digest(&raw);
    Ok(digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Provider-side name for a key: `sbx-` plus the first 12 hex digits of its fingerprint.
pub fn key_name(fingerprint: &str) -> String {
    let hex: String = fingerprint.chars().filter(|c| *c != ':').take(12).collect();
    format!("sbx-{hex}")
}

/// Resolved key registrations, keyed by provider and fingerprint.
///
/// Backed by a JSON file when loaded from disk; memory-only otherwise.
#[derive(Debug, Default)]
pub struct KeyCache {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, SshKeyRecord>>,
}

impl KeyCache {
    pub fn memory() -> Self {
        Self::default()
    }

    /// Load the cache file. A missing file yields an empty cache; an unreadable
    /// one is logged and ignored since every entry can be re-resolved.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring corrupt ssh key cache");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read ssh key cache");
                BTreeMap::new()
            }
        };
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, provider: ProviderName, fingerprint: &str) -> Option<SshKeyRecord> {
        self.lock().get(&entry_key(provider, fingerprint)).cloned()
    }

    pub fn insert(&self, provider: ProviderName, record: SshKeyRecord) -> std::io::Result<()> {
        let snapshot = {
            let mut entries = self.lock();
            entries.insert(entry_key(provider, &record.fingerprint), record);
            entries.clone()
        };
        self.persist(&snapshot)
    }

    pub fn forget(&self, provider: ProviderName, fingerprint: &str) -> std::io::Result<()> {
        let snapshot = {
            let mut entries = self.lock();
            if entries.remove(&entry_key(provider, fingerprint)).is_none() {
                return Ok(());
            }
            entries.clone()
        };
        self.persist(&snapshot)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SshKeyRecord>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &BTreeMap<String, SshKeyRecord>) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_private(path, &serde_json::to_vec_pretty(entries)?)
    }
}

fn entry_key(provider: ProviderName, fingerprint: &str) -> String {
    format!("{provider}:{fingerprint}")
}

/// Atomically replace `path` with `contents`, mode 0600.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKdpcN1C/dAC3FpkWD9aHsS717mrUFJZFnhAAh51FzDk dev@laptop";
    const FP: &str = "18:68:0c:f0:ed:da:f8:99:a7:14:21:00:8f:5d:21:80";

    #[test]
    fn md5_fingerprint_matches_ssh_keygen() {
        assert_eq!(md5_fingerprint(KEY).unwrap(), FP);
    }

    #[test]
    fn md5_fingerprint_rejects_garbage() {
        assert!(md5_fingerprint("ssh-ed25519").is_err());
        assert!(md5_fingerprint("ssh-ed25519 !!!notbase64").is_err());
    }

    #[test]
    fn key_name_is_deterministic() {
        assert_eq!(key_name(FP), "sbx-18680cf0edda");
    }

    #[test]
    fn cache_persists_across_loads() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh-keys.json");

        let cache = KeyCache::load(&path);
        assert!(cache.get(ProviderName::Hetzner, FP).is_none());
        cache
            .insert(
                ProviderName::Hetzner,
                SshKeyRecord {
                    id: "4711".into(),
                    fingerprint: FP.into(),
                },
            )
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let reloaded = KeyCache::load(&path);
        assert_eq!(reloaded.get(ProviderName::Hetzner, FP).unwrap().id, "4711");

        reloaded.forget(ProviderName::Hetzner, FP).unwrap();
        assert!(KeyCache::load(&path).get(ProviderName::Hetzner, FP).is_none());
    }

    #[test]
    fn corrupt_cache_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh-keys.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(KeyCache::load(&path).get(ProviderName::Hetzner, FP).is_none());
    }
}
