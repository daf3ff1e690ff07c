// Linkwatch Engine — Persisted Credentials
// CredentialBlob, CredentialStore trait, FileCredentialStore, MemoryCredentialStore
//
// A blob is the platform client's cookies plus a localStorage snapshot,
// written when a session reaches `connected` and read back on the next start
// so the tenant can skip the QR challenge.

use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

// ── Blob ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialBlob {
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
    #[serde(default)]
    pub local_storage: BTreeMap<String, String>,
}

impl CredentialBlob {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.local_storage.is_empty()
    }
}

// ── Store Trait ────────────────────────────────────────────────────────

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted for the tenant.
    async fn load(&self, user_id: &str) -> EngineResult<Option<CredentialBlob>>;
    async fn save(&self, user_id: &str, blob: &CredentialBlob) -> EngineResult<()>;
    async fn remove(&self, user_id: &str) -> EngineResult<()>;
}

// ── File Store ─────────────────────────────────────────────────────────

/// One JSON file per tenant under `dir`.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileCredentialStore { dir: dir.into() }
    }

    /// Tenant ids are opaque, so anything outside `[A-Za-z0-9_-]` is replaced
    /// and a digest suffix keeps distinct ids from colliding.
    pub fn path_for(&self, user_id: &str) -> PathBuf {
        let sanitized: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let name = if sanitized == user_id && !user_id.is_empty() {
            sanitized
        } else {
            let digest = Sha256::digest(user_id.as_bytes());
            let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
            format!("{}-{}", sanitized, suffix)
        };
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, user_id: &str) -> EngineResult<Option<CredentialBlob>> {
        let path = self.path_for(user_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = serde_json::from_str::<CredentialBlob>(&text)
            .map_err(|e| EngineError::Credentials(format!("Parse {}: {}", path.display(), e)))?;
        debug!("[credentials] Loaded {} cookies for {}", blob.cookies.len(), user_id);
        Ok(Some(blob))
    }

    async fn save(&self, user_id: &str, blob: &CredentialBlob) -> EngineResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(blob)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!("[credentials] Saved session for {}", user_id);
        Ok(())
    }

    async fn remove(&self, user_id: &str) -> EngineResult<()> {
        match tokio::fs::remove_file(self.path_for(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Memory Store ───────────────────────────────────────────────────────

/// Process-local store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCredentialStore {
    blobs: Mutex<HashMap<String, CredentialBlob>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<CredentialBlob> {
        self.blobs.lock().get(user_id).cloned()
    }

    pub fn insert(&self, user_id: &str, blob: CredentialBlob) {
        self.blobs.lock().insert(user_id.to_string(), blob);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, user_id: &str) -> EngineResult<Option<CredentialBlob>> {
        Ok(self.get(user_id))
    }

    async fn save(&self, user_id: &str, blob: &CredentialBlob) -> EngineResult<()> {
        self.insert(user_id, blob.clone());
        Ok(())
    }

    async fn remove(&self, user_id: &str) -> EngineResult<()> {
        self.blobs.lock().remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use serde_json::json;

    fn blob() -> CredentialBlob {
        let mut local_storage = BTreeMap::new();
        local_storage.insert("WABrowserId".to_string(), "\"abc\"".to_string());
        CredentialBlob {
            cookies: vec![json!({"name": "wa", "value": "1", "domain": ".web.example"})],
            local_storage,
        }
    }

    #[test]
    fn test_blob_wire_format() {
        let v = serde_json::to_value(blob()).unwrap();
        assert!(v["cookies"].is_array());
        assert_eq!(v["localStorage"]["WABrowserId"], "\"abc\"");
    }

    #[test]
    fn test_blob_missing_fields_default() {
        let b: CredentialBlob = serde_json::from_str("{}").unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn test_path_for_plain_id() {
        let store = FileCredentialStore::new("/tmp/sessions");
        assert_eq!(store.path_for("user-42"), PathBuf::from("/tmp/sessions/user-42.json"));
    }

    #[test]
    fn test_path_for_hostile_id_stays_in_dir() {
        let store = FileCredentialStore::new("/tmp/sessions");
        let p = store.path_for("../../etc/passwd");
        assert_eq!(p.parent(), Some(Path::new("/tmp/sessions")));
        assert!(!p.to_string_lossy().contains(".."));
    }

    #[test]
    fn test_path_for_distinct_ids_do_not_collide() {
        let store = FileCredentialStore::new("/tmp/sessions");
        assert_ne!(store.path_for("a.b"), store.path_for("a/b"));
        assert_ne!(store.path_for("a_b"), store.path_for("a.b"));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("sessions"));
        assert!(store.load("u1").await.unwrap().is_none());

        store.save("u1", &blob()).await.unwrap();
        assert_eq!(store.load("u1").await.unwrap(), Some(blob()));

        store.remove("u1").await.unwrap();
        assert!(store.load("u1").await.unwrap().is_none());
        store.remove("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        std::fs::write(store.path_for("u1"), "not json").unwrap();
        assert!(matches!(store.load("u1").await, Err(EngineError::Credentials(_))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCredentialStore::new();
        store.save("u1", &blob()).await.unwrap();
        assert_eq!(store.load("u1").await.unwrap(), Some(blob()));
        store.remove("u1").await.unwrap();
        assert!(store.get("u1").is_none());
    }
}
