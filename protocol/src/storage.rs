//! Persistence for contact content and network descriptions.
//!
//! The engine only talks to `StorageAdapter`; `MemoryStorage` and
//! `FileStorage` are interchangeable behind it.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::error::StorageError;
use crate::types::*;

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn initialize(&self) -> Result<(), StorageError>;

    async fn save_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
        content: &StoredContent,
    ) -> Result<(), StorageError>;

    async fn load_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
    ) -> Result<Option<StoredContent>, StorageError>;

    async fn save_group_state(&self, network_id: &str, state: &GroupState) -> Result<(), StorageError>;

    async fn load_group_state(&self, network_id: &str, group_id: &str) -> Result<Option<GroupState>, StorageError>;

    async fn save_network_state(&self, state: &NetworkState) -> Result<(), StorageError>;

    async fn load_network_state(&self, network_id: &str) -> Result<Option<NetworkState>, StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}

type ContentKey = (NetworkId, GroupId, ContactId);

#[derive(Default)]
struct MemoryTables {
    contents: HashMap<ContentKey, StoredContent>,
    groups: HashMap<(NetworkId, GroupId), GroupState>,
    networks: HashMap<NetworkId, NetworkState>,
}

/// Keeps everything in process memory. Can be told to fail saves, which is
/// how degraded durability gets exercised.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<MemoryTables>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StorageError> {
        self.check_open()?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("memory storage is set to fail")));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn save_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
        content: &StoredContent,
    ) -> Result<(), StorageError> {
        self.check_write()?;
        let key = (network_id.to_string(), group_id.to_string(), contact_id.to_string());
        self.tables.write().await.contents.insert(key, content.clone());
        Ok(())
    }

    async fn load_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
    ) -> Result<Option<StoredContent>, StorageError> {
        self.check_open()?;
        let key = (network_id.to_string(), group_id.to_string(), contact_id.to_string());
        Ok(self.tables.read().await.contents.get(&key).cloned())
    }

    async fn save_group_state(&self, network_id: &str, state: &GroupState) -> Result<(), StorageError> {
        self.check_write()?;
        let key = (network_id.to_string(), state.group.id.clone());
        self.tables.write().await.groups.insert(key, state.clone());
        Ok(())
    }

    async fn load_group_state(&self, network_id: &str, group_id: &str) -> Result<Option<GroupState>, StorageError> {
        self.check_open()?;
        let key = (network_id.to_string(), group_id.to_string());
        Ok(self.tables.read().await.groups.get(&key).cloned())
    }

    async fn save_network_state(&self, state: &NetworkState) -> Result<(), StorageError> {
        self.check_write()?;
        self.tables.write().await.networks.insert(state.network_id.clone(), state.clone());
        Ok(())
    }

    async fn load_network_state(&self, network_id: &str) -> Result<Option<NetworkState>, StorageError> {
        self.check_open()?;
        Ok(self.tables.read().await.networks.get(network_id).cloned())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// JSON files under `data_dir`, one directory per network:
///
/// ```text
/// <data_dir>/<network>/network.json
/// <data_dir>/<network>/groups/<group>.json
/// <data_dir>/<network>/content/<group>.json   contact id → value and stamp
/// ```
pub struct FileStorage {
    data_dir: PathBuf,
    /// Serializes read-modify-write of content files
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), write_lock: Mutex::new(()), closed: AtomicBool::new(false) }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn network_dir(&self, network_id: &str) -> PathBuf {
        self.data_dir.join(file_name(network_id))
    }

    fn content_path(&self, network_id: &str, group_id: &str) -> PathBuf {
        self.network_dir(network_id).join("content").join(format!("{}.json", file_name(group_id)))
    }

    fn group_path(&self, network_id: &str, group_id: &str) -> PathBuf {
        self.network_dir(network_id).join("groups").join(format!("{}.json", file_name(group_id)))
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

/// Encode an id into a safe file name. Unsafe bytes become `%XX`, so distinct
/// ids never share a file.
fn file_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temporary file and rename, so readers never see half a file
async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        self.closed.store(false, Ordering::SeqCst);
        tracing::debug!(data_dir = %self.data_dir.display(), "File storage ready");
        Ok(())
    }

    async fn save_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
        content: &StoredContent,
    ) -> Result<(), StorageError> {
        self.check_open()?;
        let path = self.content_path(network_id, group_id);
        let _guard = self.write_lock.lock().await;
        let mut contents: BTreeMap<ContactId, StoredContent> = read_json(&path).await?.unwrap_or_default();
        contents.insert(contact_id.to_string(), content.clone());
        write_json(&path, &contents).await
    }

    async fn load_contact_content(
        &self,
        network_id: &str,
        group_id: &str,
        contact_id: &str,
    ) -> Result<Option<StoredContent>, StorageError> {
        self.check_open()?;
        let path = self.content_path(network_id, group_id);
        let contents: Option<BTreeMap<ContactId, StoredContent>> = read_json(&path).await?;
        Ok(contents.and_then(|mut c| c.remove(contact_id)))
    }

    async fn save_group_state(&self, network_id: &str, state: &GroupState) -> Result<(), StorageError> {
        self.check_open()?;
        write_json(&self.group_path(network_id, &state.group.id), state).await
    }

    async fn load_group_state(&self, network_id: &str, group_id: &str) -> Result<Option<GroupState>, StorageError> {
        self.check_open()?;
        read_json(&self.group_path(network_id, group_id)).await
    }

    async fn save_network_state(&self, state: &NetworkState) -> Result<(), StorageError> {
        self.check_open()?;
        write_json(&self.network_dir(&state.network_id).join("network.json"), state).await
    }

    async fn load_network_state(&self, network_id: &str) -> Result<Option<NetworkState>, StorageError> {
        self.check_open()?;
        read_json(&self.network_dir(network_id).join("network.json")).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        // wait out an in-flight content write
        let _guard = self.write_lock.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkBuilder;

    fn sample_network() -> NetworkState {
        let mut nb = NetworkBuilder::new("net/1");
        let root = nb.root();
        let inner = nb.group(&root, "inner");
        let a = nb.contact(&inner, "a", BlendMode::Max);
        let b = nb.boundary(&inner, "b", BoundaryDirection::Output, BlendMode::AcceptLast);
        nb.wire(&a, &b);
        nb.build()
    }

    fn stored(value: Value, time: u64) -> StoredContent {
        StoredContent::new(value, Stamp::new(time, "node0"))
    }

    async fn exercise(storage: &dyn StorageAdapter) {
        storage.initialize().await.unwrap();
        assert_eq!(storage.load_contact_content("net/1", "inner", "inner:a").await.unwrap(), None);

        storage.save_contact_content("net/1", "inner", "inner:a", &stored(Value::Number(3.0), 1)).await.unwrap();
        storage.save_contact_content("net/1", "inner", "inner:b", &stored(Value::from("x"), 2)).await.unwrap();
        storage.save_contact_content("net/1", "inner", "inner:a", &stored(Value::Number(4.0), 3)).await.unwrap();
        assert_eq!(
            storage.load_contact_content("net/1", "inner", "inner:a").await.unwrap(),
            Some(stored(Value::Number(4.0), 3))
        );
        assert_eq!(
            storage.load_contact_content("net/1", "inner", "inner:b").await.unwrap(),
            Some(stored(Value::from("x"), 2))
        );

        let network = sample_network();
        storage.save_network_state(&network).await.unwrap();
        assert_eq!(storage.load_network_state("net/1").await.unwrap(), Some(network.clone()));

        let group = network.groups["inner"].clone();
        storage.save_group_state("net/1", &group).await.unwrap();
        assert_eq!(storage.load_group_state("net/1", "inner").await.unwrap(), Some(group));
        assert_eq!(storage.load_group_state("net/1", "missing").await.unwrap(), None);

        storage.close().await.unwrap();
        assert!(matches!(
            storage.load_network_state("net/1").await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_memory_storage_contract() {
        exercise(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_file_storage_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStorage::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileStorage::new(dir.path());
        first.initialize().await.unwrap();
        first.save_contact_content("n", "g", "g:c", &stored(Value::Number(1.5), 7)).await.unwrap();
        first.close().await.unwrap();

        let second = FileStorage::new(dir.path());
        second.initialize().await.unwrap();
        let restored = second.load_contact_content("n", "g", "g:c").await.unwrap().unwrap();
        assert_eq!(restored.value, Value::Number(1.5));
        assert_eq!(restored.stamp, Stamp::new(7, "node0"));
    }

    #[tokio::test]
    async fn test_memory_storage_can_fail_saves() {
        let storage = MemoryStorage::new();
        storage.set_failing(true);
        let err = storage.save_contact_content("n", "g", "c", &stored(Value::Bool(true), 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        storage.set_failing(false);
        storage.save_contact_content("n", "g", "c", &stored(Value::Bool(true), 1)).await.unwrap();
    }

    #[test]
    fn test_file_names_are_injective() {
        assert_eq!(file_name("root"), "root");
        assert_eq!(file_name("net/1"), "net%2F1");
        assert_ne!(file_name("a:b"), file_name("a_b"));
        assert_ne!(file_name("a.b"), file_name("a%2Eb"));
    }
}
