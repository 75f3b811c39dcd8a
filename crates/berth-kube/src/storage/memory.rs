//! In-memory storage driver
//!
//! Keeps releases in process memory. Used by tests and by the operator's
//! `memory` storage mode. Failures can be injected per operation.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::StorageDriver;
use crate::error::{KubeError, Result};
use crate::release::StoredRelease;

/// namespace -> name -> version -> release
type Store = HashMap<String, HashMap<String, BTreeMap<u32, StoredRelease>>>;

/// Driver operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Get,
    History,
    Create,
    Update,
    Delete,
    DeleteAll,
}

/// Counts of operations performed, for assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub histories: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

#[derive(Clone, Default)]
pub struct MemoryDriver {
    store: Arc<RwLock<Store>>,
    operations: Arc<RwLock<OperationCounts>>,
    failures: Arc<RwLock<HashMap<StorageOp, String>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated releases
    pub fn with_releases(releases: Vec<StoredRelease>) -> Self {
        let mut store = Store::new();
        for release in releases {
            store
                .entry(release.namespace.clone())
                .or_default()
                .entry(release.name.clone())
                .or_default()
                .insert(release.version, release);
        }
        Self {
            store: Arc::new(RwLock::new(store)),
            ..Self::default()
        }
    }

    /// Make every subsequent `op` fail with a storage error
    pub async fn fail_on(&self, op: StorageOp, message: impl Into<String>) {
        self.failures.write().await.insert(op, message.into());
    }

    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    pub async fn operation_counts(&self) -> OperationCounts {
        self.operations.read().await.clone()
    }

    pub async fn reset_counts(&self) {
        *self.operations.write().await = OperationCounts::default();
    }

    /// Every stored release, in namespace/name/version order
    pub async fn all_releases(&self) -> Vec<StoredRelease> {
        let store = self.store.read().await;
        let mut releases: Vec<StoredRelease> = store
            .values()
            .flat_map(|names| names.values())
            .flat_map(|versions| versions.values())
            .cloned()
            .collect();
        releases.sort_by(|a, b| {
            (&a.namespace, &a.name, a.version).cmp(&(&b.namespace, &b.name, b.version))
        });
        releases
    }

    async fn check(&self, op: StorageOp) -> Result<()> {
        {
            let mut ops = self.operations.write().await;
            match op {
                StorageOp::Get => ops.gets += 1,
                StorageOp::History => ops.histories += 1,
                StorageOp::Create => ops.creates += 1,
                StorageOp::Update => ops.updates += 1,
                StorageOp::Delete | StorageOp::DeleteAll => ops.deletes += 1,
            }
        }
        match self.failures.read().await.get(&op) {
            Some(message) => Err(KubeError::Storage(message.clone())),
            None => Ok(()),
        }
    }
}

fn not_found(namespace: &str, name: &str) -> KubeError {
    KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        self.check(StorageOp::Get).await?;

        let store = self.store.read().await;
        store
            .get(namespace)
            .and_then(|names| names.get(name))
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn get_latest(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        self.check(StorageOp::Get).await?;

        let store = self.store.read().await;
        store
            .get(namespace)
            .and_then(|names| names.get(name))
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        self.check(StorageOp::History).await?;

        let store = self.store.read().await;
        let releases: Vec<StoredRelease> = store
            .get(namespace)
            .and_then(|names| names.get(name))
            .map(|versions| versions.values().rev().cloned().collect())
            .unwrap_or_default();

        if releases.is_empty() {
            return Err(not_found(namespace, name));
        }
        Ok(releases)
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        self.check(StorageOp::Create).await?;

        let mut store = self.store.write().await;
        let versions = store
            .entry(release.namespace.clone())
            .or_default()
            .entry(release.name.clone())
            .or_default();

        if versions.contains_key(&release.version) {
            return Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
            });
        }

        versions.insert(release.version, release.clone());
        Ok(())
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        self.check(StorageOp::Update).await?;

        let mut store = self.store.write().await;
        let slot = store
            .get_mut(&release.namespace)
            .and_then(|names| names.get_mut(&release.name))
            .and_then(|versions| versions.get_mut(&release.version))
            .ok_or_else(|| not_found(&release.namespace, &release.name))?;
        *slot = release.clone();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        self.check(StorageOp::Delete).await?;

        let mut store = self.store.write().await;
        let versions = store
            .get_mut(namespace)
            .and_then(|names| names.get_mut(name))
            .ok_or_else(|| not_found(namespace, name))?;
        let release = versions
            .remove(&version)
            .ok_or_else(|| not_found(namespace, name))?;
        if versions.is_empty() {
            if let Some(names) = store.get_mut(namespace) {
                names.remove(name);
            }
        }
        Ok(release)
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        self.check(StorageOp::DeleteAll).await?;

        let mut store = self.store.write().await;
        let versions = store
            .get_mut(namespace)
            .and_then(|names| names.remove(name))
            .ok_or_else(|| not_found(namespace, name))?;
        Ok(versions.into_values().rev().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{ChartMetadata, Values};

    fn release(version: u32, deployed: bool) -> StoredRelease {
        let mut release = StoredRelease::for_install(
            "app".to_string(),
            "default".to_string(),
            ChartMetadata::new("web", semver::Version::new(1, 0, 0)),
            Values::new(),
            format!("manifest-{}", version),
        );
        release.version = version;
        if deployed {
            release.mark_deployed();
        } else {
            release.mark_superseded();
        }
        release
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let driver = MemoryDriver::with_releases(vec![release(1, false), release(3, true), release(2, false)]);

        let history = driver.history("default", "app").await.unwrap();
        let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!(driver.get_latest("default", "app").await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_missing_release_is_not_found() {
        let driver = MemoryDriver::new();
        assert!(driver.history("default", "app").await.unwrap_err().is_not_found());
        assert!(driver.get("default", "app", 1).await.unwrap_err().is_not_found());
        assert!(!driver.exists("default", "app").await.unwrap());
    }

    #[tokio::test]
    async fn test_deployed_picks_highest_version() {
        let driver = MemoryDriver::with_releases(vec![release(1, true), release(2, true), release(3, false)]);
        assert_eq!(driver.deployed("default", "app").await.unwrap().version, 2);

        let driver = MemoryDriver::with_releases(vec![release(1, false)]);
        let err = driver.deployed("default", "app").await.unwrap_err();
        assert!(matches!(err, KubeError::NoDeployedRelease { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let driver = MemoryDriver::new();
        driver.create(&release(1, true)).await.unwrap();
        let err = driver.create(&release(1, true)).await.unwrap_err();
        assert!(matches!(err, KubeError::ReleaseAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_delete_and_delete_all() {
        let driver = MemoryDriver::with_releases(vec![release(1, false), release(2, true)]);

        let removed = driver.delete("default", "app", 1).await.unwrap();
        assert_eq!(removed.version, 1);
        assert!(driver.delete("default", "app", 1).await.unwrap_err().is_not_found());

        let removed = driver.delete_all("default", "app").await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(driver.all_releases().await.is_empty());
        assert_eq!(driver.operation_counts().await.deletes, 3);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let driver = MemoryDriver::with_releases(vec![release(1, true)]);
        driver.fail_on(StorageOp::History, "etcd unavailable").await;

        let err = driver.history("default", "app").await.unwrap_err();
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "storage error: etcd unavailable");

        driver.clear_failures().await;
        assert!(driver.history("default", "app").await.is_ok());
    }
}
