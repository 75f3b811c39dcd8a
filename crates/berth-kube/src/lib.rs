//! Berth Kube - release management on Kubernetes
//!
//! This crate provides:
//! - **Storage Drivers**: Persist release records in Kubernetes Secrets or in memory
//! - **Patch Calculator**: Minimal patches between live and expected objects
//! - **Release Actions**: Install, upgrade, rollback and uninstall with failure records
//! - **Release Manager**: Sync, lifecycle and compensation for a single release
//! - **Diff Engine**: Compare releases and detect cluster drift

pub mod actions;
pub mod client;
pub mod cluster;
pub mod diff;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod patch;
pub mod release;
pub mod render;
pub mod storage;

pub use actions::{
    ActionOption, Description, DryRun, ForceUpgrade, InstallConfig, InstallOption, KeepHistory,
    Labels, MaxHistory, RollbackConfig, Timeout, UninstallConfig, UninstallOption, UpgradeConfig,
    UpgradeOption,
};
pub use client::{ApplySummary, ReleaseClient, validate_release_name};
pub use cluster::{ClusterClient, ClusterCounts, ClusterOp, KubeCluster, MemoryCluster};
pub use diff::{ChangeType, DiffEngine, DiffResult, ObjectChange};
pub use error::{ActionFailure, KubeError, Result};
pub use manager::{ReleaseManager, SyncState};
pub use manifest::{ManifestObject, ObjectRef, ResourceCategory, parse_manifest};
pub use patch::{ObjectClass, ObjectPatch, PatchFormat, create_patch};
pub use release::{ReleaseState, StoredRelease};
pub use render::Renderer;
pub use storage::{
    CompressionMethod, MemoryDriver, OperationCounts, SecretsDriver, StorageConfig, StorageDriver,
    StorageOp,
};
