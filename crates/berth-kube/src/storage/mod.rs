//! Storage drivers for persisting release records
//!
//! - **Secrets** (default): one Kubernetes Secret per release version
//! - **Memory**: process-local, for tests and ephemeral setups
//!
//! Records are stored as JSON, compressed (zstd by default) and base64 encoded.

mod memory;
mod secrets;

pub use memory::{MemoryDriver, OperationCounts, StorageOp};
pub use secrets::SecretsDriver;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::{KubeError, Result};
use crate::release::StoredRelease;

/// Storage driver trait for release persistence
///
/// Every "missing" answer is reported as [`KubeError::ReleaseNotFound`] or
/// [`KubeError::NoDeployedRelease`], both of which satisfy
/// [`KubeError::is_not_found`].
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Get a specific release by name and version
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease>;

    /// Get the highest version for a name
    async fn get_latest(&self, namespace: &str, name: &str) -> Result<StoredRelease>;

    /// All versions of a release, newest first; not-found when there are none
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>>;

    /// Create a new release version
    async fn create(&self, release: &StoredRelease) -> Result<()>;

    /// Update an existing release version
    async fn update(&self, release: &StoredRelease) -> Result<()>;

    /// Delete a specific release version
    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease>;

    /// Delete all versions of a release
    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>>;

    /// The deployed version of a release
    ///
    /// Should several versions claim to be deployed, the highest one wins.
    async fn deployed(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        let history = self.history(namespace, name).await?;
        history
            .into_iter()
            .filter(StoredRelease::is_deployed)
            .max_by_key(|r| r.version)
            .ok_or_else(|| KubeError::NoDeployedRelease {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    /// Check if any version of a release exists
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.get_latest(namespace, name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Compression method
    pub compression: CompressionMethod,

    /// Maximum number of versions to keep per release
    pub max_history: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Zstd { level: 3 },
            max_history: 10,
        }
    }
}

/// Compression method for release data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// No compression
    None,

    /// Gzip compression
    Gzip { level: u32 },

    /// Zstd compression (better ratio, faster)
    Zstd { level: i32 },
}

impl Default for CompressionMethod {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

impl CompressionMethod {
    /// Label value recorded next to the data
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip { .. } => "gzip",
            Self::Zstd { .. } => "zstd",
        }
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = KubeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip { level: 6 }),
            "zstd" => Ok(Self::Zstd { level: 3 }),
            other => Err(KubeError::InvalidConfig(format!(
                "unknown compression '{}' (expected none, gzip or zstd)",
                other
            ))),
        }
    }
}

/// Compress data using the configured method
#[must_use = "compression result should be used"]
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { level } => {
            use std::io::Write;
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| KubeError::Compression(e.to_string()))
        }
        CompressionMethod::Zstd { level } => zstd::encode_all(std::io::Cursor::new(data), level)
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Decompress data
#[must_use = "decompression result should be used"]
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Gzip { .. } => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| KubeError::Compression(e.to_string()))?;
            Ok(decompressed)
        }
        CompressionMethod::Zstd { .. } => zstd::decode_all(std::io::Cursor::new(data))
            .map_err(|e| KubeError::Compression(e.to_string())),
    }
}

/// Encode a release for storage (serialize + compress + base64)
#[must_use = "encoded data should be used for storage"]
pub fn encode_for_storage(release: &StoredRelease, compression: CompressionMethod) -> Result<String> {
    let json = serde_json::to_vec(release)?;
    let compressed = compress(&json, compression)?;
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        &compressed,
    ))
}

/// Decode a release from storage (base64 + decompress + deserialize)
#[must_use = "decoded release should be used"]
pub fn decode_from_storage(data: &str, compression: CompressionMethod) -> Result<StoredRelease> {
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
        .map_err(|e| KubeError::Serialization(format!("base64 decode error: {}", e)))?;
    let decompressed = decompress(&decoded, compression)?;
    Ok(serde_json::from_slice(&decompressed)?)
}

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "berth";
pub const RELEASE_NAME_LABEL: &str = "berth.dev/release-name";
pub const RELEASE_VERSION_LABEL: &str = "berth.dev/release-version";
pub const RELEASE_NAMESPACE_LABEL: &str = "berth.dev/release-namespace";
pub const RELEASE_STATUS_LABEL: &str = "berth.dev/status";
pub const COMPRESSION_LABEL: &str = "berth.dev/compression";

/// Labels applied to every storage object
#[must_use = "labels should be applied to resources"]
pub fn storage_labels(release: &StoredRelease) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (RELEASE_NAME_LABEL.to_string(), release.name.clone()),
        (RELEASE_VERSION_LABEL.to_string(), release.version.to_string()),
        (RELEASE_NAMESPACE_LABEL.to_string(), release.namespace.clone()),
        (RELEASE_STATUS_LABEL.to_string(), release.status().to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseState;
    use berth_core::{ChartMetadata, Values};

    fn test_release() -> StoredRelease {
        StoredRelease::for_install(
            "test".to_string(),
            "default".to_string(),
            ChartMetadata::new("web", semver::Version::new(1, 0, 0)),
            Values::from_yaml("replicas: 2").unwrap(),
            "apiVersion: v1\nkind: ConfigMap\n".repeat(200),
        )
    }

    #[test]
    fn test_encode_decode_every_compression() {
        let mut release = test_release();
        release.mark_failed("Test failure".to_string());

        for method in [
            CompressionMethod::None,
            CompressionMethod::Gzip { level: 6 },
            CompressionMethod::Zstd { level: 3 },
        ] {
            let encoded = encode_for_storage(&release, method).unwrap();
            let decoded = decode_from_storage(&encoded, method).unwrap();
            assert_eq!(decoded, release, "compression {}", method.label());
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_manifest() {
        let release = test_release();
        let plain = encode_for_storage(&release, CompressionMethod::None).unwrap();
        let zstd = encode_for_storage(&release, CompressionMethod::default()).unwrap();
        assert!(zstd.len() < plain.len());
    }

    #[test]
    fn test_decode_invalid_data() {
        assert!(decode_from_storage("not valid base64!!!", CompressionMethod::None).is_err());

        let invalid = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"not json");
        assert!(decode_from_storage(&invalid, CompressionMethod::None).is_err());
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("gzip".parse::<CompressionMethod>().unwrap().label(), "gzip");
        assert_eq!("none".parse::<CompressionMethod>().unwrap(), CompressionMethod::None);
        assert!("lz4".parse::<CompressionMethod>().is_err());
    }

    #[test]
    fn test_storage_labels() {
        let mut release = test_release();
        release.state = ReleaseState::Deployed;
        let labels = storage_labels(&release);

        assert_eq!(labels[MANAGED_BY_LABEL], "berth");
        assert_eq!(labels[RELEASE_NAME_LABEL], "test");
        assert_eq!(labels[RELEASE_VERSION_LABEL], "1");
        assert_eq!(labels[RELEASE_NAMESPACE_LABEL], "default");
        assert_eq!(labels[RELEASE_STATUS_LABEL], "deployed");
    }
}
