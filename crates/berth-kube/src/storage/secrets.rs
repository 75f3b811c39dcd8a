//! Kubernetes Secrets storage driver
//!
//! Each release version lives in its own Secret named after
//! [`StoredRelease::storage_key`], labelled so the history of a release can
//! be listed with one label selector.

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;

use super::{
    COMPRESSION_LABEL, CompressionMethod, MANAGED_BY, MANAGED_BY_LABEL, RELEASE_NAME_LABEL,
    StorageConfig, StorageDriver, decode_from_storage, encode_for_storage, storage_labels,
};
use crate::error::{KubeError, Result};
use crate::release::{StoredRelease, storage_key};

const RELEASE_DATA_KEY: &str = "release";
const SECRET_TYPE: &str = "berth.dev/release.v1";

/// Kubernetes Secrets storage driver
pub struct SecretsDriver {
    client: Client,
    config: StorageConfig,
}

impl SecretsDriver {
    /// Create a driver from the ambient kubeconfig or in-cluster config
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: Client, config: StorageConfig) -> Self {
        Self { client, config }
    }

    fn secrets_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn build_secret(&self, release: &StoredRelease) -> Result<Secret> {
        let encoded = encode_for_storage(release, self.config.compression)?;

        let mut labels = storage_labels(release);
        labels.insert(
            COMPRESSION_LABEL.to_string(),
            self.config.compression.label().to_string(),
        );

        let data = BTreeMap::from([(
            RELEASE_DATA_KEY.to_string(),
            ByteString(encoded.into_bytes()),
        )]);

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(release.storage_key()),
                namespace: Some(release.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    fn parse_secret(&self, secret: &Secret) -> Result<StoredRelease> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(RELEASE_DATA_KEY))
            .ok_or_else(|| KubeError::Storage("secret missing 'release' data".to_string()))?;

        let encoded = std::str::from_utf8(&data.0)
            .map_err(|e| KubeError::Storage(format!("invalid UTF-8 in secret: {}", e)))?;

        decode_from_storage(encoded, self.compression_of(secret))
    }

    /// Compression recorded on the Secret, falling back to the configured one
    fn compression_of(&self, secret: &Secret) -> CompressionMethod {
        secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(COMPRESSION_LABEL))
            .and_then(|c| c.parse().ok())
            .unwrap_or(self.config.compression)
    }
}

fn not_found(namespace: &str, name: &str) -> KubeError {
    KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

fn is_api_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

#[async_trait]
impl StorageDriver for SecretsDriver {
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        match self.secrets_api(namespace).get(&storage_key(name, version)).await {
            Ok(secret) => self.parse_secret(&secret),
            Err(e) if is_api_not_found(&e) => Err(not_found(namespace, name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_latest(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        let history = self.history(namespace, name).await?;
        history
            .into_iter()
            .next()
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let selector = format!(
            "{}={},{}={}",
            MANAGED_BY_LABEL, MANAGED_BY, RELEASE_NAME_LABEL, name
        );
        let secrets = self
            .secrets_api(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;

        let mut releases = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            match self.parse_secret(secret) {
                Ok(release) => releases.push(release),
                Err(e) => tracing::warn!(
                    secret = secret.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "skipping unreadable release secret"
                ),
            }
        }

        if releases.is_empty() {
            return Err(not_found(namespace, name));
        }

        releases.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(releases)
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        let secret = self.build_secret(release)?;
        match self
            .secrets_api(&release.namespace)
            .create(&PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Err(KubeError::ReleaseAlreadyExists {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        let secret = self.build_secret(release)?;
        match self
            .secrets_api(&release.namespace)
            .replace(&release.storage_key(), &PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_api_not_found(&e) => Err(not_found(&release.namespace, &release.name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        let release = self.get(namespace, name, version).await?;
        match self
            .secrets_api(namespace)
            .delete(&release.storage_key(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(release),
            Err(e) if is_api_not_found(&e) => Err(not_found(namespace, name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let releases = self.history(namespace, name).await?;
        let api = self.secrets_api(namespace);

        for release in &releases {
            match api
                .delete(&release.storage_key(), &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(e) if is_api_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(releases)
    }
}
