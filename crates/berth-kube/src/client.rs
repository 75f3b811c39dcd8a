//! Release action pipeline
//!
//! [`ReleaseClient`] combines a storage driver, a renderer and a cluster
//! client into the install, upgrade, rollback and uninstall actions. Objects
//! are converged through the patch calculator: missing objects are created,
//! existing ones are patched only when the calculator reports a difference.

use berth_core::{Chart, ReleaseInfo, Values};
use chrono::Duration;
use regex::Regex;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::actions::{InstallConfig, RollbackConfig, UninstallConfig, UpgradeConfig};
use crate::cluster::ClusterClient;
use crate::error::{ActionFailure, KubeError, Result};
use crate::manifest::{ManifestObject, ObjectRef, parse_manifest, sort_for_apply, sort_for_delete};
use crate::patch::create_patch;
use crate::release::{DEFAULT_OPERATION_TIMEOUT, ReleaseState, StoredRelease};
use crate::render::Renderer;
use crate::storage::StorageDriver;

/// Longest release name accepted; longer names overflow object name limits
pub const MAX_RELEASE_NAME_LEN: usize = 53;

/// Race `future` against `cancel`
pub async fn cancellable<T, F>(cancel: &CancellationToken, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KubeError::Cancelled {
            operation: operation.to_string(),
        }),
        result = future => result,
    }
}

async fn with_timeout<T, F>(timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let limit = timeout
        .to_std()
        .map_err(|_| KubeError::InvalidConfig(format!("invalid timeout {}s", timeout.num_seconds())))?;

    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(KubeError::Timeout(format!("{}s", timeout.num_seconds()))),
    }
}

/// Check a release name is a DNS-1123 label of at most 53 characters
pub fn validate_release_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| KubeError::InvalidReleaseName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(invalid("name is longer than 53 characters"));
    }

    let pattern = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
        .map_err(|e| KubeError::InvalidConfig(e.to_string()))?;
    if !pattern.is_match(name) {
        return Err(invalid(
            "must consist of lower case alphanumeric characters or '-', and start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

/// What an apply pass did to each object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: Vec<String>,
    pub patched: Vec<String>,
    pub recreated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

impl ApplySummary {
    /// Whether any object was written
    pub fn changed(&self) -> bool {
        !(self.created.is_empty()
            && self.patched.is_empty()
            && self.recreated.is_empty()
            && self.deleted.is_empty())
    }
}

/// Install, upgrade, rollback and uninstall over injected collaborators
#[derive(Clone)]
pub struct ReleaseClient {
    storage: Arc<dyn StorageDriver>,
    renderer: Arc<dyn Renderer>,
    cluster: Arc<dyn ClusterClient>,
}

impl ReleaseClient {
    pub fn new(
        storage: Arc<dyn StorageDriver>,
        renderer: Arc<dyn Renderer>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            storage,
            renderer,
            cluster,
        }
    }

    pub fn storage(&self) -> &dyn StorageDriver {
        self.storage.as_ref()
    }

    pub fn cluster(&self) -> &dyn ClusterClient {
        self.cluster.as_ref()
    }

    // ========== Queries ==========

    /// All versions of a release, newest first
    pub async fn history(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredRelease>> {
        cancellable(cancel, "get release history", self.storage.history(namespace, name)).await
    }

    pub async fn deployed(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<StoredRelease> {
        cancellable(cancel, "get deployed release", self.storage.deployed(namespace, name)).await
    }

    pub async fn delete_version(
        &self,
        namespace: &str,
        name: &str,
        version: u32,
        cancel: &CancellationToken,
    ) -> Result<StoredRelease> {
        cancellable(
            cancel,
            "delete release version",
            self.storage.delete(namespace, name, version),
        )
        .await
    }

    // ========== Install ==========

    /// Install a chart as a new release
    ///
    /// Once the pending record is stored, every failure marks it failed and
    /// returns it as the partial record of the [`ActionFailure`].
    pub async fn install(
        &self,
        config: &InstallConfig,
        chart: &Chart,
        values: &Values,
        cancel: &CancellationToken,
    ) -> std::result::Result<StoredRelease, ActionFailure> {
        validate_release_name(&config.name)?;

        let history = match self.history(&config.namespace, &config.name, cancel).await {
            Ok(history) => history,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if history.iter().any(StoredRelease::is_deployed) {
            return Err(KubeError::ReleaseAlreadyExists {
                name: config.name.clone(),
                namespace: config.namespace.clone(),
            }
            .into());
        }
        if let Some(latest) = history.first() {
            ensure_not_in_progress(latest)?;
        }

        let version = history.first().map(|r| r.version + 1).unwrap_or(1);
        let info = ReleaseInfo::for_install(&config.name, &config.namespace, version);
        let manifest = self.renderer.render(chart, values, &info)?;

        let mut release = StoredRelease::for_install(
            config.name.clone(),
            config.namespace.clone(),
            chart.metadata.clone(),
            values.clone(),
            manifest,
        );
        release.version = version;
        release.labels.extend(config.labels.clone());
        release.description = config.description.clone();
        release.set_timeout(config.timeout);

        let objects = parse_manifest(&release.manifest, &release.namespace)?;

        if config.dry_run {
            return Ok(release);
        }

        cancellable(cancel, "create release record", self.storage.create(&release)).await?;
        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            objects = objects.len(),
            "installing release"
        );

        let summary = match self
            .apply(objects, Vec::new(), false, config.timeout, cancel)
            .await
        {
            Ok(summary) => summary,
            Err(e) => return Err(self.record_failure(release, e).await),
        };

        release.mark_deployed();
        if let Err(e) = cancellable(cancel, "update release record", self.storage.update(&release)).await {
            return Err(ActionFailure::partial(e, release));
        }

        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            created = summary.created.len(),
            "release installed"
        );
        Ok(release)
    }

    // ========== Upgrade ==========

    /// Upgrade the deployed release to a new chart or new values
    ///
    /// Objects present in the deployed manifest but not in the new one are
    /// deleted. The previously deployed record is superseded only after the
    /// new objects are applied.
    pub async fn upgrade(
        &self,
        config: &UpgradeConfig,
        chart: &Chart,
        values: &Values,
        cancel: &CancellationToken,
    ) -> std::result::Result<StoredRelease, ActionFailure> {
        validate_release_name(&config.name)?;

        let deployed = self.deployed(&config.namespace, &config.name, cancel).await?;
        let latest = cancellable(
            cancel,
            "get latest release",
            self.storage.get_latest(&config.namespace, &config.name),
        )
        .await?;
        ensure_not_in_progress(&latest)?;

        let version = latest.version + 1;
        let info = ReleaseInfo::for_upgrade(&config.name, &config.namespace, version);
        let manifest = self.renderer.render(chart, values, &info)?;

        let mut release = StoredRelease::for_upgrade(&latest, chart.metadata.clone(), values.clone(), manifest);
        release.labels.extend(config.labels.clone());
        release.description = config.description.clone();
        release.set_timeout(config.timeout);

        if config.dry_run {
            return Ok(release);
        }

        let objects = parse_manifest(&release.manifest, &release.namespace)?;
        let removed = removed_objects(&deployed.manifest, &deployed.namespace, &objects)?;

        cancellable(cancel, "create release record", self.storage.create(&release)).await?;
        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            previous = deployed.version,
            "upgrading release"
        );

        let summary = match self
            .apply(objects, removed, config.force, config.timeout, cancel)
            .await
        {
            Ok(summary) => summary,
            Err(e) => return Err(self.record_failure(release, e).await),
        };

        let mut previous = deployed;
        previous.mark_superseded();
        if let Err(e) = cancellable(cancel, "supersede release record", self.storage.update(&previous)).await {
            return Err(self.record_failure(release, e).await);
        }

        release.mark_deployed();
        if let Err(e) = cancellable(cancel, "update release record", self.storage.update(&release)).await {
            return Err(ActionFailure::partial(e, release));
        }

        self.prune_history(&release.namespace, &release.name, config.max_history, cancel)
            .await;

        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            patched = summary.patched.len(),
            created = summary.created.len(),
            deleted = summary.deleted.len(),
            "release upgraded"
        );
        Ok(release)
    }

    // ========== Rollback ==========

    /// Restore the manifest and values of an earlier version as a new version
    pub async fn rollback(
        &self,
        config: &RollbackConfig,
        cancel: &CancellationToken,
    ) -> Result<StoredRelease> {
        validate_release_name(&config.name)?;

        let history = self.history(&config.namespace, &config.name, cancel).await?;
        let latest = history.first().ok_or_else(|| KubeError::ReleaseNotFound {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
        })?;
        if !config.force {
            ensure_not_in_progress(latest)?;
        }

        let target = if config.version == 0 {
            history
                .iter()
                .skip(1)
                .find(|r| matches!(r.state, ReleaseState::Deployed | ReleaseState::Superseded))
                .ok_or_else(|| KubeError::RollbackNotPossible {
                    name: config.name.clone(),
                    reason: "no previous version available".to_string(),
                })?
        } else {
            history
                .iter()
                .find(|r| r.version == config.version)
                .ok_or_else(|| KubeError::RollbackNotPossible {
                    name: config.name.clone(),
                    reason: format!("version {} not found", config.version),
                })?
        };

        let mut release = StoredRelease::for_rollback(target, latest.version + 1);
        if let Some(description) = &config.description {
            release.description = Some(description.clone());
        }
        release.set_timeout(config.timeout);

        let objects = parse_manifest(&release.manifest, &release.namespace)?;
        let removed = removed_objects(&latest.manifest, &latest.namespace, &objects)?;

        cancellable(cancel, "create release record", self.storage.create(&release)).await?;
        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            target = target.version,
            force = config.force,
            "rolling back release"
        );

        if let Err(e) = self
            .apply(objects, removed, config.force, config.timeout, cancel)
            .await
        {
            return Err(self.record_failure(release, e).await.error);
        }

        for other in history.iter().filter(|r| r.is_deployed()) {
            let mut other = other.clone();
            other.mark_superseded();
            cancellable(cancel, "supersede release record", self.storage.update(&other)).await?;
        }

        release.mark_deployed();
        cancellable(cancel, "update release record", self.storage.update(&release)).await?;

        self.prune_history(&release.namespace, &release.name, config.max_history, cancel)
            .await;

        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            "release rolled back"
        );
        Ok(release)
    }

    // ========== Uninstall ==========

    /// Delete the objects of the latest version and retire its records
    pub async fn uninstall(
        &self,
        config: &UninstallConfig,
        cancel: &CancellationToken,
    ) -> Result<StoredRelease> {
        validate_release_name(&config.name)?;

        let mut release = cancellable(
            cancel,
            "get latest release",
            self.storage.get_latest(&config.namespace, &config.name),
        )
        .await?;

        release.mark_uninstalling(config.timeout);
        if let Some(description) = &config.description {
            release.description = Some(description.clone());
        }
        cancellable(cancel, "update release record", self.storage.update(&release)).await?;

        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            "uninstalling release"
        );

        let deleted = match parse_manifest(&release.manifest, &release.namespace) {
            Ok(objects) => with_timeout(config.timeout, self.delete_objects(objects, cancel)).await,
            Err(e) => Err(e),
        };
        let deleted = match deleted {
            Ok(deleted) => deleted,
            Err(e) => return Err(self.record_failure(release, e).await.error),
        };

        release.mark_uninstalled();
        cancellable(cancel, "update release record", self.storage.update(&release)).await?;

        if !config.keep_history {
            cancellable(
                cancel,
                "delete release history",
                self.storage.delete_all(&config.namespace, &config.name),
            )
            .await?;
        }

        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            deleted = deleted.len(),
            keep_history = config.keep_history,
            "release uninstalled"
        );
        Ok(release)
    }

    // ========== Reconcile ==========

    /// Re-apply a deployed manifest to undo drift, without a new version
    pub async fn reconcile(
        &self,
        release: &StoredRelease,
        cancel: &CancellationToken,
    ) -> Result<ApplySummary> {
        let objects = parse_manifest(&release.manifest, &release.namespace)?;
        let summary = self
            .apply(objects, Vec::new(), false, DEFAULT_OPERATION_TIMEOUT, cancel)
            .await?;

        if summary.changed() {
            tracing::info!(
                release = %release.name,
                namespace = %release.namespace,
                version = release.version,
                created = summary.created.len(),
                patched = summary.patched.len(),
                "corrected drift"
            );
        } else {
            tracing::debug!(release = %release.name, namespace = %release.namespace, "no drift");
        }
        Ok(summary)
    }

    // ========== Internal Helpers ==========

    /// Apply `objects` then delete `removed`, bounded by `timeout`
    async fn apply(
        &self,
        objects: Vec<ManifestObject>,
        removed: Vec<ManifestObject>,
        force: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ApplySummary> {
        with_timeout(timeout, async {
            let mut summary = self.apply_objects(objects, force, cancel).await?;
            summary.deleted = self.delete_objects(removed, cancel).await?;
            Ok::<_, KubeError>(summary)
        })
        .await
    }

    async fn apply_objects(
        &self,
        mut objects: Vec<ManifestObject>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<ApplySummary> {
        sort_for_apply(&mut objects);
        let mut summary = ApplySummary::default();

        for object in &objects {
            let reference = &object.reference;
            let live = cancellable(cancel, "get object", self.cluster.get(reference)).await?;

            let Some(live) = live else {
                cancellable(cancel, "create object", self.cluster.create(reference, &object.object)).await?;
                tracing::debug!(object = %reference, "created");
                summary.created.push(reference.to_string());
                continue;
            };

            let patch = create_patch(&live, &object.object)?;
            if patch.is_empty() {
                summary.unchanged.push(reference.to_string());
                continue;
            }

            match cancellable(cancel, "patch object", self.cluster.patch(reference, &patch)).await {
                Ok(()) => {
                    tracing::debug!(object = %reference, format = patch.format.content_type(), "patched");
                    summary.patched.push(reference.to_string());
                }
                Err(e) if force && !e.is_cancelled() => {
                    tracing::warn!(object = %reference, error = %e, "patch rejected, recreating");
                    cancellable(cancel, "delete object", self.cluster.delete(reference)).await?;
                    cancellable(cancel, "create object", self.cluster.create(reference, &object.object)).await?;
                    summary.recreated.push(reference.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    async fn delete_objects(
        &self,
        mut objects: Vec<ManifestObject>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        sort_for_delete(&mut objects);
        let mut deleted = Vec::with_capacity(objects.len());

        for object in &objects {
            let reference = &object.reference;
            if cancellable(cancel, "delete object", self.cluster.delete(reference)).await? {
                deleted.push(reference.to_string());
            } else {
                tracing::debug!(object = %reference, "already gone");
            }
        }

        Ok(deleted)
    }

    /// Mark a stored record failed and package it as the partial result
    ///
    /// The write is not raced against the cancellation token: a cancelled
    /// action should still leave a failed record behind.
    async fn record_failure(&self, mut release: StoredRelease, error: KubeError) -> ActionFailure {
        release.mark_failed(error.to_string());
        if let Err(e) = self.storage.update(&release).await {
            tracing::warn!(
                release = %release.name,
                namespace = %release.namespace,
                version = release.version,
                error = %e,
                "failed to record release failure"
            );
        }
        ActionFailure::partial(error, release)
    }

    /// Delete the oldest versions beyond `max_history`
    async fn prune_history(&self, namespace: &str, name: &str, max_history: u32, cancel: &CancellationToken) {
        let history = match self.history(namespace, name, cancel).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(release = name, namespace, error = %e, "cannot prune history");
                return;
            }
        };

        for old in history.iter().skip(max_history as usize) {
            if let Err(e) = self.delete_version(namespace, name, old.version, cancel).await {
                tracing::warn!(release = name, namespace, version = old.version, error = %e, "failed to prune release version");
            }
        }
    }
}

/// Refuse to start while another operation holds the release
fn ensure_not_in_progress(latest: &StoredRelease) -> Result<()> {
    if latest.state.is_pending() && !latest.state.is_stale() {
        return Err(KubeError::OperationInProgress {
            name: latest.name.clone(),
            status: latest.state.to_string(),
        });
    }
    Ok(())
}

/// Objects of `previous_manifest` that `current` no longer declares
fn removed_objects(
    previous_manifest: &str,
    namespace: &str,
    current: &[ManifestObject],
) -> Result<Vec<ManifestObject>> {
    let kept: BTreeSet<&ObjectRef> = current.iter().map(|o| &o.reference).collect();
    Ok(parse_manifest(previous_manifest, namespace)?
        .into_iter()
        .filter(|o| !kept.contains(&o.reference))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::RollbackConfig;
    use crate::cluster::{ClusterOp, MemoryCluster};
    use crate::storage::{MemoryDriver, StorageOp};
    use berth_core::ChartMetadata;
    use berth_engine::Engine;

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ release.name }}
spec:
  replicas: {{ values.replicas }}
  template:
    spec:
      containers:
        - name: app
          image: "{{ values.image }}"
"#;

    const SERVICE: &str = r#"{% if values.service %}apiVersion: v1
kind: Service
metadata:
  name: {{ release.name }}
spec:
  ports:
    - port: 80
{% endif %}"#;

    fn chart() -> Chart {
        Chart::new(ChartMetadata::new("web", semver::Version::new(1, 0, 0)))
            .with_values(Values::from_yaml("replicas: 1\nimage: nginx:1\nservice: true\n").unwrap())
            .with_template("deployment.yaml", DEPLOYMENT)
            .with_template("service.yaml", SERVICE)
    }

    struct Fixture {
        client: ReleaseClient,
        storage: MemoryDriver,
        cluster: MemoryCluster,
        cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let storage = MemoryDriver::new();
        let cluster = MemoryCluster::new();
        let client = ReleaseClient::new(
            Arc::new(storage.clone()),
            Arc::new(Engine::default()),
            Arc::new(cluster.clone()),
        );
        Fixture {
            client,
            storage,
            cluster,
            cancel: CancellationToken::new(),
        }
    }

    fn deployment_ref() -> ObjectRef {
        ObjectRef {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            namespace: Some("default".to_string()),
            name: "web".to_string(),
        }
    }

    fn service_ref() -> ObjectRef {
        ObjectRef {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            namespace: Some("default".to_string()),
            name: "web".to_string(),
        }
    }

    #[test]
    fn test_validate_release_name() {
        assert!(validate_release_name("web").is_ok());
        assert!(validate_release_name("web-2").is_ok());
        assert!(validate_release_name("").is_err());
        assert!(validate_release_name("Web").is_err());
        assert!(validate_release_name("-web").is_err());
        assert!(validate_release_name("web_app").is_err());
        assert!(validate_release_name(&"a".repeat(53)).is_ok());
        assert!(validate_release_name(&"a".repeat(54)).is_err());
    }

    #[tokio::test]
    async fn test_install_creates_objects_and_record() {
        let f = fixture();
        let release = f
            .client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap();

        assert_eq!(release.version, 1);
        assert!(release.is_deployed());
        assert!(f.cluster.object(&deployment_ref()).await.is_some());
        assert!(f.cluster.object(&service_ref()).await.is_some());
        assert_eq!(f.storage.deployed("default", "web").await.unwrap(), release);
    }

    #[tokio::test]
    async fn test_install_refuses_existing_release() {
        let f = fixture();
        let config = InstallConfig::new("web", "default");
        f.client.install(&config, &chart(), &Values::new(), &f.cancel).await.unwrap();

        let failure = f
            .client
            .install(&config, &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, KubeError::ReleaseAlreadyExists { .. }));
        assert!(failure.partial.is_none());
    }

    #[tokio::test]
    async fn test_install_dry_run_persists_nothing() {
        let f = fixture();
        let mut config = InstallConfig::new("web", "default");
        config.dry_run = true;

        let release = f
            .client
            .install(&config, &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap();
        assert!(release.manifest.contains("kind: Deployment"));
        assert!(f.storage.all_releases().await.is_empty());
        assert!(f.cluster.references().await.is_empty());
    }

    #[tokio::test]
    async fn test_install_failure_returns_partial_record() {
        let f = fixture();
        f.cluster.fail_on(ClusterOp::Create, "web", "admission denied").await;

        let failure = f
            .client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap_err();

        let partial = failure.partial.expect("record was stored");
        assert!(matches!(partial.state, ReleaseState::Failed { .. }));
        assert!(failure.error.to_string().contains("admission denied"));

        let stored = f.storage.get("default", "web", 1).await.unwrap();
        assert_eq!(stored.status().as_str(), "failed");
    }

    #[tokio::test]
    async fn test_upgrade_patches_and_removes_objects() {
        let f = fixture();
        f.client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap();

        let values = Values::from_yaml("replicas: 3\nservice: false\n").unwrap();
        let release = f
            .client
            .upgrade(&UpgradeConfig::new("web", "default"), &chart(), &values, &f.cancel)
            .await
            .unwrap();

        assert_eq!(release.version, 2);
        let live = f.cluster.object(&deployment_ref()).await.unwrap();
        assert_eq!(live["spec"]["replicas"], 3);
        assert!(f.cluster.object(&service_ref()).await.is_none());

        let history = f.storage.history("default", "web").await.unwrap();
        assert_eq!(history[0].status().as_str(), "deployed");
        assert_eq!(history[1].status().as_str(), "superseded");
    }

    #[tokio::test]
    async fn test_upgrade_requires_deployed_release() {
        let f = fixture();
        let failure = f
            .client
            .upgrade(&UpgradeConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap_err();
        assert!(failure.error.is_not_found());
        assert!(failure.partial.is_none());
    }

    #[tokio::test]
    async fn test_upgrade_prunes_history() {
        let f = fixture();
        f.client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap();

        let mut config = UpgradeConfig::new("web", "default");
        config.max_history = 2;
        for replicas in 2..=4 {
            let values = Values::from_yaml(&format!("replicas: {}", replicas)).unwrap();
            f.client.upgrade(&config, &chart(), &values, &f.cancel).await.unwrap();
        }

        let versions: Vec<u32> = f
            .storage
            .history("default", "web")
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![4, 3]);
    }

    #[tokio::test]
    async fn test_forced_rollback_recreates_rejected_objects() {
        let f = fixture();
        f.client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap();

        f.cluster.fail_on(ClusterOp::Patch, "web", "field is immutable").await;
        let values = Values::from_yaml("replicas: 5").unwrap();
        let failure = f
            .client
            .upgrade(&UpgradeConfig::new("web", "default"), &chart(), &values, &f.cancel)
            .await
            .unwrap_err();
        assert_eq!(failure.partial.as_ref().map(|r| r.version), Some(2));

        let mut partially_applied = f.cluster.object(&deployment_ref()).await.unwrap();
        partially_applied["spec"]["replicas"] = serde_json::json!(5);
        f.cluster.put(deployment_ref(), partially_applied).await;

        let err = f
            .client
            .rollback(&RollbackConfig::new("web", "default").to_version(1), &f.cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("field is immutable"));

        let release = f
            .client
            .rollback(&RollbackConfig::new("web", "default").with_force(), &f.cancel)
            .await
            .unwrap();
        assert_eq!(release.version, 4);
        assert_eq!(release.description.as_deref(), Some("Rollback to 1"));

        let live = f.cluster.object(&deployment_ref()).await.unwrap();
        assert_eq!(live["spec"]["replicas"], 1);
        assert_eq!(f.storage.deployed("default", "web").await.unwrap().version, 4);
    }

    #[tokio::test]
    async fn test_uninstall_deletes_objects_and_history() {
        let f = fixture();
        f.client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap();

        let release = f
            .client
            .uninstall(&UninstallConfig::new("web", "default"), &f.cancel)
            .await
            .unwrap();

        assert_eq!(release.status().as_str(), "uninstalled");
        assert!(f.cluster.references().await.is_empty());
        assert!(f.storage.all_releases().await.is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_keep_history_skips_missing_objects() {
        let f = fixture();
        f.client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap();
        f.cluster.delete(&service_ref()).await.unwrap();

        let mut config = UninstallConfig::new("web", "default");
        config.keep_history = true;
        f.client.uninstall(&config, &f.cancel).await.unwrap();

        let stored = f.storage.get("default", "web", 1).await.unwrap();
        assert_eq!(stored.status().as_str(), "uninstalled");
    }

    #[tokio::test]
    async fn test_reconcile_corrects_drift() {
        let f = fixture();
        let release = f
            .client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap();

        let summary = f.client.reconcile(&release, &f.cancel).await.unwrap();
        assert!(!summary.changed());
        assert_eq!(summary.unchanged.len(), 2);

        let mut drifted = f.cluster.object(&deployment_ref()).await.unwrap();
        drifted["spec"]["replicas"] = serde_json::json!(9);
        f.cluster.put(deployment_ref(), drifted).await;
        f.cluster.delete(&service_ref()).await.unwrap();

        let summary = f.client.reconcile(&release, &f.cancel).await.unwrap();
        assert_eq!(summary.patched, vec!["Deployment default/web".to_string()]);
        assert_eq!(summary.created, vec!["Service default/web".to_string()]);
        assert_eq!(f.cluster.object(&deployment_ref()).await.unwrap()["spec"]["replicas"], 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_mutation() {
        let f = fixture();
        f.cancel.cancel();

        let failure = f
            .client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap_err();
        assert!(failure.error.is_cancelled());
        assert!(f.storage.all_releases().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces() {
        let f = fixture();
        f.storage.fail_on(StorageOp::Create, "etcd unavailable").await;

        let failure = f
            .client
            .install(&InstallConfig::new("web", "default"), &chart(), &Values::new(), &f.cancel)
            .await
            .unwrap_err();
        assert!(failure.partial.is_none());
        assert_eq!(failure.error.to_string(), "storage error: etcd unavailable");
        assert!(f.cluster.references().await.is_empty());
    }
}
