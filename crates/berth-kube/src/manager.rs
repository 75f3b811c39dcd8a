//! Release manager: keeps one release in step with its desired chart and values
//!
//! A manager is built per reconcile. [`ReleaseManager::sync`] inspects storage
//! and records what the release needs; the lifecycle methods then act on it and
//! compensate when an action leaves a half-applied release behind.

use berth_core::{Chart, Values};
use tokio_util::sync::CancellationToken;

use crate::actions::{
    InstallConfig, InstallOption, RollbackConfig, UninstallConfig, UninstallOption,
    UpgradeConfig, UpgradeOption, apply_options,
};
use crate::client::ReleaseClient;
use crate::error::{KubeError, Result};
use crate::release::StoredRelease;
use crate::storage::{RELEASE_NAME_LABEL, RELEASE_NAMESPACE_LABEL};

/// What the last [`ReleaseManager::sync`] found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub is_installed: bool,
    pub is_upgrade_required: bool,
    pub deployed_release: Option<StoredRelease>,
}

/// Manages a single release
pub struct ReleaseManager {
    client: ReleaseClient,
    release_name: String,
    namespace: String,
    chart: Chart,
    values: Values,
    state: SyncState,
}

impl std::fmt::Debug for ReleaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseManager")
            .field("release_name", &self.release_name)
            .field("namespace", &self.namespace)
            .field("chart", &self.chart.metadata.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ReleaseManager {
    pub fn new(
        client: ReleaseClient,
        release_name: impl Into<String>,
        namespace: impl Into<String>,
        chart: Chart,
        values: Values,
    ) -> Self {
        Self {
            client,
            release_name: release_name.into(),
            namespace: namespace.into(),
            chart,
            values,
            state: SyncState::default(),
        }
    }

    pub fn release_name(&self) -> &str {
        &self.release_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn chart(&self) -> &Chart {
        &self.chart
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn is_installed(&self) -> bool {
        self.state.is_installed
    }

    pub fn is_upgrade_required(&self) -> bool {
        self.state.is_upgrade_required
    }

    pub fn deployed_release(&self) -> Option<&StoredRelease> {
        self.state.deployed_release.as_ref()
    }

    // ========== Sync ==========

    /// Refresh the sync state from storage
    ///
    /// Versions that are not deployed are deleted first, so a release whose
    /// versions all failed is seen as not installed and gets installed again.
    /// The upgrade check renders the desired manifest without persisting it and
    /// compares it byte for byte with the deployed one.
    pub async fn sync(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.state = SyncState::default();

        self.cleanup_releases(cancel)
            .await
            .map_err(|e| e.context("cleanup releases", &self.release_name))?;

        let deployed = match self
            .client
            .deployed(&self.namespace, &self.release_name, cancel)
            .await
        {
            Ok(deployed) => deployed,
            Err(e) if e.is_not_found() => {
                tracing::debug!(
                    release = %self.release_name,
                    namespace = %self.namespace,
                    "release not installed"
                );
                return Ok(());
            }
            Err(e) => return Err(e.context("get deployed release", &self.release_name)),
        };

        self.state.is_installed = true;
        self.state.deployed_release = Some(deployed.clone());

        let candidate = self
            .candidate_release(cancel)
            .await
            .map_err(|e| e.context("get candidate release", &self.release_name))?;

        self.state.is_upgrade_required = candidate.manifest != deployed.manifest;

        tracing::debug!(
            release = %self.release_name,
            namespace = %self.namespace,
            upgrade_required = self.state.is_upgrade_required,
            "synced release state"
        );
        Ok(())
    }

    async fn cleanup_releases(&self, cancel: &CancellationToken) -> Result<()> {
        let history = match self
            .client
            .history(&self.namespace, &self.release_name, cancel)
            .await
        {
            Ok(history) => history,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        for stale in history.iter().filter(|r| !r.is_deployed()) {
            tracing::debug!(
                release = %self.release_name,
                namespace = %self.namespace,
                version = stale.version,
                state = %stale.state,
                "deleting stale release version"
            );
            match self
                .client
                .delete_version(&self.namespace, &self.release_name, stale.version, cancel)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.context("delete stale release version", &self.release_name)),
            }
        }
        Ok(())
    }

    async fn candidate_release(&self, cancel: &CancellationToken) -> Result<StoredRelease> {
        let mut config = UpgradeConfig::new(&self.release_name, &self.namespace);
        config.dry_run = true;
        self.client
            .upgrade(&config, &self.chart, &self.values, cancel)
            .await
            .map_err(|failure| failure.error)
    }

    // ========== Install ==========

    /// Install the release
    ///
    /// When the install fails after persisting a record, one uninstall is run
    /// to clean up. An uninstall failure other than "not found" is reported
    /// together with the install failure.
    pub async fn install_release(
        &self,
        options: &[InstallOption],
        cancel: &CancellationToken,
    ) -> Result<StoredRelease> {
        let mut config = InstallConfig::new(&self.release_name, &self.namespace);
        apply_options("install", &mut config, options)?;
        // release identity labels override caller labels
        config
            .labels
            .insert(RELEASE_NAME_LABEL.to_string(), self.release_name.clone());
        config
            .labels
            .insert(RELEASE_NAMESPACE_LABEL.to_string(), self.namespace.clone());

        let failure = match self
            .client
            .install(&config, &self.chart, &self.values, cancel)
            .await
        {
            Ok(release) => return Ok(release),
            Err(failure) => failure,
        };

        if let Some(partial) = &failure.partial {
            tracing::warn!(
                release = %self.release_name,
                namespace = %self.namespace,
                version = partial.version,
                error = %failure.error,
                "install failed, uninstalling partial release"
            );
            let uninstall = UninstallConfig::new(&self.release_name, &self.namespace);
            match self.client.uninstall(&uninstall, cancel).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(KubeError::InstallRollbackFailed {
                        install: Box::new(failure.error),
                        uninstall: Box::new(e),
                    });
                }
            }
        }

        Err(KubeError::InstallFailed(Box::new(failure.error)))
    }

    // ========== Upgrade ==========

    /// Upgrade the release, returning the previously deployed and the new record
    ///
    /// When the upgrade fails after persisting a record, a forced rollback to
    /// the previously deployed version is attempted; if it fails too, both
    /// errors are reported.
    pub async fn upgrade_release(
        &self,
        options: &[UpgradeOption],
        cancel: &CancellationToken,
    ) -> Result<(StoredRelease, StoredRelease)> {
        let mut config = UpgradeConfig::new(&self.release_name, &self.namespace);
        apply_options("upgrade", &mut config, options)?;

        let prior = self
            .client
            .deployed(&self.namespace, &self.release_name, cancel)
            .await
            .map_err(|e| KubeError::UpgradeFailed(Box::new(e)))?;

        let failure = match self
            .client
            .upgrade(&config, &self.chart, &self.values, cancel)
            .await
        {
            Ok(upgraded) => return Ok((prior, upgraded)),
            Err(failure) => failure,
        };

        if let Some(partial) = &failure.partial {
            tracing::warn!(
                release = %self.release_name,
                namespace = %self.namespace,
                version = partial.version,
                target = prior.version,
                error = %failure.error,
                "upgrade failed, rolling back"
            );
            let rollback = RollbackConfig::new(&self.release_name, &self.namespace)
                .to_version(prior.version)
                .with_force();
            if let Err(e) = self.client.rollback(&rollback, cancel).await {
                return Err(KubeError::UpgradeRollbackFailed {
                    upgrade: Box::new(failure.error),
                    rollback: Box::new(e),
                });
            }
        }

        Err(KubeError::UpgradeFailed(Box::new(failure.error)))
    }

    // ========== Reconcile ==========

    /// Re-apply the deployed manifest to the cluster, correcting drift
    ///
    /// Uses the release found by the last sync, or the stored deployed release
    /// when the manager has not been synced.
    pub async fn reconcile_release(&self, cancel: &CancellationToken) -> Result<StoredRelease> {
        let deployed = match &self.state.deployed_release {
            Some(deployed) => deployed.clone(),
            None => self.get_deployed_release(cancel).await?,
        };

        self.client
            .reconcile(&deployed, cancel)
            .await
            .map_err(|e| e.context("reconcile release", &self.release_name))?;
        Ok(deployed)
    }

    // ========== Uninstall ==========

    /// Uninstall the release
    ///
    /// The history is checked first; a release without any stored version is
    /// reported as not found and nothing is invoked.
    pub async fn uninstall_release(
        &self,
        options: &[UninstallOption],
        cancel: &CancellationToken,
    ) -> Result<StoredRelease> {
        self.client
            .history(&self.namespace, &self.release_name, cancel)
            .await
            .map_err(|e| e.context("get release history", &self.release_name))?;

        let mut config = UninstallConfig::new(&self.release_name, &self.namespace);
        apply_options("uninstall", &mut config, options)?;

        self.client.uninstall(&config, cancel).await
    }

    /// The currently deployed record, read fresh from storage
    pub async fn get_deployed_release(&self, cancel: &CancellationToken) -> Result<StoredRelease> {
        self.client
            .deployed(&self.namespace, &self.release_name, cancel)
            .await
            .map_err(|e| e.context("get deployed release", &self.release_name))
    }
}
