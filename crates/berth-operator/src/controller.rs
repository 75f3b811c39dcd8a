//! ChartRelease reconciliation
//!
//! Each reconcile builds a fresh [`ReleaseManager`], syncs it and performs at
//! most one transition: install, upgrade, or a drift-correcting reconcile of
//! the deployed release. Deletion is guarded by a finalizer that uninstalls
//! the release first.

use std::sync::Arc;
use std::time::Duration;

use berth_kube::{
    DiffEngine, ForceUpgrade, MaxHistory, ReleaseManager, StoredRelease, UpgradeOption,
};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event, finalizer};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;

use crate::crd::{ChartRelease, ChartReleaseStatus, ReleasePhase, manifest_digest};
use crate::error::{OperatorError, Result};
use crate::factory::ManagerFactory;

pub const RELEASE_FINALIZER: &str = "berth.dev/release";

/// Field manager for status patches
const FIELD_MANAGER: &str = "berth-operator";

/// Reconcile timing
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Delay before retrying a failed reconcile
    pub requeue: Duration,

    /// Delay before re-checking a healthy release for drift
    pub resync: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            requeue: Duration::from_secs(30),
            resync: Duration::from_secs(300),
        }
    }
}

/// Shared state of the controller
pub struct Context {
    pub client: Client,
    pub factory: ManagerFactory,
    pub config: ControllerConfig,

    /// Cancelled on shutdown; every reconcile runs under a child token
    pub cancel: CancellationToken,
}

/// Transition performed by one reconcile
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Installed,
    Upgraded { from: u32 },
    Reconciled,
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub transition: Transition,
    pub release: StoredRelease,
}

impl Outcome {
    fn status(&self, generation: Option<i64>) -> ChartReleaseStatus {
        ChartReleaseStatus {
            phase: ReleasePhase::Deployed,
            version: Some(self.release.version),
            chart: Some(format!(
                "{}-{}",
                self.release.chart.name, self.release.chart.version
            )),
            manifest_digest: Some(manifest_digest(&self.release.manifest)),
            message: self.release.description.clone(),
            observed_generation: generation,
        }
    }
}

/// Sync the manager and perform the transition it calls for
pub async fn drive(
    manager: &mut ReleaseManager,
    force: bool,
    max_history: Option<u32>,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    manager.sync(cancel).await?;

    if !manager.is_installed() {
        let release = manager.install_release(&[], cancel).await?;
        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            "installed release"
        );
        return Ok(Outcome {
            transition: Transition::Installed,
            release,
        });
    }

    if manager.is_upgrade_required() {
        let mut options: Vec<UpgradeOption> = vec![Box::new(ForceUpgrade(force))];
        if let Some(max_history) = max_history {
            options.push(Box::new(MaxHistory(max_history)));
        }

        let (prior, release) = manager.upgrade_release(&options, cancel).await?;
        let engine = DiffEngine::new();
        let diff = engine.diff_releases(&prior, &release)?;
        tracing::info!(
            release = %release.name,
            namespace = %release.namespace,
            version = release.version,
            previous = prior.version,
            changes = %engine.summary(&diff),
            "upgraded release"
        );
        return Ok(Outcome {
            transition: Transition::Upgraded {
                from: prior.version,
            },
            release,
        });
    }

    let release = manager.reconcile_release(cancel).await?;
    tracing::debug!(
        release = %release.name,
        namespace = %release.namespace,
        version = release.version,
        "release up to date"
    );
    Ok(Outcome {
        transition: Transition::Reconciled,
        release,
    })
}

/// Uninstall the release; a release that is already gone counts as done
pub async fn teardown(manager: &ReleaseManager, cancel: &CancellationToken) -> Result<()> {
    match manager.uninstall_release(&[], cancel).await {
        Ok(release) => {
            tracing::info!(
                release = %release.name,
                namespace = %release.namespace,
                "uninstalled release"
            );
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(
                release = manager.release_name(),
                namespace = manager.namespace(),
                "release already uninstalled"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn reconcile(object: Arc<ChartRelease>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = object
        .namespace()
        .ok_or_else(|| OperatorError::MissingNamespace(object.name_any()))?;
    let api: Api<ChartRelease> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, RELEASE_FINALIZER, object, |event| async {
        match event {
            Event::Apply(object) => apply(&api, object, &ctx).await,
            Event::Cleanup(object) => cleanup(&api, object, &ctx).await,
        }
    })
    .await
    .map_err(|e| OperatorError::Finalizer(Box::new(e)))
}

pub fn error_policy(object: Arc<ChartRelease>, error: &OperatorError, ctx: Arc<Context>) -> Action {
    tracing::warn!(
        name = %object.name_any(),
        namespace = object.namespace().as_deref().unwrap_or_default(),
        error = %error,
        "reconcile failed"
    );
    Action::requeue(ctx.config.requeue)
}

async fn apply(api: &Api<ChartRelease>, object: Arc<ChartRelease>, ctx: &Context) -> Result<Action> {
    let cancel = ctx.cancel.child_token();
    let generation = object.metadata.generation;

    let result = match ctx.factory.new_manager(&object) {
        Ok(mut manager) => {
            drive(
                &mut manager,
                object.spec.force,
                object.spec.max_history,
                &cancel,
            )
            .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(outcome) => {
            patch_status(api, &object, outcome.status(generation)).await?;
            Ok(Action::requeue(ctx.config.resync))
        }
        Err(e) => {
            let status = ChartReleaseStatus {
                phase: ReleasePhase::Failed,
                message: Some(e.to_string()),
                observed_generation: generation,
                ..object.status.clone().unwrap_or_default()
            };
            if let Err(status_error) = patch_status(api, &object, status).await {
                tracing::warn!(
                    name = %object.name_any(),
                    error = %status_error,
                    "failed to record failure status"
                );
            }
            Err(e)
        }
    }
}

async fn cleanup(api: &Api<ChartRelease>, object: Arc<ChartRelease>, ctx: &Context) -> Result<Action> {
    let cancel = ctx.cancel.child_token();

    let status = ChartReleaseStatus {
        phase: ReleasePhase::Uninstalling,
        ..object.status.clone().unwrap_or_default()
    };
    if let Err(e) = patch_status(api, &object, status).await {
        tracing::debug!(name = %object.name_any(), error = %e, "cannot mark uninstalling");
    }

    let manager = ctx.factory.teardown_manager(&object)?;
    teardown(&manager, &cancel).await?;

    Ok(Action::await_change())
}

async fn patch_status(
    api: &Api<ChartRelease>,
    object: &ChartRelease,
    status: ChartReleaseStatus,
) -> Result<()> {
    if object.status.as_ref() == Some(&status) {
        return Ok(());
    }

    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &object.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
