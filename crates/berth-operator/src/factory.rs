//! Builds a release manager for a ChartRelease

use std::path::{Path, PathBuf};

use berth_core::{Chart, ChartMetadata, Values};
use berth_kube::{ReleaseClient, ReleaseManager};
use kube::ResourceExt;

use crate::crd::ChartRelease;
use crate::error::{OperatorError, Result};

/// Resolves charts from a directory and wires them to a release client
#[derive(Clone)]
pub struct ManagerFactory {
    client: ReleaseClient,
    charts_dir: PathBuf,
}

impl ManagerFactory {
    pub fn new(client: ReleaseClient, charts_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            charts_dir: charts_dir.into(),
        }
    }

    pub fn charts_dir(&self) -> &Path {
        &self.charts_dir
    }

    /// Manager for the release declared by `object`
    ///
    /// The chart is loaded fresh on every call so chart updates on disk are
    /// picked up by the next reconcile.
    pub fn new_manager(&self, object: &ChartRelease) -> Result<ReleaseManager> {
        let (release_name, namespace) = release_identity(object)?;

        let chart = self.load_chart(&object.spec.chart.name)?;
        if let Some(requirement) = &object.spec.chart.version {
            chart.ensure_version(requirement)?;
        }
        let values = Values::from_json_value(object.spec.values.clone())?;

        Ok(ReleaseManager::new(
            self.client.clone(),
            release_name,
            namespace,
            chart,
            values,
        ))
    }

    /// Manager able to uninstall the release declared by `object`
    ///
    /// Uninstalling works from the stored records alone, so the chart is not
    /// loaded and a chart removed from disk does not block deletion.
    pub fn teardown_manager(&self, object: &ChartRelease) -> Result<ReleaseManager> {
        let (release_name, namespace) = release_identity(object)?;
        let chart = Chart::new(ChartMetadata::new(
            object.spec.chart.name.clone(),
            semver::Version::new(0, 0, 0),
        ));
        Ok(ReleaseManager::new(
            self.client.clone(),
            release_name,
            namespace,
            chart,
            Values::new(),
        ))
    }

    fn load_chart(&self, name: &str) -> Result<Chart> {
        let path = self.charts_dir.join(name);
        if name.contains(['/', '\\']) || name == ".." || !path.is_dir() {
            return Err(OperatorError::ChartNotFound {
                name: name.to_string(),
                dir: self.charts_dir.display().to_string(),
            });
        }
        Ok(Chart::load(&path)?)
    }
}

/// Release name and namespace declared by `object`
fn release_identity(object: &ChartRelease) -> Result<(String, String)> {
    let namespace = object
        .namespace()
        .ok_or_else(|| OperatorError::MissingNamespace(object.name_any()))?;
    let release_name = object
        .spec
        .release_name
        .clone()
        .unwrap_or_else(|| object.name_any());
    Ok((release_name, namespace))
}
