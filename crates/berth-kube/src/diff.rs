//! Diff engine for comparing releases and detecting cluster drift

use similar::TextDiff;
use std::collections::BTreeMap;

use crate::cluster::ClusterClient;
use crate::error::Result;
use crate::manifest::{ObjectRef, parse_manifest};
use crate::patch::create_patch;
use crate::release::StoredRelease;

/// Diff engine for release comparison
pub struct DiffEngine {
    /// Show context lines around changes
    pub context_lines: usize,
}

impl DiffEngine {
    pub fn new() -> Self {
        Self { context_lines: 3 }
    }

    pub fn with_context(mut self, lines: usize) -> Self {
        self.context_lines = lines;
        self
    }

    /// Compare the manifests of two release records
    pub fn diff_releases(&self, old: &StoredRelease, new: &StoredRelease) -> Result<DiffResult> {
        let old_objects = documents(&old.manifest, &old.namespace)?;
        let new_objects = documents(&new.manifest, &new.namespace)?;

        let mut changes = Vec::new();

        for (reference, new_content) in &new_objects {
            match old_objects.get(reference) {
                Some(old_content) if old_content != new_content => changes.push(ObjectChange {
                    reference: reference.clone(),
                    change_type: ChangeType::Modified,
                    diff: self.unified_diff(old_content, new_content),
                    is_drift: false,
                }),
                Some(_) => {}
                None => changes.push(ObjectChange {
                    reference: reference.clone(),
                    change_type: ChangeType::Added,
                    diff: self.unified_diff("", new_content),
                    is_drift: false,
                }),
            }
        }

        for (reference, old_content) in &old_objects {
            if !new_objects.contains_key(reference) {
                changes.push(ObjectChange {
                    reference: reference.clone(),
                    change_type: ChangeType::Removed,
                    diff: self.unified_diff(old_content, ""),
                    is_drift: false,
                });
            }
        }

        Ok(DiffResult {
            old_version: old.version,
            new_version: new.version,
            changes,
        })
    }

    /// Compare a release manifest with the live cluster
    ///
    /// An object drifted when the patch calculator would patch it; a missing
    /// object counts as removed.
    pub async fn detect_drift(
        &self,
        release: &StoredRelease,
        cluster: &dyn ClusterClient,
    ) -> Result<DiffResult> {
        let mut changes = Vec::new();

        for object in parse_manifest(&release.manifest, &release.namespace)? {
            match cluster.get(&object.reference).await? {
                None => changes.push(ObjectChange {
                    reference: object.reference,
                    change_type: ChangeType::Removed,
                    diff: String::new(),
                    is_drift: true,
                }),
                Some(live) => {
                    let patch = create_patch(&live, &object.object)?;
                    if let Some(body) = patch.body {
                        changes.push(ObjectChange {
                            reference: object.reference,
                            change_type: ChangeType::Modified,
                            diff: serde_json::to_string_pretty(&body)?,
                            is_drift: true,
                        });
                    }
                }
            }
        }

        Ok(DiffResult {
            old_version: release.version,
            new_version: release.version,
            changes,
        })
    }

    fn unified_diff(&self, old: &str, new: &str) -> String {
        TextDiff::from_lines(old, new)
            .unified_diff()
            .context_radius(self.context_lines)
            .to_string()
    }

    /// Generate a human-readable summary
    pub fn summary(&self, result: &DiffResult) -> String {
        let count = |t: ChangeType| result.changes.iter().filter(|c| c.change_type == t).count();
        let drift = result.changes.iter().filter(|c| c.is_drift).count();

        let mut parts = Vec::new();
        for (n, label) in [
            (count(ChangeType::Added), "added"),
            (count(ChangeType::Modified), "modified"),
            (count(ChangeType::Removed), "removed"),
            (drift, "drifted"),
        ] {
            if n > 0 {
                parts.push(format!("{} {}", n, label));
            }
        }

        if parts.is_empty() {
            "No changes".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of comparing releases or detecting drift
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub old_version: u32,
    pub new_version: u32,
    pub changes: Vec<ObjectChange>,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn has_drift(&self) -> bool {
        self.changes.iter().any(|c| c.is_drift)
    }
}

/// A change to a single object
#[derive(Debug, Clone)]
pub struct ObjectChange {
    pub reference: ObjectRef,
    pub change_type: ChangeType,
    /// Unified text diff, or the pending patch for drift
    pub diff: String,
    pub is_drift: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Added => write!(f, "added"),
            ChangeType::Modified => write!(f, "modified"),
            ChangeType::Removed => write!(f, "removed"),
        }
    }
}

/// Objects of a manifest as normalized YAML, keyed by reference
fn documents(manifest: &str, namespace: &str) -> Result<BTreeMap<ObjectRef, String>> {
    parse_manifest(manifest, namespace)?
        .into_iter()
        .map(|o| -> Result<(ObjectRef, String)> {
            Ok((o.reference, serde_yaml::to_string(&o.object)?))
        })
        .collect()
}
