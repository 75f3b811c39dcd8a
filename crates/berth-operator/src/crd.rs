//! ChartRelease custom resource

use kube::CustomResource;
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Desired release of a chart into the namespace of this object
///
/// Example:
/// ```yaml
/// apiVersion: berth.dev/v1alpha1
/// kind: ChartRelease
/// metadata:
///   name: shop
///   namespace: store
/// spec:
///   chart:
///     name: shop
///     version: "^2.1"
///   values:
///     replicas: 3
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "berth.dev",
    version = "v1alpha1",
    kind = "ChartRelease",
    namespaced,
    status = "ChartReleaseStatus",
    shortname = "chr",
    printcolumn = r#"{"name":"Chart","type":"string","jsonPath":".status.chart"}"#,
    printcolumn = r#"{"name":"Version","type":"integer","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChartReleaseSpec {
    pub chart: ChartReference,

    /// Release name; defaults to the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Values merged over the chart defaults
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub values: serde_json::Value,

    /// Recreate objects whose patch is rejected during upgrades
    #[serde(default)]
    pub force: bool,

    /// Versions kept per release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history: Option<u32>,
}

/// A chart in the operator's charts directory
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartReference {
    pub name: String,

    /// SemVer requirement the chart version must satisfy, e.g. `^2.1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartReleaseStatus {
    pub phase: ReleasePhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    /// `name-version` of the deployed chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,

    /// SHA-256 of the deployed manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReleasePhase {
    #[default]
    Pending,
    Deployed,
    Failed,
    Uninstalling,
}

impl std::fmt::Display for ReleasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Deployed => write!(f, "Deployed"),
            Self::Failed => write!(f, "Failed"),
            Self::Uninstalling => write!(f, "Uninstalling"),
        }
    }
}

/// Hex SHA-256 of a rendered manifest
pub fn manifest_digest(manifest: &str) -> String {
    hex::encode(Sha256::digest(manifest.as_bytes()))
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
