//! Manifest parsing and object ordering

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::{KubeError, Result};

/// Address of one Kubernetes object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    /// `None` for cluster-scoped objects
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(_, version)| version)
            .unwrap_or(&self.api_version)
    }

    pub fn gvk(&self) -> kube::core::GroupVersionKind {
        kube::core::GroupVersionKind::gvk(self.group(), self.version(), &self.kind)
    }

    /// Read the reference out of an object's `apiVersion`, `kind` and `metadata`
    pub fn from_object(object: &Value) -> Result<Self> {
        let field = |pointer: &str| object.pointer(pointer).and_then(Value::as_str);

        let api_version = field("/apiVersion")
            .ok_or_else(|| KubeError::InvalidManifest("object missing apiVersion".to_string()))?;
        let kind = field("/kind")
            .ok_or_else(|| KubeError::InvalidManifest("object missing kind".to_string()))?;
        let name = field("/metadata/name").ok_or_else(|| {
            KubeError::InvalidManifest(format!("{} missing metadata.name", kind))
        })?;

        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: field("/metadata/namespace").map(str::to_string),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// One object of a rendered manifest
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestObject {
    pub reference: ObjectRef,
    pub object: Value,
}

/// Kinds that never live in a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CSIDriver",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

/// Parse a multi-document YAML manifest
///
/// Empty and comment-only documents are skipped. Namespaced objects without
/// an explicit namespace get `default_namespace`, both in the reference and
/// in the object itself.
pub fn parse_manifest(manifest: &str, default_namespace: &str) -> Result<Vec<ManifestObject>> {
    let mut objects = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(manifest).enumerate() {
        let mut object = Value::deserialize(document).map_err(|e| {
            KubeError::InvalidManifest(format!("document {}: {}", index, e))
        })?;
        if object.is_null() {
            continue;
        }
        if !object.is_object() {
            return Err(KubeError::InvalidManifest(format!(
                "document {} is not a mapping",
                index
            )));
        }

        let mut reference = ObjectRef::from_object(&object)
            .map_err(|e| KubeError::InvalidManifest(format!("document {}: {}", index, e)))?;

        if CLUSTER_SCOPED_KINDS.contains(&reference.kind.as_str()) {
            reference.namespace = None;
        } else if reference.namespace.is_none() {
            reference.namespace = Some(default_namespace.to_string());
            if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
                metadata.insert(
                    "namespace".to_string(),
                    Value::String(default_namespace.to_string()),
                );
            }
        }

        objects.push(ManifestObject { reference, object });
    }

    Ok(objects)
}

/// Resource category for ordering during apply
///
/// Objects are applied from the lowest category to the highest so that
/// dependencies (CRDs, namespaces, RBAC) exist before workloads, and deleted
/// in the reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceCategory {
    Crd = 0,
    Namespace = 1,
    /// ResourceQuota, LimitRange
    NamespaceConfig = 2,
    ClusterRbac = 10,
    /// Role, RoleBinding, ServiceAccount
    NamespacedRbac = 11,
    /// ConfigMap, Secret
    Config = 20,
    Storage = 21,
    Network = 30,
    Workload = 40,
    Batch = 50,
    Autoscaling = 60,
    CustomResource = 70,
    Other = 100,
}

/// Groups served by Kubernetes itself
pub const BUILT_IN_GROUPS: &[&str] = &[
    "",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "apps",
    "authentication.k8s.io",
    "authorization.k8s.io",
    "autoscaling",
    "batch",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "flowcontrol.apiserver.k8s.io",
    "networking.k8s.io",
    "node.k8s.io",
    "policy",
    "rbac.authorization.k8s.io",
    "resource.k8s.io",
    "scheduling.k8s.io",
    "storage.k8s.io",
];

/// Whether an API group is served by an extension rather than Kubernetes itself
pub fn is_custom_group(group: &str) -> bool {
    !BUILT_IN_GROUPS.contains(&group)
}

impl ResourceCategory {
    pub fn of(reference: &ObjectRef) -> Self {
        match reference.kind.as_str() {
            "CustomResourceDefinition" => Self::Crd,
            "Namespace" => Self::Namespace,
            "ResourceQuota" | "LimitRange" => Self::NamespaceConfig,
            "ClusterRole" | "ClusterRoleBinding" => Self::ClusterRbac,
            "Role" | "RoleBinding" | "ServiceAccount" => Self::NamespacedRbac,
            "ConfigMap" | "Secret" => Self::Config,
            "PersistentVolume" | "PersistentVolumeClaim" | "StorageClass" => Self::Storage,
            "NetworkPolicy" | "Service" | "Endpoints" | "Ingress" | "IngressClass" => Self::Network,
            "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" | "Pod" => Self::Workload,
            "Job" | "CronJob" => Self::Batch,
            "HorizontalPodAutoscaler" | "PodDisruptionBudget" => Self::Autoscaling,
            _ if is_custom_group(reference.group()) => Self::CustomResource,
            _ => Self::Other,
        }
    }
}

/// Order objects for creation (stable within a category)
pub fn sort_for_apply(objects: &mut [ManifestObject]) {
    objects.sort_by_key(|o| ResourceCategory::of(&o.reference));
}

/// Order objects for deletion, the reverse of [`sort_for_apply`]
pub fn sort_for_delete(objects: &mut [ManifestObject]) {
    objects.sort_by_key(|o| std::cmp::Reverse(ResourceCategory::of(&o.reference)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"---
# Source: web/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
---
# Source: web/templates/namespace.yaml
apiVersion: v1
kind: Namespace
metadata:
  name: team-a
---
# comment only
---
apiVersion: example.com/v1
kind: Widget
metadata:
  name: gadget
  namespace: other
"#;

    #[test]
    fn test_parse_manifest() {
        let objects = parse_manifest(MANIFEST, "default").unwrap();
        assert_eq!(objects.len(), 3);

        let deploy = &objects[0];
        assert_eq!(deploy.reference.to_string(), "Deployment default/web");
        assert_eq!(deploy.object["metadata"]["namespace"], "default");
        assert_eq!(deploy.reference.group(), "apps");
        assert_eq!(deploy.reference.version(), "v1");

        let ns = &objects[1];
        assert_eq!(ns.reference.namespace, None);
        assert_eq!(ns.reference.group(), "");
        assert!(ns.object["metadata"].get("namespace").is_none());

        assert_eq!(objects[2].reference.namespace.as_deref(), Some("other"));
    }

    #[test]
    fn test_parse_rejects_incomplete_objects() {
        let err = parse_manifest("apiVersion: v1\nkind: ConfigMap\n", "default").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));

        let err = parse_manifest("- a\n- b\n", "default").unwrap_err();
        assert!(err.to_string().contains("not a mapping"));
    }

    #[test]
    fn test_empty_manifest() {
        assert!(parse_manifest("", "default").unwrap().is_empty());
    }

    #[test]
    fn test_ordering() {
        let mut objects = parse_manifest(MANIFEST, "default").unwrap();

        sort_for_apply(&mut objects);
        let kinds: Vec<&str> = objects.iter().map(|o| o.reference.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Namespace", "Deployment", "Widget"]);

        sort_for_delete(&mut objects);
        let kinds: Vec<&str> = objects.iter().map(|o| o.reference.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Widget", "Deployment", "Namespace"]);
    }

    #[test]
    fn test_custom_groups() {
        assert!(!is_custom_group(""));
        assert!(!is_custom_group("apps"));
        assert!(!is_custom_group("apiextensions.k8s.io"));
        assert!(is_custom_group("cert-manager.io"));
    }
}
