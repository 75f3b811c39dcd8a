//! Cluster object transport
//!
//! [`ClusterClient`] is the seam between the release actions and the API
//! server. [`KubeCluster`] talks to a real cluster through dynamic objects
//! resolved with API discovery; [`MemoryCluster`] keeps objects in memory
//! for tests.

use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    discovery::{Discovery, Scope},
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{KubeError, Result};
use crate::manifest::ObjectRef;
use crate::patch::{ObjectPatch, PatchFormat, apply_strategic_merge_patch};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "berth";

/// Get, create, patch and delete objects addressed by [`ObjectRef`]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// The live object, or `None` when it does not exist
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Value>>;

    async fn create(&self, reference: &ObjectRef, object: &Value) -> Result<()>;

    /// Apply a computed patch; an empty patch is a no-op
    async fn patch(&self, reference: &ObjectRef, patch: &ObjectPatch) -> Result<()>;

    /// Delete an object; `false` when it was already gone
    async fn delete(&self, reference: &ObjectRef) -> Result<bool>;
}

fn object_error(action: &'static str, reference: &ObjectRef, message: impl ToString) -> KubeError {
    KubeError::ObjectOperation {
        action,
        object: reference.to_string(),
        message: message.to_string(),
    }
}

/// [`ClusterClient`] backed by the Kubernetes API
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl KubeCluster {
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(KubeError::Api)?;

        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
        })
    }

    /// Create from existing client and discovery (for reuse)
    pub fn with_discovery(client: Client, discovery: Discovery) -> Self {
        Self {
            client,
            discovery: RwLock::new(discovery),
        }
    }

    /// Refresh the discovery cache, needed once new CRDs are established
    pub async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(KubeError::Api)?;
        *self.discovery.write().await = discovery;
        Ok(())
    }

    async fn api_for(&self, reference: &ObjectRef) -> Result<Api<DynamicObject>> {
        let gvk = reference.gvk();
        let mut resolved = self.discovery.read().await.resolve_gvk(&gvk);
        if resolved.is_none() {
            tracing::debug!(api_version = %reference.api_version, kind = %reference.kind, "type not in discovery cache, refreshing");
            self.refresh_discovery().await?;
            resolved = self.discovery.read().await.resolve_gvk(&gvk);
        }

        let (resource, capabilities) = resolved.ok_or_else(|| {
            KubeError::InvalidManifest(format!(
                "unknown resource type {} {}",
                reference.api_version, reference.kind
            ))
        })?;

        let api = match (capabilities.scope, reference.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &resource),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &resource),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &resource),
        };
        Ok(api)
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Value>> {
        let api = self.api_for(reference).await?;
        match api.get_opt(&reference.name).await? {
            Some(object) => Ok(Some(serde_json::to_value(object)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, reference: &ObjectRef, object: &Value) -> Result<()> {
        let api = self.api_for(reference).await?;
        let object: DynamicObject = serde_json::from_value(object.clone())?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        api.create(&params, &object)
            .await
            .map_err(|e| object_error("create", reference, e))?;
        Ok(())
    }

    async fn patch(&self, reference: &ObjectRef, patch: &ObjectPatch) -> Result<()> {
        let Some(body) = &patch.body else {
            return Ok(());
        };
        let api = self.api_for(reference).await?;
        let params = Self::patch_params();

        let result = match patch.format {
            PatchFormat::StrategicMerge => {
                api.patch(&reference.name, &params, &Patch::Strategic(body))
                    .await
            }
            PatchFormat::Json => {
                let operations: json_patch::Patch = serde_json::from_value(body.clone())?;
                api.patch(&reference.name, &params, &Patch::<Value>::Json(operations))
                    .await
            }
        };

        result.map_err(|e| object_error("patch", reference, e))?;
        Ok(())
    }

    async fn delete(&self, reference: &ObjectRef) -> Result<bool> {
        let api = self.api_for(reference).await?;
        let params = DeleteParams {
            propagation_policy: Some(kube::api::PropagationPolicy::Background),
            ..Default::default()
        };

        match api.delete(&reference.name, &params).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(object_error("delete", reference, e)),
        }
    }
}

/// Cluster operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    Get,
    Create,
    Patch,
    Delete,
}

impl ClusterOp {
    fn action(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Create => "create",
            Self::Patch => "patch",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClusterCounts {
    pub gets: usize,
    pub creates: usize,
    pub patches: usize,
    pub deletes: usize,
}

/// In-memory [`ClusterClient`]
///
/// Objects get a `uid` and a `resourceVersion` on create, like the API
/// server does. Failures are injected per operation and object name.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    objects: Arc<RwLock<BTreeMap<ObjectRef, Value>>>,
    failures: Arc<RwLock<HashMap<(ClusterOp, String), String>>>,
    operations: Arc<RwLock<ClusterCounts>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `op` on objects called `name` fail
    pub async fn fail_on(&self, op: ClusterOp, name: impl Into<String>, message: impl Into<String>) {
        self.failures
            .write()
            .await
            .insert((op, name.into()), message.into());
    }

    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    pub async fn operation_counts(&self) -> ClusterCounts {
        self.operations.read().await.clone()
    }

    pub async fn reset_counts(&self) {
        *self.operations.write().await = ClusterCounts::default();
    }

    pub async fn object(&self, reference: &ObjectRef) -> Option<Value> {
        self.objects.read().await.get(reference).cloned()
    }

    pub async fn references(&self) -> Vec<ObjectRef> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Overwrite an object out of band, as another writer would
    pub async fn put(&self, reference: ObjectRef, object: Value) {
        self.objects.write().await.insert(reference, object);
    }

    async fn check(&self, op: ClusterOp, reference: &ObjectRef) -> Result<()> {
        {
            let mut ops = self.operations.write().await;
            match op {
                ClusterOp::Get => ops.gets += 1,
                ClusterOp::Create => ops.creates += 1,
                ClusterOp::Patch => ops.patches += 1,
                ClusterOp::Delete => ops.deletes += 1,
            }
        }
        match self.failures.read().await.get(&(op, reference.name.clone())) {
            Some(message) => Err(object_error(op.action(), reference, message)),
            None => Ok(()),
        }
    }
}

fn bump_resource_version(object: &mut Value) {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        let next = metadata
            .get("resourceVersion")
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        metadata.insert("resourceVersion".to_string(), Value::String(next.to_string()));
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, reference: &ObjectRef) -> Result<Option<Value>> {
        self.check(ClusterOp::Get, reference).await?;
        Ok(self.objects.read().await.get(reference).cloned())
    }

    async fn create(&self, reference: &ObjectRef, object: &Value) -> Result<()> {
        self.check(ClusterOp::Create, reference).await?;

        let mut objects = self.objects.write().await;
        if objects.contains_key(reference) {
            return Err(object_error("create", reference, "already exists"));
        }

        let mut object = object.clone();
        let uid = format!("uid-{}", objects.len() + 1);
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("uid".to_string(), Value::String(uid));
        }
        bump_resource_version(&mut object);
        objects.insert(reference.clone(), object);
        Ok(())
    }

    async fn patch(&self, reference: &ObjectRef, patch: &ObjectPatch) -> Result<()> {
        self.check(ClusterOp::Patch, reference).await?;
        let Some(body) = &patch.body else {
            return Ok(());
        };

        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(reference)
            .ok_or_else(|| object_error("patch", reference, "not found"))?;

        match patch.format {
            PatchFormat::StrategicMerge => apply_strategic_merge_patch(object, body),
            PatchFormat::Json => {
                let operations: json_patch::Patch = serde_json::from_value(body.clone())?;
                json_patch::patch(object, &operations.0)
                    .map_err(|e| object_error("patch", reference, e))?;
            }
        }
        bump_resource_version(object);
        Ok(())
    }

    async fn delete(&self, reference: &ObjectRef) -> Result<bool> {
        self.check(ClusterOp::Delete, reference).await?;
        Ok(self.objects.write().await.remove(reference).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::create_patch;
    use serde_json::json;

    fn config_map(data: &str) -> (ObjectRef, Value) {
        let object = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings", "namespace": "default"},
            "data": {"mode": data}
        });
        (ObjectRef::from_object(&object).unwrap(), object)
    }

    #[tokio::test]
    async fn test_memory_cluster_lifecycle() {
        let cluster = MemoryCluster::new();
        let (reference, object) = config_map("a");

        assert!(cluster.get(&reference).await.unwrap().is_none());
        cluster.create(&reference, &object).await.unwrap();

        let live = cluster.get(&reference).await.unwrap().unwrap();
        assert_eq!(live["metadata"]["uid"], "uid-1");
        assert_eq!(live["metadata"]["resourceVersion"], "1");
        assert!(cluster.create(&reference, &object).await.is_err());

        let (_, expected) = config_map("b");
        let patch = create_patch(&live, &expected).unwrap();
        cluster.patch(&reference, &patch).await.unwrap();
        let live = cluster.object(&reference).await.unwrap();
        assert_eq!(live["data"]["mode"], "b");
        assert_eq!(live["metadata"]["resourceVersion"], "2");

        assert!(cluster.delete(&reference).await.unwrap());
        assert!(!cluster.delete(&reference).await.unwrap());

        let counts = cluster.operation_counts().await;
        assert_eq!(counts.creates, 2);
        assert_eq!(counts.patches, 1);
        assert_eq!(counts.deletes, 2);
    }

    #[tokio::test]
    async fn test_memory_cluster_json_patch() {
        let cluster = MemoryCluster::new();
        let object = json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "gadget", "namespace": "default"},
            "spec": {"size": 1}
        });
        let reference = ObjectRef::from_object(&object).unwrap();
        cluster.create(&reference, &object).await.unwrap();

        let mut expected = object.clone();
        expected["spec"]["size"] = json!(5);
        let live = cluster.object(&reference).await.unwrap();
        let patch = create_patch(&live, &expected).unwrap();
        assert_eq!(patch.format, PatchFormat::Json);

        cluster.patch(&reference, &patch).await.unwrap();
        let live = cluster.object(&reference).await.unwrap();
        assert_eq!(live["spec"]["size"], 5);
        assert_eq!(live["metadata"]["uid"], "uid-1");
    }

    #[tokio::test]
    async fn test_memory_cluster_injected_failure() {
        let cluster = MemoryCluster::new();
        let (reference, object) = config_map("a");
        cluster.fail_on(ClusterOp::Create, "settings", "quota exceeded").await;

        let err = cluster.create(&reference, &object).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to create ConfigMap default/settings: quota exceeded"
        );

        cluster.clear_failures().await;
        cluster.create(&reference, &object).await.unwrap();
    }
}
