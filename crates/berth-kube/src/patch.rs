//! Patch calculation between live cluster objects and rendered objects
//!
//! Built-in typed objects get a three-way strategic merge patch, which only
//! touches what the chart declares and leaves fields written by other
//! controllers alone. Objects the API server cannot strategic-merge (custom
//! resources and CustomResourceDefinitions) get an RFC 6902 JSON patch instead,
//! stripped of every operation that would delete foreign fields.

use json_patch::PatchOperation;
use serde_json::{Map, Value};

use crate::error::{KubeError, Result};
use crate::manifest::{ObjectRef, is_custom_group};

/// Wire format of an [`ObjectPatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFormat {
    /// `application/strategic-merge-patch+json`
    StrategicMerge,
    /// `application/json-patch+json`
    Json,
}

impl PatchFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::StrategicMerge => "application/strategic-merge-patch+json",
            Self::Json => "application/json-patch+json",
        }
    }
}

/// A computed patch; `body == None` means the live object already matches
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPatch {
    pub format: PatchFormat,
    pub body: Option<Value>,
}

impl ObjectPatch {
    pub fn is_empty(&self) -> bool {
        self.body.is_none()
    }
}

/// How the API server treats an object when patching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    /// Built-in type with a strategic merge schema
    Structured,
    /// Custom resource with no compiled-in schema
    Unstructured,
    /// `apiextensions.k8s.io` CustomResourceDefinition (v1 or v1beta1)
    ExtensionDefinition,
}

impl ObjectClass {
    pub fn of(reference: &ObjectRef) -> Self {
        let group = reference.group();
        if group == "apiextensions.k8s.io" && reference.kind == "CustomResourceDefinition" {
            Self::ExtensionDefinition
        } else if is_custom_group(group) {
            Self::Unstructured
        } else {
            Self::Structured
        }
    }
}

/// Compute the patch that converges `live` towards `expected`
pub fn create_patch(live: &Value, expected: &Value) -> Result<ObjectPatch> {
    let reference = ObjectRef::from_object(expected)?;

    match ObjectClass::of(&reference) {
        ObjectClass::Unstructured | ObjectClass::ExtensionDefinition => {
            let operations = filter_merge_operations(json_patch::diff(live, expected).0);
            if operations.is_empty() {
                return Ok(ObjectPatch {
                    format: PatchFormat::Json,
                    body: None,
                });
            }
            let body = serde_json::to_value(json_patch::Patch(operations)).map_err(|e| {
                KubeError::Patch {
                    object: reference.to_string(),
                    message: e.to_string(),
                }
            })?;
            Ok(ObjectPatch {
                format: PatchFormat::Json,
                body: Some(body),
            })
        }
        ObjectClass::Structured => {
            let patch = create_three_way_merge_patch(expected, expected, live);
            let body = match patch.as_object() {
                Some(map) if map.is_empty() => None,
                _ => Some(patch),
            };
            Ok(ObjectPatch {
                format: PatchFormat::StrategicMerge,
                body,
            })
        }
    }
}

/// Keep only operations that add or change data
///
/// Drops every `remove` and every `add` of a null value, so fields that
/// exist only on the live object (defaults, status, other writers) survive.
pub fn filter_merge_operations(operations: Vec<PatchOperation>) -> Vec<PatchOperation> {
    operations
        .into_iter()
        .filter(|op| match op {
            PatchOperation::Remove(_) => false,
            PatchOperation::Add(add) => !add.value.is_null(),
            _ => true,
        })
        .collect()
}

/// Candidate merge keys for lists of maps, by field name
fn merge_key_candidates(field: &str) -> &'static [&'static str] {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "env" | "volumes"
        | "imagePullSecrets" | "resourceClaims" => &["name"],
        "volumeMounts" => &["mountPath"],
        "volumeDevices" => &["devicePath"],
        "ports" => &["containerPort", "port"],
        "hostAliases" => &["ip"],
        "conditions" => &["type"],
        "ownerReferences" => &["uid"],
        "topologySpreadConstraints" => &["topologyKey"],
        _ => &[],
    }
}

const SET_ELEMENT_ORDER_PREFIX: &str = "$setElementOrder/";

/// Pick the merge key every element of both lists carries, if any
fn merge_key_for(field: &str, a: &[Value], b: &[Value]) -> Option<&'static str> {
    merge_key_candidates(field).iter().copied().find(|key| {
        a.iter()
            .chain(b.iter())
            .all(|item| item.get(*key).is_some_and(|v| !v.is_null()))
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct DiffOptions {
    ignore_deletions: bool,
    ignore_changes_and_additions: bool,
}

/// Three-way strategic merge patch
///
/// Changes and additions come from `current -> modified`; deletions come
/// from `original -> modified`, so fields the caller never owned are kept.
/// Returns `{}` when nothing needs to change.
pub fn create_three_way_merge_patch(original: &Value, modified: &Value, current: &Value) -> Value {
    let empty = Map::new();
    let as_map = |v: &Value| v.as_object().cloned().unwrap_or_else(|| empty.clone());

    let delta = diff_maps(
        &as_map(current),
        &as_map(modified),
        DiffOptions {
            ignore_deletions: true,
            ..Default::default()
        },
    );
    let deletions = diff_maps(
        &as_map(original),
        &as_map(modified),
        DiffOptions {
            ignore_changes_and_additions: true,
            ..Default::default()
        },
    );

    let mut patch = Value::Object(deletions);
    merge_patch_into(&mut patch, Value::Object(delta));
    patch
}

fn diff_maps(from: &Map<String, Value>, to: &Map<String, Value>, opts: DiffOptions) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, to_value) in to {
        let Some(from_value) = from.get(key) else {
            if !opts.ignore_changes_and_additions {
                patch.insert(key.clone(), to_value.clone());
            }
            continue;
        };

        match (from_value, to_value) {
            (Value::Object(from_map), Value::Object(to_map)) => {
                let nested = diff_maps(from_map, to_map, opts);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            (Value::Array(from_list), Value::Array(to_list)) => {
                match merge_key_for(key, from_list, to_list) {
                    Some(merge_key) => {
                        let (items, order) = diff_keyed_lists(from_list, to_list, merge_key, opts);
                        if !items.is_empty() {
                            patch.insert(key.clone(), Value::Array(items));
                            patch.insert(format!("{}{}", SET_ELEMENT_ORDER_PREFIX, key), Value::Array(order));
                        }
                    }
                    None => {
                        if from_list != to_list && !opts.ignore_changes_and_additions {
                            patch.insert(key.clone(), to_value.clone());
                        }
                    }
                }
            }
            _ => {
                if from_value != to_value && !opts.ignore_changes_and_additions {
                    patch.insert(key.clone(), to_value.clone());
                }
            }
        }
    }

    if !opts.ignore_deletions {
        for key in from.keys() {
            if !to.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }

    patch
}

/// Diff two lists of maps keyed by `merge_key`
///
/// Returns the patch items and the `$setElementOrder` list for `to`.
fn diff_keyed_lists(
    from: &[Value],
    to: &[Value],
    merge_key: &str,
    opts: DiffOptions,
) -> (Vec<Value>, Vec<Value>) {
    let key_of = |item: &Value| item.get(merge_key).cloned().unwrap_or(Value::Null);
    let mut items = Vec::new();

    for to_item in to {
        let key = key_of(to_item);
        match from.iter().find(|f| key_of(f) == key) {
            None => {
                if !opts.ignore_changes_and_additions {
                    items.push(to_item.clone());
                }
            }
            Some(from_item) => {
                let (Some(from_map), Some(to_map)) = (from_item.as_object(), to_item.as_object()) else {
                    continue;
                };
                let mut nested = diff_maps(from_map, to_map, opts);
                if !nested.is_empty() {
                    nested.insert(merge_key.to_string(), key);
                    items.push(Value::Object(nested));
                }
            }
        }
    }

    if !opts.ignore_deletions {
        for from_item in from {
            let key = key_of(from_item);
            if !to.iter().any(|t| key_of(t) == key) {
                let mut directive = Map::new();
                directive.insert(merge_key.to_string(), key);
                directive.insert("$patch".to_string(), Value::String("delete".to_string()));
                items.push(Value::Object(directive));
            }
        }
    }

    let order = to
        .iter()
        .map(|item| {
            let mut entry = Map::new();
            entry.insert(merge_key.to_string(), key_of(item));
            Value::Object(entry)
        })
        .collect();

    (items, order)
}

/// Combine two patches computed against the same target
fn merge_patch_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let ordering = key.starts_with(SET_ELEMENT_ORDER_PREFIX);
                match base_map.get_mut(&key) {
                    Some(existing) if ordering => *existing = overlay_value,
                    Some(existing) => match (existing, overlay_value) {
                        (Value::Array(list), Value::Array(more)) => list.extend(more),
                        (existing, overlay_value) => merge_patch_into(existing, overlay_value),
                    },
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply a strategic merge patch to an object
///
/// Understands the directives [`create_three_way_merge_patch`] emits: null
/// deletes a field, keyed list items merge by their merge key, `$patch:
/// delete` removes an item and `$setElementOrder` fixes the final order.
pub fn apply_strategic_merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Some(target_map) = target.as_object_mut() else {
        return;
    };

    for (key, value) in patch_map {
        if key.starts_with(SET_ELEMENT_ORDER_PREFIX) {
            continue;
        }
        match value {
            Value::Null => {
                target_map.remove(key);
            }
            Value::Object(_) => {
                let entry = target_map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                apply_strategic_merge_patch(entry, value);
            }
            Value::Array(items) => {
                let existing = target_map
                    .get(key)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let merged = match merge_key_for(key, &existing, items) {
                    Some(merge_key) => {
                        let order = patch_map.get(&format!("{}{}", SET_ELEMENT_ORDER_PREFIX, key));
                        apply_keyed_list(existing, items, merge_key, order)
                    }
                    None => items.clone(),
                };
                target_map.insert(key.clone(), Value::Array(merged));
            }
            _ => {
                target_map.insert(key.clone(), value.clone());
            }
        }
    }
}

fn apply_keyed_list(
    mut existing: Vec<Value>,
    items: &[Value],
    merge_key: &str,
    order: Option<&Value>,
) -> Vec<Value> {
    for item in items {
        let key = item.get(merge_key);
        if item.get("$patch").and_then(Value::as_str) == Some("delete") {
            existing.retain(|e| e.get(merge_key) != key);
            continue;
        }
        match existing.iter_mut().find(|e| e.get(merge_key) == key) {
            Some(current) => {
                let mut item = item.clone();
                if let Some(map) = item.as_object_mut() {
                    map.remove("$patch");
                }
                apply_strategic_merge_patch(current, &item);
            }
            None => existing.push(item.clone()),
        }
    }

    if let Some(Value::Array(order)) = order {
        let keys: Vec<&Value> = order.iter().filter_map(|o| o.get(merge_key)).collect();
        existing.sort_by_key(|e| {
            e.get(merge_key)
                .and_then(|k| keys.iter().position(|o| *o == k))
                .unwrap_or(usize::MAX)
        });
    }

    existing
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn live_deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "uid": "1234",
                "resourceVersion": "42",
                "annotations": {"deployment.kubernetes.io/revision": "3"}
            },
            "spec": {
                "replicas": 1,
                "template": {
                    "spec": {
                        "containers": [
                            {"name": "app", "image": "web:v1", "imagePullPolicy": "IfNotPresent"}
                        ]
                    }
                }
            },
            "status": {"readyReplicas": 1}
        })
    }

    fn expected_deployment(replicas: u32, image: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": replicas,
                "template": {"spec": {"containers": [{"name": "app", "image": image}]}}
            }
        })
    }

    #[test]
    fn test_structured_object_gets_strategic_merge_patch() {
        let patch = create_patch(&live_deployment(), &expected_deployment(2, "web:v2")).unwrap();

        assert_eq!(patch.format, PatchFormat::StrategicMerge);
        assert_eq!(
            patch.body.unwrap(),
            json!({
                "spec": {
                    "replicas": 2,
                    "template": {
                        "spec": {
                            "$setElementOrder/containers": [{"name": "app"}],
                            "containers": [{"name": "app", "image": "web:v2"}]
                        }
                    }
                }
            })
        );
    }

    #[test]
    fn test_structured_object_without_changes_needs_no_patch() {
        let patch = create_patch(&live_deployment(), &expected_deployment(1, "web:v1")).unwrap();
        assert_eq!(patch.format, PatchFormat::StrategicMerge);
        assert!(patch.is_empty());
    }

    #[test]
    fn test_unstructured_object_gets_filtered_json_patch() {
        let live = json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "gadget", "namespace": "default", "uid": "abc"},
            "spec": {"size": 1, "color": "red"},
            "status": {"phase": "Ready"}
        });
        let expected = json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "gadget", "namespace": "default"},
            "spec": {"size": 2}
        });

        let patch = create_patch(&live, &expected).unwrap();
        assert_eq!(patch.format, PatchFormat::Json);
        assert_eq!(
            patch.body.unwrap(),
            json!([{"op": "replace", "path": "/spec/size", "value": 2}])
        );
    }

    #[test]
    fn test_unstructured_object_with_only_removals_needs_no_patch() {
        let live = json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "gadget", "generation": 4},
            "spec": {"size": 1}
        });
        let expected = json!({
            "apiVersion": "example.com/v1",
            "kind": "Widget",
            "metadata": {"name": "gadget"},
            "spec": {"size": 1}
        });

        let patch = create_patch(&live, &expected).unwrap();
        assert_eq!(patch.format, PatchFormat::Json);
        assert!(patch.is_empty());
    }

    #[test]
    fn test_extension_definitions_use_json_patch() {
        for version in ["apiextensions.k8s.io/v1", "apiextensions.k8s.io/v1beta1"] {
            let live = json!({
                "apiVersion": version,
                "kind": "CustomResourceDefinition",
                "metadata": {"name": "widgets.example.com"},
                "spec": {"group": "example.com", "scope": "Namespaced"}
            });
            let expected = json!({
                "apiVersion": version,
                "kind": "CustomResourceDefinition",
                "metadata": {"name": "widgets.example.com"},
                "spec": {"group": "example.com", "scope": "Cluster"}
            });

            let patch = create_patch(&live, &expected).unwrap();
            assert_eq!(patch.format, PatchFormat::Json, "{}", version);
            assert!(!patch.is_empty());
        }
    }

    #[test]
    fn test_filter_merge_operations() {
        let operations: Vec<PatchOperation> = serde_json::from_value(json!([
            {"op": "remove", "path": "/metadata/uid"},
            {"op": "add", "path": "/spec/nothing", "value": null},
            {"op": "add", "path": "/spec/size", "value": 3},
            {"op": "replace", "path": "/spec/color", "value": "blue"}
        ]))
        .unwrap();

        let kept = filter_merge_operations(operations);
        assert_eq!(
            serde_json::to_value(&kept).unwrap(),
            json!([
                {"op": "add", "path": "/spec/size", "value": 3},
                {"op": "replace", "path": "/spec/color", "value": "blue"}
            ])
        );

        let only_removals: Vec<PatchOperation> =
            serde_json::from_value(json!([{"op": "remove", "path": "/a"}])).unwrap();
        assert!(filter_merge_operations(only_removals).is_empty());
    }

    #[test]
    fn test_three_way_patch_deletes_removed_keyed_items() {
        let original = json!({"spec": {"containers": [{"name": "app", "image": "a"}, {"name": "sidecar", "image": "s"}]}});
        let modified = json!({"spec": {"containers": [{"name": "app", "image": "a"}]}});
        let current = json!({"spec": {"containers": [
            {"name": "app", "image": "a", "imagePullPolicy": "Always"},
            {"name": "sidecar", "image": "s"}
        ]}});

        let patch = create_three_way_merge_patch(&original, &modified, &current);
        assert_eq!(
            patch,
            json!({"spec": {
                "$setElementOrder/containers": [{"name": "app"}],
                "containers": [{"$patch": "delete", "name": "sidecar"}]
            }})
        );
    }

    #[test]
    fn test_three_way_patch_replaces_atomic_lists() {
        let modified = json!({"spec": {"args": ["--port", "80"]}});
        let current = json!({"spec": {"args": ["--port", "8080"], "extra": true}});

        let patch = create_three_way_merge_patch(&modified, &modified, &current);
        assert_eq!(patch, json!({"spec": {"args": ["--port", "80"]}}));
    }

    #[test]
    fn test_three_way_patch_nulls_fields_dropped_from_original() {
        let original = json!({"metadata": {"labels": {"a": "1", "b": "2"}}});
        let modified = json!({"metadata": {"labels": {"a": "1"}}});
        let current = json!({"metadata": {"labels": {"a": "1", "b": "2", "c": "3"}}});

        let patch = create_three_way_merge_patch(&original, &modified, &current);
        assert_eq!(patch, json!({"metadata": {"labels": {"b": null}}}));
    }

    #[test]
    fn test_ports_merge_on_container_port() {
        let modified = json!({"ports": [{"containerPort": 80, "protocol": "TCP"}]});
        let current = json!({"ports": [{"containerPort": 80, "protocol": "UDP"}]});

        let patch = create_three_way_merge_patch(&modified, &modified, &current);
        assert_eq!(
            patch,
            json!({
                "$setElementOrder/ports": [{"containerPort": 80}],
                "ports": [{"containerPort": 80, "protocol": "TCP"}]
            })
        );
    }
    #[test]
    fn test_applied_patch_converges() {
        let mut live = live_deployment();
        let expected = expected_deployment(3, "web:v3");

        let patch = create_patch(&live, &expected).unwrap();
        apply_strategic_merge_patch(&mut live, patch.body.as_ref().unwrap());

        assert_eq!(live["spec"]["replicas"], 3);
        assert_eq!(live["spec"]["template"]["spec"]["containers"][0]["image"], "web:v3");
        assert_eq!(
            live["spec"]["template"]["spec"]["containers"][0]["imagePullPolicy"],
            "IfNotPresent"
        );
        assert_eq!(live["status"]["readyReplicas"], 1);
        assert!(create_patch(&live, &expected).unwrap().is_empty());
    }

    #[test]
    fn test_apply_keyed_delete_and_order() {
        let mut target = json!({"env": [{"name": "A", "value": "1"}, {"name": "B", "value": "2"}]});
        let patch = json!({
            "$setElementOrder/env": [{"name": "C"}, {"name": "A"}],
            "env": [{"name": "B", "$patch": "delete"}, {"name": "C", "value": "3"}]
        });

        apply_strategic_merge_patch(&mut target, &patch);
        assert_eq!(
            target,
            json!({"env": [{"name": "C", "value": "3"}, {"name": "A", "value": "1"}]})
        );
    }
}
