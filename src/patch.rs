//! End-of-pass object patching
//!
//! Reconcilers mutate a clone of the object they were handed. When the pass
//! finishes, whatever the outcome, the difference between the two copies is
//! sent back as JSON merge patches (RFC 7386): one for spec and metadata, one
//! for the status subresource.

use std::fmt::Debug;

use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::Error;

/// Compute a JSON merge patch turning `original` into `modified`
///
/// Keys missing from `modified` are emitted as `null`, arrays and scalars are
/// replaced wholesale. Returns `None` when the documents are equal.
pub fn merge_diff(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(before), Value::Object(after)) => {
            let mut patch = Map::new();
            for (key, old) in before {
                match after.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) => {
                        if let Some(diff) = merge_diff(old, new) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                }
            }
            for (key, new) in after {
                if !before.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ if original == modified => None,
        _ => Some(modified.clone()),
    }
}

/// Pending changes to one object, split by subresource
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectPatch {
    /// Resource version of the object the changes were computed against
    pub resource_version: Option<String>,
    /// Merge patch for spec and metadata
    pub main: Option<Value>,
    /// Merge patch for the status subresource, rooted at `{"status": ...}`
    pub status: Option<Value>,
}

impl ObjectPatch {
    /// Diff two copies of the same object
    pub fn between<K>(original: &K, modified: &K) -> Result<Self, Error>
    where
        K: Resource + Serialize,
    {
        let mut before = serde_json::to_value(original)?;
        let mut after = serde_json::to_value(modified)?;

        let status_before = take_status(&mut before);
        let status_after = take_status(&mut after);

        Ok(Self {
            resource_version: original.meta().resource_version.clone(),
            main: merge_diff(&before, &after),
            status: merge_diff(&status_before, &status_after),
        })
    }

    /// Whether there is nothing to send
    pub fn is_empty(&self) -> bool {
        self.main.is_none() && self.status.is_none()
    }

    /// Send the patches through `api`
    ///
    /// The spec patch is guarded by the original resource version. The status
    /// patch follows with the version the first patch produced, so a conflict
    /// on either surfaces as [`Error::Conflict`].
    pub async fn apply<K>(&self, api: &Api<K>, name: &str) -> Result<(), Error>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        let params = PatchParams::default();
        let mut resource_version = self.resource_version.clone();

        if let Some(main) = &self.main {
            let body = with_resource_version(main.clone(), resource_version.as_deref());
            let updated = api.patch(name, &params, &Patch::Merge(&body)).await?;
            resource_version = updated.resource_version();
            debug!(name, "patched object");
        }

        if let Some(status) = &self.status {
            let body = with_resource_version(status.clone(), resource_version.as_deref());
            api.patch_status(name, &params, &Patch::Merge(&body)).await?;
            debug!(name, "patched status");
        }

        Ok(())
    }
}

fn take_status(object: &mut Value) -> Value {
    let status = object
        .as_object_mut()
        .and_then(|o| o.remove("status"))
        .unwrap_or(Value::Null);
    serde_json::json!({ "status": status })
}

fn with_resource_version(mut patch: Value, resource_version: Option<&str>) -> Value {
    let Some(version) = resource_version else {
        return patch;
    };
    if let Value::Object(root) = &mut patch {
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(version.to_string()),
            );
        }
    }
    patch
}
