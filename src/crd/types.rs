//! Supporting types shared by the GameServer and Playtest CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Legacy label that carried the display name before `spec.displayName` existed
pub const LEGACY_NAME_LABEL: &str = "believer.dev/name";

/// Label linking a spawned GameServer to its Playtest
pub const PLAYTEST_LABEL: &str = "believer.dev/playtest";

/// Label recording the Playtest version a GameServer was spawned for
pub const COMMIT_LABEL: &str = "believer.dev/commit";

/// Annotation that keeps the node autoscaler from evicting a running match
pub const DO_NOT_DISRUPT_ANNOTATION: &str = "karpenter.sh/do-not-disrupt";

/// Node label selecting the game workload class
pub const NODE_TYPE_LABEL: &str = "builddev.believer.dev/nodetype";

/// Value of [`NODE_TYPE_LABEL`] on game nodes
pub const NODE_TYPE_GAME: &str = "game";

/// Taint key carried by game nodes
pub const GAME_TAINT_KEY: &str = "builddev.believer.dev/game";

/// Reference to a namespaced object owned by the referrer
///
/// Always resolved in the referrer's namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalRef {
    /// Name of the referenced object
    pub name: String,
}

impl LocalRef {
    /// Create a reference to the named object
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Compact mirror of a pod's observed status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    /// Pod phase (Pending, Running, Succeeded, Failed, Unknown)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Machine-readable reason for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// IP of the node the pod is bound to
    #[serde(rename = "hostIP", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    /// IP of the pod itself
    #[serde(rename = "podIP", default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
}
