//! GameServer Custom Resource Definition
//!
//! A GameServer declares one ephemeral game server process. The controller
//! backs it with exactly one pod and mirrors the pod's network facts back into
//! status so clients know where to connect.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{LocalRef, PodSummary};

/// Specification for a GameServer
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "game.believer.dev",
    version = "v1alpha1",
    kind = "GameServer",
    plural = "gameservers",
    shortname = "gs",
    status = "GameServerStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Map","type":"string","jsonPath":".spec.map"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".status.ip"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".status.port"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Human-facing name; also the source of the server's storage key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Build identifier, used as the image tag
    pub version: String,

    /// Map to load on startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,

    /// Attach a readiness probe on the status port
    #[serde(default)]
    pub include_readiness_probe: bool,

    /// Extra arguments appended to the server command line
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd_args: Vec<String>,
}

impl GameServerSpec {
    /// Spec for the given build with every optional field unset
    pub fn for_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    /// Map to pass on the command line, if any
    pub fn launch_map(&self) -> Option<&str> {
        self.map.as_deref().filter(|m| !m.is_empty())
    }

    /// Display name when one has been set
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref().filter(|n| !n.is_empty())
    }
}

/// Observed state of a GameServer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    /// External IP of the node running the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Cluster-internal IP of the node running the server
    #[serde(rename = "internalIP", default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,

    /// Game (UDP) port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Companion NetImgui (TCP) debug port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netimgui_port: Option<i32>,

    /// Status port probed for readiness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_port: Option<i32>,

    /// The pod backing this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ref: Option<LocalRef>,

    /// Mirror of the backing pod's status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_status: Option<PodSummary>,

    /// Whether the backing pod reports Ready
    #[serde(default)]
    pub ready: bool,
}

impl GameServer {
    /// Status, creating an empty one if unset
    pub fn status_mut(&mut self) -> &mut GameServerStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// Name of the backing pod, if one is recorded
    pub fn pod_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.pod_ref.as_ref())
            .map(|r| r.name.as_str())
    }

    /// Whether the backing server reports ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}
