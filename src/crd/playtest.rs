//! Playtest Custom Resource Definition
//!
//! A Playtest declares a time-boxed test session: a fixed number of named
//! groups, a queue of users waiting to be placed into those groups, and a
//! start time around which one GameServer per group is kept alive.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::LocalRef;

/// Specification for a Playtest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "game.believer.dev",
    version = "v1alpha1",
    kind = "Playtest",
    plural = "playtests",
    shortname = "pt",
    status = "PlaytestStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Map","type":"string","jsonPath":".spec.map"}"#,
    printcolumn = r#"{"name":"Start","type":"date","jsonPath":".spec.startTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlaytestSpec {
    /// Human-facing name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Build identifier for the group servers
    #[serde(default)]
    pub version: String,

    /// Map every group server loads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,

    /// Number of groups the playtest always has
    #[serde(default)]
    #[schemars(range(max = 256))]
    pub min_groups: u32,

    /// Group capacity used for automatic assignment
    #[serde(default)]
    pub players_per_group: u32,

    /// Scheduled start; servers come up ten minutes earlier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Where participants leave feedback
    #[serde(rename = "feedbackURL", default, skip_serializing_if = "Option::is_none")]
    pub feedback_url: Option<String>,

    /// Users waiting to be placed into a group, front first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users_to_auto_assign: Vec<String>,

    /// Extra arguments for every group server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub game_server_cmd_args: Vec<String>,

    /// Declared groups and their members
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<PlaytestGroup>,

    /// Attach readiness probes to group servers
    #[serde(default)]
    pub include_readiness_probe: bool,

    /// Never run group servers for this playtest
    #[serde(default)]
    pub disable_game_servers: bool,
}

/// One declared group of players
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PlaytestGroup {
    /// Group name, unique within the playtest
    #[serde(default)]
    pub name: String,

    /// Members of the group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

impl PlaytestGroup {
    /// An empty group with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: Vec::new(),
        }
    }
}

impl PlaytestSpec {
    /// Indices of groups with fewer than `players_per_group` members
    pub fn open_groups(&self) -> Vec<usize> {
        let capacity = self.players_per_group as usize;
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, group)| group.users.len() < capacity)
            .map(|(index, _)| index)
            .collect()
    }

    /// Append a user to the group at `index`
    ///
    /// Returns false if no such group exists.
    pub fn add_user_to_group(&mut self, index: usize, user: String) -> bool {
        match self.groups.get_mut(index) {
            Some(group) => {
                group.users.push(user);
                true
            }
            None => false,
        }
    }

    /// Move the front of the assignment queue into the group at `index`
    ///
    /// The user leaves the queue only once the group has taken them; with no
    /// such group, or nobody queued, nothing changes and `None` is returned.
    pub fn assign_queued_user(&mut self, index: usize) -> Option<String> {
        let user = self.users_to_auto_assign.first()?.clone();
        if !self.add_user_to_group(index, user.clone()) {
            return None;
        }
        self.users_to_auto_assign.remove(0);
        Some(user)
    }
}

/// Observed state of one group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlaytestGroupStatus {
    /// Name of the declared group this entry tracks
    #[serde(default)]
    pub name: String,

    /// The GameServer spawned for this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ref: Option<LocalRef>,

    /// Mirror of the declared member list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,

    /// Whether the group's server reports ready
    #[serde(default)]
    pub ready: bool,
}

/// Observed state of a Playtest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PlaytestStatus {
    /// Per-group observed state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<PlaytestGroupStatus>,
}

impl PlaytestStatus {
    /// Index of the status entry tracking the named group
    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    /// Index of the status entry for the named group, appending one if absent
    pub fn ensure_group(&mut self, name: &str) -> usize {
        match self.group_index(name) {
            Some(index) => index,
            None => {
                self.groups.push(PlaytestGroupStatus {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.groups.len() - 1
            }
        }
    }
}

impl Playtest {
    /// Status, creating an empty one if unset
    pub fn status_mut(&mut self) -> &mut PlaytestStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
