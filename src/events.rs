//! Kubernetes Events for GameServers and Playtests.
//!
//! Controllers describe what happened as a [`GameEvent`]; the publisher turns
//! it into a `kube::runtime::events::Event` on the object it concerns, where it
//! shows up in `kubectl describe`.
//!
//! Publishing never fails a reconcile. Errors from the API server are logged
//! and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Something worth telling a human about
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GameEvent {
    /// A pod was created for a GameServer on the given game port
    PodCreated {
        /// Drawn game port
        port: i32,
    },
    /// No node had the drawn host ports free; the pod is redrawn
    PortConflict,
    /// The pod exited cleanly and its GameServer is being removed
    Completed,
    /// The node running the pod has no external address
    NoExternalIp {
        /// Node the pod landed on
        node: String,
    },
    /// Queued users are waiting but every group is full
    NoOpenGroups,
    /// A GameServer was created for a playtest group
    GameServerCreated {
        /// Name of the new GameServer
        server: String,
        /// Group it serves
        group: String,
    },
    /// A group's GameServer runs the wrong build or map and is replaced
    ConfigDrift {
        /// Name of the stale GameServer
        server: String,
        /// What it runs
        running: String,
        /// What the playtest asks for
        wanted: String,
    },
}

impl GameEvent {
    /// Value of the REASON column
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PodCreated { .. } => reasons::POD_CREATED,
            Self::PortConflict => reasons::PORT_CONFLICT,
            Self::Completed => reasons::COMPLETED,
            Self::NoExternalIp { .. } => reasons::NO_EXTERNAL_IP,
            Self::NoOpenGroups => reasons::NO_OPEN_GROUPS,
            Self::GameServerCreated { .. } => reasons::GAME_SERVER_CREATED,
            Self::ConfigDrift { .. } => reasons::CONFIG_DRIFT,
        }
    }

    /// Warnings flag conditions an operator has to act on
    pub fn event_type(&self) -> EventType {
        match self {
            Self::PortConflict | Self::NoExternalIp { .. } | Self::NoOpenGroups => {
                EventType::Warning
            }
            _ => EventType::Normal,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Self::PodCreated { .. } | Self::GameServerCreated { .. } => "Create",
            Self::PortConflict | Self::Completed | Self::ConfigDrift { .. } => "Delete",
            Self::NoOpenGroups => "Assign",
            Self::NoExternalIp { .. } => "Reconcile",
        }
    }

    fn note(&self) -> Option<String> {
        match self {
            Self::PodCreated { port } => Some(format!("Created pod on port {port}")),
            Self::PortConflict => {
                Some("No node had the requested host ports free; drawing a new port".to_string())
            }
            Self::Completed => None,
            Self::NoExternalIp { node } => Some(format!("Node {node} has no ExternalIP address")),
            Self::NoOpenGroups => Some("Every group is full; queued users stay queued".to_string()),
            Self::GameServerCreated { server, group } => {
                Some(format!("Created {server} for {group}"))
            }
            Self::ConfigDrift {
                server,
                running,
                wanted,
            } => Some(format!("Replacing {server}: running {running}, want {wanted}")),
        }
    }

    fn into_event(self) -> Event {
        Event {
            type_: self.event_type(),
            reason: self.reason().to_string(),
            note: self.note(),
            action: self.action().to_string(),
            secondary: None,
        }
    }
}

/// Sink for [`GameEvent`]s
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `event` against the object `regarding` points at
    async fn publish(&self, regarding: &ObjectReference, event: GameEvent);
}

/// Publisher backed by the Events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the reporting component; the pod name, when
    /// known, the reporting instance
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, event: GameEvent) {
        let reason = event.reason();
        if let Err(e) = self.recorder.publish(&event.into_event(), regarding).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that remembers every event, for assertions in tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: std::sync::Mutex<Vec<GameEvent>>,
}

#[cfg(test)]
impl RecordingEventPublisher {
    /// Reasons of all recorded events, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.reason().to_string())
            .collect()
    }

    /// Whether a Warning with the given reason was recorded
    pub fn warned(&self, reason: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.event_type() == EventType::Warning && e.reason() == reason)
    }

    /// All recorded events, in order
    pub fn events(&self) -> Vec<GameEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, _regarding: &ObjectReference, event: GameEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Values of the REASON column, as shown by `kubectl get events`
pub mod reasons {
    /// A pod was created for the GameServer
    pub const POD_CREATED: &str = "PodCreated";
    /// The pod could not be scheduled for lack of free host ports
    pub const PORT_CONFLICT: &str = "PortConflict";
    /// The pod exited successfully and the GameServer is being removed
    pub const COMPLETED: &str = "Completed";
    /// The node running the pod has no external address
    pub const NO_EXTERNAL_IP: &str = "NoExternalIP";
    /// A queued user could not be placed because every group is full
    pub const NO_OPEN_GROUPS: &str = "NoOpenGroups";
    /// A GameServer was created for a group
    pub const GAME_SERVER_CREATED: &str = "GameServerCreated";
    /// A group's GameServer no longer matches the playtest and is replaced
    pub const CONFIG_DRIFT: &str = "ConfigDrift";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_are_the_conditions_needing_attention() {
        assert_eq!(GameEvent::PortConflict.event_type(), EventType::Warning);
        assert_eq!(GameEvent::NoOpenGroups.event_type(), EventType::Warning);
        assert_eq!(
            GameEvent::NoExternalIp {
                node: "n1".to_string()
            }
            .event_type(),
            EventType::Warning
        );
        assert_eq!(GameEvent::Completed.event_type(), EventType::Normal);
        assert_eq!(
            GameEvent::PodCreated { port: 7712 }.event_type(),
            EventType::Normal
        );
    }

    #[test]
    fn kube_event_carries_reason_action_and_note() {
        let event = GameEvent::ConfigDrift {
            server: "weekly-group-1".to_string(),
            running: "v1 on Arena".to_string(),
            wanted: "v2 on Arena".to_string(),
        }
        .into_event();

        assert_eq!(event.reason, "ConfigDrift");
        assert_eq!(event.action, "Delete");
        assert_eq!(
            event.note.as_deref(),
            Some("Replacing weekly-group-1: running v1 on Arena, want v2 on Arena")
        );
        assert_eq!(GameEvent::Completed.into_event().note, None);
    }

    #[tokio::test]
    async fn recording_publisher_keeps_order_and_type() {
        let publisher = RecordingEventPublisher::default();
        let obj_ref = ObjectReference::default();
        publisher
            .publish(&obj_ref, GameEvent::PodCreated { port: 7712 })
            .await;
        publisher.publish(&obj_ref, GameEvent::PortConflict).await;

        assert_eq!(publisher.reasons(), vec!["PodCreated", "PortConflict"]);
        assert!(publisher.warned(reasons::PORT_CONFLICT));
        assert!(!publisher.warned(reasons::POD_CREATED));
    }
}
