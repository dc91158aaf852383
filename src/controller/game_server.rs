//! GameServer controller implementation
//!
//! Each GameServer is backed by exactly one pod named after it. The pod binds
//! a randomly drawn host port; when the scheduler reports that no node has the
//! port free, the pod is deleted and a new port is drawn on the next pass.
//! Once the pod is placed, its ports and the node's addresses are mirrored
//! into status. A pod that exits successfully takes its GameServer with it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Node, Pod, PodSpec, Probe, TCPSocketAction, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::{deleted, object_key, Progress, CONTROLLER_NAME};
use crate::config::OperatorConfig;
use crate::crd::{
    GameServer, LocalRef, PodSummary, DO_NOT_DISRUPT_ANNOTATION, GAME_TAINT_KEY,
    LEGACY_NAME_LABEL, NODE_TYPE_GAME, NODE_TYPE_LABEL,
};
use crate::events::{EventPublisher, GameEvent, KubeEventPublisher};
use crate::patch::ObjectPatch;
use crate::random::{PortAssignment, RandomSource, ThreadRandom};
use crate::retry::{BackoffConfig, ErrorBackoff};
use crate::sanitize::storage_key_for;
use crate::Error;

/// Scheduler message for a pod whose host ports are taken on every node
pub const PORT_CONFLICT_MARKER: &str =
    "node(s) didn't have free ports for the requested pod ports";

const CONTAINER_NAME: &str = "game-server";

/// Trait abstracting the Kubernetes operations the GameServer controller needs
///
/// Lookups return `Ok(None)` and deletes return `Ok(false)` when the object is
/// already gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GameServerStore: Send + Sync {
    /// Fetch a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod, failing with [`Error::AlreadyExists`] on a name clash
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Fetch a node
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Delete a GameServer
    async fn delete_game_server(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Apply end-of-pass changes to a GameServer
    async fn patch_game_server(
        &self,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct GameServerStoreImpl {
    client: Client,
}

impl GameServerStoreImpl {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GameServerStore for GameServerStoreImpl {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        deleted(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn delete_game_server(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<GameServer> = Api::namespaced(self.client.clone(), namespace);
        deleted(api.delete(name, &DeleteParams::default()).await)
    }

    async fn patch_game_server(
        &self,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<(), Error> {
        let api: Api<GameServer> = Api::namespaced(self.client.clone(), namespace);
        patch.apply(&api, name).await
    }
}

/// Controller context for GameServer reconciliation
pub struct GameServerContext {
    /// Kubernetes operations (trait object for testability)
    pub store: Arc<dyn GameServerStore>,
    /// Event publisher for `kubectl describe` visibility
    pub events: Arc<dyn EventPublisher>,
    /// Source for port draws
    pub random: Arc<dyn RandomSource>,
    /// Image, port ranges and resync interval
    pub config: OperatorConfig,
    /// Per-object failure counters for the error policy
    pub backoff: ErrorBackoff,
}

impl GameServerContext {
    /// Create a builder for constructing a context
    pub fn builder(client: Client, config: OperatorConfig) -> GameServerContextBuilder {
        GameServerContextBuilder::new(client, config)
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn GameServerStore>,
        events: Arc<dyn EventPublisher>,
        random: Arc<dyn RandomSource>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            events,
            random,
            config,
            backoff: ErrorBackoff::new(BackoffConfig {
                jitter: false,
                ..Default::default()
            }),
        }
    }
}

/// Builder for constructing [`GameServerContext`] instances
pub struct GameServerContextBuilder {
    client: Client,
    config: OperatorConfig,
    store: Option<Arc<dyn GameServerStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    random: Option<Arc<dyn RandomSource>>,
    backoff: BackoffConfig,
}

impl GameServerContextBuilder {
    fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            store: None,
            events: None,
            random: None,
            backoff: BackoffConfig::default(),
        }
    }

    /// Override the store (primarily for testing)
    pub fn store(mut self, store: Arc<dyn GameServerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the random source
    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    /// Set the error backoff curve
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build the context
    pub fn build(self) -> GameServerContext {
        GameServerContext {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(GameServerStoreImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            random: self.random.unwrap_or_else(|| Arc::new(ThreadRandom)),
            config: self.config,
            backoff: ErrorBackoff::new(self.backoff),
        }
    }
}

/// Reconcile a GameServer resource
///
/// Works on a copy of the object. Whatever the pass returns, the difference
/// between the copy and the original is patched back before returning, so
/// progress made before a failure is kept.
#[instrument(
    skip(game_server, ctx),
    fields(game_server = %game_server.name_any(), namespace = %game_server.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    game_server: Arc<GameServer>,
    ctx: Arc<GameServerContext>,
) -> Result<Action, Error> {
    let key = object_key(game_server.as_ref());
    if game_server.meta().deletion_timestamp.is_some() {
        debug!("game server is being deleted, skipping");
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }
    debug!("reconciling game server");

    let mut working = game_server.as_ref().clone();
    let outcome = run_pass(&mut working, &ctx).await;
    if !persist(&game_server, &working, &ctx).await {
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    let progress = outcome?;
    ctx.backoff.reset(&key);
    Ok(progress.into_action(ctx.config.resync_interval))
}

/// Error policy for the GameServer controller
///
/// Requeues with a per-object exponential backoff.
pub fn error_policy(game_server: Arc<GameServer>, error: &Error, ctx: Arc<GameServerContext>) -> Action {
    let delay = ctx.backoff.next_delay(&object_key(game_server.as_ref()));
    error!(
        ?error,
        game_server = %game_server.name_any(),
        retry_in_secs = delay.as_secs_f64(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn run_pass(game_server: &mut GameServer, ctx: &GameServerContext) -> Result<Progress, Error> {
    default_display_name(game_server);

    match game_server.pod_name().map(str::to_string) {
        Some(pod_name) => reconcile_existing_pod(game_server, &pod_name, ctx).await,
        None => create_pod(game_server, ctx).await,
    }
}

/// Patch the pass's changes back; false once the object is gone
async fn persist(original: &GameServer, modified: &GameServer, ctx: &GameServerContext) -> bool {
    let patch = match ObjectPatch::between(original, modified) {
        Ok(patch) => patch,
        Err(e) => {
            error!(error = %e, "failed to compute game server patch");
            return true;
        }
    };
    if patch.is_empty() {
        return true;
    }

    let namespace = original.namespace().unwrap_or_default();
    match ctx
        .store
        .patch_game_server(&namespace, &original.name_any(), &patch)
        .await
    {
        Ok(()) => true,
        Err(e) if e.is_not_found() => {
            debug!("game server gone before patch");
            false
        }
        Err(e) if e.is_conflict() => {
            warn!(error = %e, "game server changed during reconcile, leaving for resync");
            true
        }
        Err(e) => {
            error!(error = %e, "error patching game server");
            true
        }
    }
}

/// Fill in the display name from the legacy label, then the object name
fn default_display_name(game_server: &mut GameServer) {
    if game_server.spec.display_name().is_some() {
        return;
    }
    let legacy = game_server
        .labels()
        .get(LEGACY_NAME_LABEL)
        .filter(|v| !v.is_empty())
        .cloned();
    game_server.spec.display_name = Some(legacy.unwrap_or_else(|| game_server.name_any()));
}

fn clear_pod_ref(game_server: &mut GameServer) {
    let status = game_server.status_mut();
    status.pod_ref = None;
    status.ready = false;
}

async fn create_pod(game_server: &mut GameServer, ctx: &GameServerContext) -> Result<Progress, Error> {
    let namespace = game_server.namespace().unwrap_or_default();
    let ports = ctx.config.ports.draw(ctx.random.as_ref());
    let pod = build_pod(game_server, &ctx.config, ports)?;

    match ctx.store.create_pod(&namespace, &pod).await {
        Ok(created) => {
            info!(pod = %created.name_any(), port = ports.game, "created pod");
            game_server.status_mut().pod_ref = Some(LocalRef::new(created.name_any()));
            ctx.events
                .publish(
                    &game_server.object_ref(&()),
                    GameEvent::PodCreated { port: ports.game },
                )
                .await;
            Ok(Progress::Done)
        }
        Err(e) if e.is_already_exists() => adopt_existing_pod(game_server, &namespace, ctx).await,
        Err(e) => Err(e),
    }
}

/// Handle a name clash on create: clear out a finished pod, adopt a live one
async fn adopt_existing_pod(
    game_server: &mut GameServer,
    namespace: &str,
    ctx: &GameServerContext,
) -> Result<Progress, Error> {
    let name = game_server.name_any();
    let Some(existing) = ctx.store.get_pod(namespace, &name).await? else {
        return Ok(Progress::Requeue);
    };

    if pod_phase(&existing) == Some("Succeeded") {
        info!(pod = %name, "removing completed pod left under this name");
        ctx.store.delete_pod(namespace, &name).await?;
        return Ok(Progress::Requeue);
    }

    info!(pod = %name, "pod already exists and has not completed, adopting it");
    game_server.status_mut().pod_ref = Some(LocalRef::new(existing.name_any()));
    Ok(Progress::Requeue)
}

async fn reconcile_existing_pod(
    game_server: &mut GameServer,
    pod_name: &str,
    ctx: &GameServerContext,
) -> Result<Progress, Error> {
    let namespace = game_server.namespace().unwrap_or_default();

    let Some(pod) = ctx.store.get_pod(&namespace, pod_name).await? else {
        info!(pod = %pod_name, "missing pod for game server, requeuing for a fresh one");
        clear_pod_ref(game_server);
        return Ok(Progress::Requeue);
    };

    match pod_phase(&pod) {
        Some("Pending") if has_port_conflict(&pod) => {
            info!(pod = %pod_name, "port conflict detected, rescheduling pod");
            ctx.store.delete_pod(&namespace, pod_name).await?;
            clear_pod_ref(game_server);
            ctx.events
                .publish(&game_server.object_ref(&()), GameEvent::PortConflict)
                .await;
            return Ok(Progress::Requeue);
        }
        Some("Succeeded") => {
            info!(pod = %pod_name, "pod completed, deleting game server");
            ctx.events
                .publish(&game_server.object_ref(&()), GameEvent::Completed)
                .await;
            if !ctx
                .store
                .delete_game_server(&namespace, &game_server.name_any())
                .await?
            {
                debug!("game server already deleted");
            }
            return Ok(Progress::Done);
        }
        _ => {}
    }

    mirror_pod(game_server, &pod, ctx).await
}

/// Copy the pod's ports, state and node addresses into status
async fn mirror_pod(
    game_server: &mut GameServer,
    pod: &Pod,
    ctx: &GameServerContext,
) -> Result<Progress, Error> {
    let Some(container) = pod.spec.as_ref().and_then(|s| s.containers.first()) else {
        return Ok(Progress::Requeue);
    };
    let ports = container.ports.as_deref().unwrap_or_default();
    let (Some(game), Some(netimgui)) = (ports.first(), ports.get(1)) else {
        return Ok(Progress::Requeue);
    };

    let status = game_server.status_mut();
    status.port = Some(bound_port(game));
    status.netimgui_port = Some(bound_port(netimgui));
    status.status_port = probe_port(container);
    status.pod_status = Some(summarize_pod(pod));
    status.ready = pod_is_ready(pod);

    let Some(node_name) = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
    else {
        debug!("pod not yet scheduled");
        return Ok(Progress::Requeue);
    };

    let node = ctx
        .store
        .get_node(node_name)
        .await?
        .ok_or_else(|| Error::not_found(format!("node {node_name}")))?;

    let status = game_server.status_mut();
    status.internal_ip = node_address(&node, "InternalIP");

    match node_address(&node, "ExternalIP") {
        Some(ip) => {
            status.ip = Some(ip);
        }
        None => {
            error!(node = %node_name, "node does not have a public IP, not requeuing");
            ctx.events
                .publish(
                    &game_server.object_ref(&()),
                    GameEvent::NoExternalIp {
                        node: node_name.to_string(),
                    },
                )
                .await;
        }
    }

    Ok(Progress::Done)
}

/// Command line for a game server process
///
/// Order: map (if any), game port, NetImgui port, storage key, status port
/// (when probed), then the user's extra arguments.
pub fn launch_args(game_server: &GameServer, ports: PortAssignment) -> Vec<String> {
    let spec = &game_server.spec;
    let mut args = Vec::with_capacity(5 + spec.cmd_args.len());

    if let Some(map) = spec.launch_map() {
        args.push(map.to_string());
    }
    args.push(format!("-port={}", ports.game));
    args.push(format!("-NetImguiClientPort={}", ports.netimgui));
    args.push(format!(
        "-StorageKey={}",
        storage_key_for(spec.display_name(), &game_server.name_any())
    ));
    if spec.include_readiness_probe {
        args.push(format!("-StatusPort={}", ports.status));
    }
    args.extend(spec.cmd_args.iter().cloned());
    args
}

/// Pod backing a GameServer
pub fn build_pod(
    game_server: &GameServer,
    config: &OperatorConfig,
    ports: PortAssignment,
) -> Result<Pod, Error> {
    let owner = game_server
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation("game server has no uid to own a pod"))?;

    let readiness_probe = game_server.spec.include_readiness_probe.then(|| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(ports.status),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(5),
        ..Default::default()
    });

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(game_server.name_any()),
            namespace: game_server.namespace(),
            annotations: Some(BTreeMap::from([(
                DO_NOT_DISRUPT_ANNOTATION.to_string(),
                "true".to_string(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(config.image_for(&game_server.spec.version)),
                args: Some(launch_args(game_server, ports)),
                ports: Some(vec![
                    host_port(ports.game, "UDP"),
                    host_port(ports.netimgui, "TCP"),
                ]),
                readiness_probe,
                ..Default::default()
            }],
            host_network: Some(true),
            node_selector: Some(BTreeMap::from([(
                NODE_TYPE_LABEL.to_string(),
                NODE_TYPE_GAME.to_string(),
            )])),
            restart_policy: Some("OnFailure".to_string()),
            tolerations: Some(vec![Toleration {
                key: Some(GAME_TAINT_KEY.to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn host_port(port: i32, protocol: &str) -> ContainerPort {
    ContainerPort {
        container_port: port,
        host_port: Some(port),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    }
}

/// Host port a declared container port is bound to
fn bound_port(port: &ContainerPort) -> i32 {
    port.host_port.unwrap_or(port.container_port)
}

fn probe_port(container: &Container) -> Option<i32> {
    match container.readiness_probe.as_ref()?.tcp_socket.as_ref()?.port {
        IntOrString::Int(port) => Some(port),
        IntOrString::String(_) => None,
    }
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Whether the scheduler gave up on the pod because its host ports are taken
fn has_port_conflict(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.reason.as_deref() == Some("Unschedulable")
                    && c.message
                        .as_deref()
                        .is_some_and(|m| m.contains(PORT_CONFLICT_MARKER))
            })
        })
        .unwrap_or(false)
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn summarize_pod(pod: &Pod) -> PodSummary {
    let Some(status) = pod.status.as_ref() else {
        return PodSummary::default();
    };
    PodSummary {
        phase: status.phase.clone(),
        reason: status.reason.clone(),
        message: status.message.clone(),
        host_ip: status.host_ip.clone(),
        pod_ip: status.pod_ip.clone(),
    }
}

/// First node address of the given type
fn node_address(node: &Node, type_: &str) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == type_)
        .map(|a| a.address.clone())
}
