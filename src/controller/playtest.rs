//! Playtest controller implementation
//!
//! A pass runs three phases in order:
//!
//! 1. Size the declared group list to exactly `minGroups`.
//! 2. Place the first queued user into a random open group, then requeue.
//!    Only one user is placed per pass.
//! 3. Once the queue is empty, keep one GameServer per group while the spawn
//!    window is open and none while it is closed. Servers whose version or map
//!    no longer match the playtest are replaced.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::{deleted, object_key, Progress, CONTROLLER_NAME};
use crate::clock::{Clock, SystemClock};
use crate::config::DEFAULT_RESYNC_INTERVAL;
use crate::crd::{
    GameServer, GameServerSpec, LocalRef, Playtest, PlaytestGroup, PlaytestSpec, COMMIT_LABEL,
    PLAYTEST_LABEL,
};
use crate::events::{EventPublisher, GameEvent, KubeEventPublisher};
use crate::patch::ObjectPatch;
use crate::random::{RandomSource, ThreadRandom};
use crate::retry::{BackoffConfig, ErrorBackoff};
use crate::Error;

/// How long before the start time group servers are brought up
pub const SPAWN_LEAD_TIME: Duration = Duration::from_secs(10 * 60);

/// Length of a raw commit identifier; such versions name a server build
const COMMIT_ID_LEN: usize = 8;

/// Trait abstracting the Kubernetes operations the Playtest controller needs
///
/// Lookups return `Ok(None)` and deletes return `Ok(false)` when the object is
/// already gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlaytestStore: Send + Sync {
    /// Fetch a GameServer
    async fn get_game_server(&self, namespace: &str, name: &str)
        -> Result<Option<GameServer>, Error>;

    /// Create a GameServer, failing with [`Error::AlreadyExists`] on a name clash
    async fn create_game_server(
        &self,
        namespace: &str,
        game_server: &GameServer,
    ) -> Result<GameServer, Error>;

    /// Delete a GameServer
    async fn delete_game_server(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Apply end-of-pass changes to a Playtest
    async fn patch_playtest(
        &self,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct PlaytestStoreImpl {
    client: Client,
}

impl PlaytestStoreImpl {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaytestStore for PlaytestStoreImpl {
    async fn get_game_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<GameServer>, Error> {
        let api: Api<GameServer> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_game_server(
        &self,
        namespace: &str,
        game_server: &GameServer,
    ) -> Result<GameServer, Error> {
        let api: Api<GameServer> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), game_server).await?)
    }

    async fn delete_game_server(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<GameServer> = Api::namespaced(self.client.clone(), namespace);
        deleted(api.delete(name, &DeleteParams::default()).await)
    }

    async fn patch_playtest(
        &self,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<(), Error> {
        let api: Api<Playtest> = Api::namespaced(self.client.clone(), namespace);
        patch.apply(&api, name).await
    }
}

/// Controller context for Playtest reconciliation
pub struct PlaytestContext {
    /// Kubernetes operations (trait object for testability)
    pub store: Arc<dyn PlaytestStore>,
    /// Event publisher for `kubectl describe` visibility
    pub events: Arc<dyn EventPublisher>,
    /// Source for group draws
    pub random: Arc<dyn RandomSource>,
    /// Current time for the spawn window
    pub clock: Arc<dyn Clock>,
    /// Interval after which a settled playtest is looked at again
    pub resync_interval: Duration,
    /// Per-object failure counters for the error policy
    pub backoff: ErrorBackoff,
}

impl PlaytestContext {
    /// Create a builder for constructing a context
    pub fn builder(client: Client) -> PlaytestContextBuilder {
        PlaytestContextBuilder::new(client)
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn PlaytestStore>,
        events: Arc<dyn EventPublisher>,
        random: Arc<dyn RandomSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            events,
            random,
            clock,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            backoff: ErrorBackoff::new(BackoffConfig {
                jitter: false,
                ..Default::default()
            }),
        }
    }
}

/// Builder for constructing [`PlaytestContext`] instances
pub struct PlaytestContextBuilder {
    client: Client,
    store: Option<Arc<dyn PlaytestStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    random: Option<Arc<dyn RandomSource>>,
    clock: Option<Arc<dyn Clock>>,
    resync_interval: Duration,
    backoff: BackoffConfig,
}

impl PlaytestContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            events: None,
            random: None,
            clock: None,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            backoff: BackoffConfig::default(),
        }
    }

    /// Set the resync interval
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Override the store (primarily for testing)
    pub fn store(mut self, store: Arc<dyn PlaytestStore>) -> Self {
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

    /// Override the clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the error backoff curve
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build the context
    pub fn build(self) -> PlaytestContext {
        PlaytestContext {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(PlaytestStoreImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            random: self.random.unwrap_or_else(|| Arc::new(ThreadRandom)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            resync_interval: self.resync_interval,
            backoff: ErrorBackoff::new(self.backoff),
        }
    }
}

/// Reconcile a Playtest resource
///
/// Works on a copy of the object and patches the difference back before
/// returning, whatever the pass returned.
#[instrument(
    skip(playtest, ctx),
    fields(playtest = %playtest.name_any(), namespace = %playtest.namespace().unwrap_or_default())
)]
pub async fn reconcile(playtest: Arc<Playtest>, ctx: Arc<PlaytestContext>) -> Result<Action, Error> {
    let key = object_key(playtest.as_ref());
    if playtest.meta().deletion_timestamp.is_some() {
        debug!("playtest is being deleted, skipping");
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }
    debug!("reconciling playtest");

    let mut working = playtest.as_ref().clone();
    let outcome = run_pass(&mut working, &ctx).await;
    if !persist(&playtest, &working, &ctx).await {
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    let progress = outcome?;
    ctx.backoff.reset(&key);
    Ok(progress.into_action(ctx.resync_interval))
}

/// Error policy for the Playtest controller
///
/// Requeues with a per-object exponential backoff.
pub fn error_policy(playtest: Arc<Playtest>, error: &Error, ctx: Arc<PlaytestContext>) -> Action {
    let delay = ctx.backoff.next_delay(&object_key(playtest.as_ref()));
    error!(
        ?error,
        playtest = %playtest.name_any(),
        retry_in_secs = delay.as_secs_f64(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

async fn run_pass(playtest: &mut Playtest, ctx: &PlaytestContext) -> Result<Progress, Error> {
    size_groups(&mut playtest.spec);

    if !playtest.spec.users_to_auto_assign.is_empty() {
        return Ok(assign_next_user(playtest, ctx).await);
    }

    reconcile_group_servers(playtest, ctx).await
}

/// Patch the pass's changes back; false once the object is gone
async fn persist(original: &Playtest, modified: &Playtest, ctx: &PlaytestContext) -> bool {
    let patch = match ObjectPatch::between(original, modified) {
        Ok(patch) => patch,
        Err(e) => {
            error!(error = %e, "failed to compute playtest patch");
            return true;
        }
    };
    if patch.is_empty() {
        return true;
    }

    let namespace = original.namespace().unwrap_or_default();
    match ctx
        .store
        .patch_playtest(&namespace, &original.name_any(), &patch)
        .await
    {
        Ok(()) => true,
        Err(e) if e.is_not_found() => {
            debug!("playtest gone before patch");
            false
        }
        Err(e) if e.is_conflict() => {
            warn!(error = %e, "playtest changed during reconcile, leaving for resync");
            true
        }
        Err(e) => {
            error!(error = %e, "error patching playtest");
            true
        }
    }
}

/// Make the declared group list exactly `min_groups` long
///
/// New groups are named `Group N`, numbering on from the current count.
/// Surplus groups are dropped along with their members.
pub fn size_groups(spec: &mut PlaytestSpec) {
    let target = spec.min_groups as usize;
    let current = spec.groups.len();

    if current < target {
        for number in current + 1..=target {
            let name = format!("Group {number}");
            debug!(group = %name, "adding group");
            spec.groups.push(PlaytestGroup::named(name));
        }
    } else if current > target {
        info!(from = current, to = target, "truncating groups");
        spec.groups.truncate(target);
    }
}

/// Build name for a playtest version
///
/// A bare commit identifier is expanded to the server build named after it.
pub fn server_version_for(version: &str) -> String {
    if version.len() == COMMIT_ID_LEN {
        format!("linux-server-{version}")
    } else {
        version.to_string()
    }
}

/// Name of the GameServer spawned for a group
pub fn server_name_for(playtest: &str, group: &str) -> String {
    format!("{}-{}", playtest, group.to_lowercase().replace(' ', "-"))
}

/// Whether group servers should exist at `now`
///
/// A playtest without a start time is always in its window.
fn spawn_window_open(now: DateTime<Utc>, start: Option<DateTime<Utc>>) -> bool {
    let Some(start) = start else {
        return true;
    };
    let lead = chrono::Duration::seconds(SPAWN_LEAD_TIME.as_secs() as i64);
    now + lead >= start
}

async fn assign_next_user(playtest: &mut Playtest, ctx: &PlaytestContext) -> Progress {
    let open = playtest.spec.open_groups();
    if open.is_empty() {
        warn!(
            queued = playtest.spec.users_to_auto_assign.len(),
            "no open groups for queued users"
        );
        ctx.events
            .publish(&playtest.object_ref(&()), GameEvent::NoOpenGroups)
            .await;
        return Progress::Done;
    }

    let index = open[ctx.random.below(open.len()).min(open.len() - 1)];
    match playtest.spec.assign_queued_user(index) {
        Some(user) => {
            let group = &playtest.spec.groups[index].name;
            info!(%user, %group, "assigned queued user");
            Progress::Requeue
        }
        None => {
            warn!(index, "could not place queued user, leaving queue as is");
            Progress::Done
        }
    }
}

/// What a group's GameServer should look like
struct DesiredServer {
    version: String,
    map: Option<String>,
}

impl DesiredServer {
    fn for_playtest(spec: &PlaytestSpec) -> Self {
        Self {
            version: server_version_for(&spec.version),
            map: spec.map.clone().filter(|m| !m.is_empty()),
        }
    }

    fn matches(&self, server: &GameServer) -> bool {
        server.spec.version == self.version && server.spec.launch_map() == self.map.as_deref()
    }
}

async fn reconcile_group_servers(
    playtest: &mut Playtest,
    ctx: &PlaytestContext,
) -> Result<Progress, Error> {
    let desired = DesiredServer::for_playtest(&playtest.spec);
    let window_open = !playtest.spec.disable_game_servers
        && spawn_window_open(ctx.clock.now(), playtest.spec.start_time);
    debug!(window_open, "reconciling group servers");

    let mut progress = Progress::Done;
    let groups = playtest.spec.groups.clone();
    for group in &groups {
        let status = playtest.status_mut();
        let index = status.ensure_group(&group.name);
        status.groups[index].users = group.users.clone();

        let step = if window_open {
            ensure_group_server(playtest, index, group, &desired, ctx).await?
        } else {
            teardown_group_server(playtest, index, ctx).await;
            Progress::Done
        };
        progress = progress.or(step);
    }

    prune_status_groups(playtest, ctx).await;
    Ok(progress)
}

async fn ensure_group_server(
    playtest: &mut Playtest,
    index: usize,
    group: &PlaytestGroup,
    desired: &DesiredServer,
    ctx: &PlaytestContext,
) -> Result<Progress, Error> {
    let namespace = playtest.namespace().unwrap_or_default();

    let referenced = playtest.status_mut().groups[index]
        .server_ref
        .as_ref()
        .map(|r| r.name.clone());

    if let Some(server_name) = referenced {
        match ctx.store.get_game_server(&namespace, &server_name).await? {
            Some(server) if desired.matches(&server) => {
                playtest.status_mut().groups[index].ready = server.is_ready();
                return Ok(Progress::Done);
            }
            Some(server) => {
                info!(group = %group.name, server = %server_name, "game server config drifted, deleting");
                ctx.events
                    .publish(
                        &playtest.object_ref(&()),
                        GameEvent::ConfigDrift {
                            server: server_name.clone(),
                            running: describe_build(&server.spec.version, server.spec.launch_map()),
                            wanted: describe_build(&desired.version, desired.map.as_deref()),
                        },
                    )
                    .await;
                ctx.store.delete_game_server(&namespace, &server_name).await?;
                clear_server_ref(playtest, index);
                return Ok(Progress::Requeue);
            }
            None => {
                info!(group = %group.name, server = %server_name, "group game server missing, recreating");
                clear_server_ref(playtest, index);
            }
        }
    }

    let server = build_group_server(playtest, group, desired)?;
    let server_name = server.name_any();
    match ctx.store.create_game_server(&namespace, &server).await {
        Ok(_) => {
            info!(group = %group.name, server = %server_name, "created game server for group");
            ctx.events
                .publish(
                    &playtest.object_ref(&()),
                    GameEvent::GameServerCreated {
                        server: server_name.clone(),
                        group: group.name.clone(),
                    },
                )
                .await;
        }
        Err(e) if e.is_already_exists() => {
            debug!(server = %server_name, "group game server already exists, adopting");
        }
        Err(e) => return Err(e),
    }

    let entry = &mut playtest.status_mut().groups[index];
    entry.server_ref = Some(LocalRef::new(server_name));
    entry.ready = false;
    Ok(Progress::Done)
}

fn describe_build(version: &str, map: Option<&str>) -> String {
    format!("{version} on {}", map.unwrap_or("the default map"))
}

/// Remove a group's server outside the spawn window
///
/// Delete failures are logged only; the reference is cleared either way.
async fn teardown_group_server(playtest: &mut Playtest, index: usize, ctx: &PlaytestContext) {
    let namespace = playtest.namespace().unwrap_or_default();
    let Some(server_ref) = playtest.status_mut().groups[index].server_ref.take() else {
        return;
    };
    playtest.status_mut().groups[index].ready = false;
    delete_best_effort(ctx, &namespace, &server_ref.name).await;
}

async fn delete_best_effort(ctx: &PlaytestContext, namespace: &str, name: &str) {
    match ctx.store.delete_game_server(namespace, name).await {
        Ok(true) => info!(server = %name, "deleted game server"),
        Ok(false) => debug!(server = %name, "game server already gone"),
        Err(e) => error!(server = %name, error = %e, "error deleting game server"),
    }
}

fn clear_server_ref(playtest: &mut Playtest, index: usize) {
    let entry = &mut playtest.status_mut().groups[index];
    entry.server_ref = None;
    entry.ready = false;
}

/// Keep one status entry per declared group, at most `min_groups` of them
///
/// Servers owned by dropped entries are deleted best-effort.
async fn prune_status_groups(playtest: &mut Playtest, ctx: &PlaytestContext) {
    let namespace = playtest.namespace().unwrap_or_default();
    let declared: HashSet<String> = playtest.spec.groups.iter().map(|g| g.name.clone()).collect();
    let limit = playtest.spec.min_groups as usize;

    let status = playtest.status_mut();
    let mut seen = HashSet::new();
    let mut stale = Vec::new();
    let mut kept = Vec::with_capacity(status.groups.len());
    for entry in status.groups.drain(..) {
        if declared.contains(&entry.name) && seen.insert(entry.name.clone()) {
            kept.push(entry);
        } else {
            stale.push(entry);
        }
    }
    if kept.len() > limit {
        stale.extend(kept.drain(limit..));
    }
    status.groups = kept;

    for entry in stale {
        debug!(group = %entry.name, "dropping status for undeclared group");
        if let Some(server_ref) = entry.server_ref {
            delete_best_effort(ctx, &namespace, &server_ref.name).await;
        }
    }
}

/// GameServer spawned for one group
fn build_group_server(
    playtest: &Playtest,
    group: &PlaytestGroup,
    desired: &DesiredServer,
) -> Result<GameServer, Error> {
    let owner = playtest
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation("playtest has no uid to own game servers"))?;
    let name = server_name_for(&playtest.name_any(), &group.name);

    let spec = GameServerSpec {
        display_name: None,
        version: desired.version.clone(),
        map: desired.map.clone(),
        include_readiness_probe: playtest.spec.include_readiness_probe,
        cmd_args: playtest.spec.game_server_cmd_args.clone(),
    };

    let mut server = GameServer::new(&name, spec);
    server.metadata = ObjectMeta {
        name: Some(name),
        namespace: playtest.namespace(),
        labels: Some(
            [
                (PLAYTEST_LABEL.to_string(), playtest.name_any()),
                (COMMIT_LABEL.to_string(), playtest.spec.version.clone()),
            ]
            .into_iter()
            .collect(),
        ),
        owner_references: Some(vec![owner]),
        ..Default::default()
    };
    Ok(server)
}
