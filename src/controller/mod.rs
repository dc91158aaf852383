//! Controller implementations for the game CRDs
//!
//! This module contains the reconciliation logic for GameServer and Playtest
//! resources. Both controllers follow the same shape: mutate a clone of the
//! object handed in by kube-runtime, then patch the difference back once the
//! pass is over, whatever its outcome.

mod game_server;
mod playtest;

use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};

use crate::Error;

pub use game_server::{
    build_pod, error_policy as game_server_error_policy, launch_args,
    reconcile as reconcile_game_server, GameServerContext, GameServerContextBuilder,
    GameServerStore, GameServerStoreImpl, PORT_CONFLICT_MARKER,
};
pub use playtest::{
    error_policy as playtest_error_policy, reconcile as reconcile_playtest, server_name_for,
    server_version_for, size_groups, PlaytestContext, PlaytestContextBuilder, PlaytestStore,
    PlaytestStoreImpl, SPAWN_LEAD_TIME,
};

/// Field manager and event reporter name
pub const CONTROLLER_NAME: &str = "f11r-operator";

/// Outcome of a reconcile pass that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Nothing left to do until something changes or the resync fires
    Done,
    /// More work is pending; run again immediately
    Requeue,
}

impl Progress {
    /// Combine two outcomes; any requeue wins
    pub fn or(self, other: Progress) -> Progress {
        if self == Progress::Requeue || other == Progress::Requeue {
            Progress::Requeue
        } else {
            Progress::Done
        }
    }

    /// Translate into the action kube-runtime expects
    pub fn into_action(self, resync_interval: Duration) -> Action {
        match self {
            Progress::Done => Action::requeue(resync_interval),
            Progress::Requeue => Action::requeue(Duration::ZERO),
        }
    }
}

/// `namespace/name` key used for per-object bookkeeping
pub(crate) fn object_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Map a delete call onto "deleted" or "already gone"
pub(crate) fn deleted<T>(result: Result<T, kube::Error>) -> Result<bool, Error> {
    match result {
        Ok(_) => Ok(true),
        Err(e) => {
            let e = Error::from(e);
            if e.is_not_found() {
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}
