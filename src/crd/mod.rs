//! Custom Resource Definitions for the game operator
//!
//! This module contains all CRD definitions used by the operator.

mod game_server;
mod playtest;
mod types;

pub use game_server::{GameServer, GameServerSpec, GameServerStatus};
pub use playtest::{
    Playtest, PlaytestGroup, PlaytestGroupStatus, PlaytestSpec, PlaytestStatus,
};
pub use types::{
    LocalRef, PodSummary, COMMIT_LABEL, DO_NOT_DISRUPT_ANNOTATION, GAME_TAINT_KEY,
    LEGACY_NAME_LABEL, NODE_TYPE_GAME, NODE_TYPE_LABEL, PLAYTEST_LABEL,
};
