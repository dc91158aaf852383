//! f11r operator - ephemeral game servers and scheduled playtests on Kubernetes
//!
//! Two controllers run side by side:
//!
//! - The GameServer controller keeps exactly one pod per GameServer, draws
//!   host ports for it, redraws on port conflicts, mirrors the pod's address
//!   into status, and deletes the GameServer once its pod exits cleanly.
//! - The Playtest controller sizes a playtest's groups, places queued users
//!   into open groups one at a time, and keeps one GameServer per group while
//!   the playtest's spawn window is open.
//!
//! Each pass edits a copy of the object and writes the difference back as a
//! single merge patch at the end.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (GameServer, Playtest)
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`sanitize`] - Storage-safe keys derived from display names
//! - [`random`] - Injectable randomness and host port draws
//! - [`patch`] - End-of-pass merge patches
//! - [`events`] - Kubernetes Events for `kubectl describe`
//! - [`retry`] - Per-object error backoff
//! - [`config`] - Operator settings
//! - [`clock`] - Injectable time source
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod clock;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod patch;
pub mod random;
pub mod retry;
pub mod sanitize;

pub use error::Error;
