//! Integration tests for the f11r operator
//!
//! These tests require a Kubernetes cluster (kind) to run.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading, and updating GameServer
//!   and Playtest resources through the Kubernetes API
//!
//! - `playtest_lifecycle`: Stories that drive the Playtest reconciler against a
//!   real API server and check the GameServers it leaves behind
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod crd_operations;
mod helpers;
mod playtest_lifecycle;
