//! Playtest reconciler against a real API server
//!
//! The reconciler is driven by hand here instead of through kube-runtime, so
//! each pass can be checked on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;

use f11r_operator::controller::{reconcile_playtest, PlaytestContext};
use f11r_operator::crd::{GameServer, Playtest, PlaytestSpec, COMMIT_LABEL, PLAYTEST_LABEL};

use super::helpers::{cleanup_namespace, ensure_test_cluster, fresh_namespace};

/// Run passes until the reconciler stops asking for an immediate requeue
async fn settle(client: &Client, namespace: &str, name: &str, ctx: &Arc<PlaytestContext>) -> Playtest {
    let api: Api<Playtest> = Api::namespaced(client.clone(), namespace);
    for _ in 0..10 {
        let current = api.get(name).await.expect("failed to read Playtest");
        let action = reconcile_playtest(Arc::new(current), ctx.clone())
            .await
            .expect("reconcile failed");
        if action != Action::requeue(Duration::ZERO) {
            return api.get(name).await.expect("failed to read Playtest");
        }
    }
    panic!("playtest {name} did not settle");
}

/// Story: a playtest starting now brings up one server per group
///
/// Expected behavior:
/// - Queued users are placed before any server exists
/// - Each group gets a GameServer owned by the playtest
/// - Status points at each group's server
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_playtest_spawns_group_servers() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let namespace = "f11r-pt-spawn";
    fresh_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");
    let ctx = Arc::new(PlaytestContext::builder(client.clone()).build());

    let playtests: Api<Playtest> = Api::namespaced(client.clone(), namespace);
    let playtest = Playtest::new(
        "friday",
        PlaytestSpec {
            version: "abc12345".to_string(),
            map: Some("Arena".to_string()),
            min_groups: 2,
            players_per_group: 4,
            start_time: Some(Utc::now()),
            users_to_auto_assign: vec!["ana".to_string(), "bo".to_string()],
            ..Default::default()
        },
    );
    playtests
        .create(&PostParams::default(), &playtest)
        .await
        .expect("failed to create Playtest");

    let settled = settle(&client, namespace, "friday", &ctx).await;

    assert!(settled.spec.users_to_auto_assign.is_empty());
    let placed: usize = settled.spec.groups.iter().map(|g| g.users.len()).sum();
    assert_eq!(placed, 2);

    let servers: Api<GameServer> = Api::namespaced(client.clone(), namespace);
    let list = servers
        .list(&ListParams::default().labels(&format!("{PLAYTEST_LABEL}=friday")))
        .await
        .expect("failed to list GameServers");
    let mut names: Vec<String> = list.items.iter().map(|s| s.name_any()).collect();
    names.sort();
    assert_eq!(names, vec!["friday-group-1", "friday-group-2"]);

    for server in &list.items {
        assert_eq!(server.spec.version, "linux-server-abc12345");
        assert_eq!(
            server.labels().get(COMMIT_LABEL).map(String::as_str),
            Some("abc12345")
        );
        assert_eq!(server.owner_references()[0].name, "friday");
    }

    let status = settled.status.expect("status written");
    assert_eq!(status.groups.len(), 2);
    assert!(status.groups.iter().all(|g| g.server_ref.is_some()));

    cleanup_namespace(&client, namespace).await;
}

/// Story: the playtest is pushed back a day and its servers go away
///
/// Expected behavior:
/// - Servers created for the earlier start are deleted
/// - Group status keeps the members but drops the server references
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_postponed_playtest_tears_down_servers() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let namespace = "f11r-pt-postpone";
    fresh_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");
    let ctx = Arc::new(PlaytestContext::builder(client.clone()).build());

    let playtests: Api<Playtest> = Api::namespaced(client.clone(), namespace);
    playtests
        .create(
            &PostParams::default(),
            &Playtest::new(
                "monday",
                PlaytestSpec {
                    version: "v2".to_string(),
                    min_groups: 1,
                    players_per_group: 4,
                    ..Default::default()
                },
            ),
        )
        .await
        .expect("failed to create Playtest");
    settle(&client, namespace, "monday", &ctx).await;

    let servers: Api<GameServer> = Api::namespaced(client.clone(), namespace);
    assert!(servers
        .get_opt("monday-group-1")
        .await
        .expect("lookup failed")
        .is_some());

    let tomorrow = Utc::now() + chrono::Duration::days(1);
    playtests
        .patch(
            "monday",
            &PatchParams::default(),
            &Patch::Merge(json!({ "spec": { "startTime": tomorrow } })),
        )
        .await
        .expect("failed to postpone");

    let settled = settle(&client, namespace, "monday", &ctx).await;

    assert!(servers
        .get_opt("monday-group-1")
        .await
        .expect("lookup failed")
        .is_none());
    let status = settled.status.expect("status written");
    assert!(status.groups[0].server_ref.is_none());

    cleanup_namespace(&client, namespace).await;
}
