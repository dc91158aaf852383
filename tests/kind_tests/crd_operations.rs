//! Integration tests for CRD operations
//!
//! These tests tell the story of how users and the operator interact with
//! GameServer and Playtest resources through the Kubernetes API.

use chrono::{TimeZone, Utc};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use serde_json::json;

use f11r_operator::crd::{
    GameServer, GameServerSpec, LocalRef, Playtest, PlaytestGroup, PlaytestSpec,
};

use super::helpers::{cleanup_namespace, ensure_test_cluster, fresh_namespace};

/// Story: a developer launches a one-off server for a build
///
/// Expected behavior:
/// - The GameServer is accepted with only a version
/// - Optional fields come back unset and status starts empty
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_developer_creates_standalone_game_server() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let namespace = "f11r-crd-gs";
    fresh_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");
    let api: Api<GameServer> = Api::namespaced(client.clone(), namespace);

    let mut server = GameServer::new("smoke", GameServerSpec::for_version("abc12345"));
    server.spec.map = Some("Arena".to_string());
    let created = api
        .create(&PostParams::default(), &server)
        .await
        .expect("failed to create GameServer");

    assert_eq!(created.spec.version, "abc12345");
    assert_eq!(created.spec.launch_map(), Some("Arena"));
    assert!(created.spec.cmd_args.is_empty());
    assert!(created.status.is_none());

    cleanup_namespace(&client, namespace).await;
}

/// Story: the operator writes observed state through the status subresource
///
/// Expected behavior:
/// - A status merge patch is stored without touching the spec
/// - Reading the object back shows the pod reference and ports
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_operator_records_game_server_status() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let namespace = "f11r-crd-status";
    fresh_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");
    let api: Api<GameServer> = Api::namespaced(client.clone(), namespace);

    api.create(
        &PostParams::default(),
        &GameServer::new("status", GameServerSpec::for_version("v1")),
    )
    .await
    .expect("failed to create GameServer");

    api.patch_status(
        "status",
        &PatchParams::default(),
        &Patch::Merge(json!({
            "status": {
                "podRef": { "name": "status-abcde" },
                "port": 7712,
                "netimguiPort": 7812,
                "ready": false
            }
        })),
    )
    .await
    .expect("failed to patch status");

    let stored = api.get("status").await.expect("failed to read GameServer");
    let status = stored.status.expect("status stored");
    assert_eq!(status.pod_ref, Some(LocalRef::new("status-abcde")));
    assert_eq!(status.port, Some(7712));
    assert_eq!(status.netimgui_port, Some(7812));
    assert_eq!(stored.spec.version, "v1");

    cleanup_namespace(&client, namespace).await;
}

/// Story: a producer schedules a playtest with a preset group
///
/// Expected behavior:
/// - Start time, queue and groups survive the round trip through the API
/// - The feedback URL keeps its wire name
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_producer_schedules_playtest() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let namespace = "f11r-crd-pt";
    fresh_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");
    let api: Api<Playtest> = Api::namespaced(client.clone(), namespace);

    let start = Utc.with_ymd_and_hms(2030, 1, 10, 17, 0, 0).unwrap();
    let playtest = Playtest::new(
        "friday",
        PlaytestSpec {
            display_name: Some("Friday Playtest".to_string()),
            version: "abc12345".to_string(),
            map: Some("Arena".to_string()),
            min_groups: 2,
            players_per_group: 4,
            start_time: Some(start),
            feedback_url: Some("https://forms.example/friday".to_string()),
            users_to_auto_assign: vec!["ana".to_string(), "bo".to_string()],
            groups: vec![PlaytestGroup {
                name: "Leads".to_string(),
                users: vec!["cy".to_string()],
            }],
            ..Default::default()
        },
    );

    let created = api
        .create(&PostParams::default(), &playtest)
        .await
        .expect("failed to create Playtest");

    assert_eq!(created.spec.start_time, Some(start));
    assert_eq!(created.spec.users_to_auto_assign, vec!["ana", "bo"]);
    assert_eq!(created.spec.groups[0].name, "Leads");

    let raw = serde_json::to_value(&created).expect("serializable");
    assert_eq!(raw["spec"]["feedbackURL"], "https://forms.example/friday");
    assert!(created.uid().is_some());

    cleanup_namespace(&client, namespace).await;
}
