//! Command dispatch and the line transport.

mod common;

use common::{spec, Harness};
use fleetwatch_common::{
    AgentOverrideMode, PolicySource, UpdateStatus, VersionPinStrategy, WireMessage,
};
use fleetwatchd::dispatcher::CommandDispatcher;
use fleetwatchd::marker::RollbackMarker;
use fleetwatchd::policy_store::PolicyProvider;
use fleetwatchd::transport::serve_lines;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use UpdateStatus::*;

fn dispatcher(h: &Harness) -> CommandDispatcher {
    CommandDispatcher::new(h.manager.clone(), h.policy.clone())
}

#[tokio::test]
async fn test_check_update_command_runs_check() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Latest),
        None,
    );

    let task = dispatcher(&h)
        .handle_raw(r#"{"type":"command","data":{"command":"check_update"}}"#)
        .expect("check_update runs in the background");
    task.await.unwrap();

    assert_eq!(h.events.statuses(), vec![Checking, UpToDate]);
}

#[tokio::test]
async fn test_force_update_without_reason_is_accepted() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Never,
        spec(VersionPinStrategy::Latest),
        Some("1.3.0"),
    );

    let task = dispatcher(&h)
        .handle_raw(r#"{"type":"command","data":{"command":"force_update"}}"#)
        .unwrap();
    task.await.unwrap();

    // Refused by policy, reported only through progress.
    assert_eq!(h.events.statuses(), vec![Failed]);
    let reports = h.telemetry.wait_for(1).await;
    assert_eq!(reports[0].metadata.get("reason").map(String::as_str), Some(""));
}

#[tokio::test]
async fn test_force_update_reason_is_recorded() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Patch),
        Some("1.3.0"),
    );

    dispatcher(&h)
        .handle_raw(
            r#"{"type":"command","data":{"command":"force_update","reason":"admin-requested"}}"#,
        )
        .unwrap()
        .await
        .unwrap();

    let marker = h.markers.read().unwrap().unwrap();
    assert!(marker.forced);
    assert_eq!(marker.reason, "admin-requested");
}

#[tokio::test]
async fn test_decoded_envelope_dispatch() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Latest),
        Some("1.2.4"),
    );
    let message: WireMessage =
        serde_json::from_str(r#"{"type":"command","data":{"command":"check_update"}}"#).unwrap();

    dispatcher(&h).handle_message(message).unwrap().await.unwrap();

    assert_eq!(h.installer.installs(), 1);
    assert_eq!(h.manager.status().status, AwaitingRestart);
}

#[tokio::test]
async fn test_cancel_update_when_idle_is_a_no_op() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Latest),
        None,
    );

    let task = dispatcher(&h).handle_raw(r#"{"type":"command","data":{"command":"cancel_update"}}"#);

    assert!(task.is_none());
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn test_cancel_update_stops_running_check() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Latest),
        Some("1.3.0"),
    );
    let _gate = h.source.gate_checks();
    let dispatcher = dispatcher(&h);

    let task = dispatcher
        .handle_raw(r#"{"type":"command","data":{"command":"check_update"}}"#)
        .unwrap();
    h.wait_for_status(Checking).await;

    assert!(dispatcher
        .handle_raw(r#"{"type":"command","data":{"command":"cancel_update"}}"#)
        .is_none());
    task.await.unwrap();

    assert_eq!(h.events.statuses(), vec![Checking, Cancelled]);
}

#[tokio::test]
async fn test_unknown_and_malformed_messages_are_ignored() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Latest),
        None,
    );
    let dispatcher = dispatcher(&h);

    for raw in [
        r#"{"type":"command","data":{"command":"reboot_printer"}}"#,
        r#"{"type":"heartbeat_ack","data":{}}"#,
        r#"{"type":"command","data":{"command":"force_update","reason":42}}"#,
        r#"{"type":"command","data":"check_update"}"#,
        "not json",
    ] {
        assert!(dispatcher.handle_raw(raw).is_none(), "{}", raw);
    }

    assert!(h.events.events().is_empty());
    assert_eq!(h.source.checks(), 0);
}

#[tokio::test]
async fn test_fleet_policy_arrival_and_clear() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Patch),
        Some("2.0.0"),
    );
    let dispatcher = dispatcher(&h);

    dispatcher.handle_raw(
        r#"{"type":"update_policy","data":{
            "update_check_days":1,
            "version_pin_strategy":"latest",
            "allow_major_upgrade":true,
            "tenant_id":"acme"
        }}"#,
    );
    assert_eq!(h.policy.effective_policy().source(), PolicySource::Fleet);

    // Fleet policy allows the major bump the local Patch policy would not.
    dispatcher
        .handle_raw(r#"{"type":"command","data":{"command":"check_update"}}"#)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(h.installer.installs(), 1);

    dispatcher.handle_raw(r#"{"type":"update_policy","data":null}"#);
    assert_eq!(h.policy.effective_policy().source(), PolicySource::Fallback);
}

#[tokio::test]
async fn test_local_mode_ignores_fleet_policy() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Local,
        spec(VersionPinStrategy::Patch),
        Some("2.0.0"),
    );
    let dispatcher = dispatcher(&h);

    dispatcher.handle_raw(
        r#"{"type":"update_policy","data":{"version_pin_strategy":"latest","allow_major_upgrade":true}}"#,
    );
    dispatcher
        .handle_raw(r#"{"type":"command","data":{"command":"check_update"}}"#)
        .unwrap()
        .await
        .unwrap();

    assert_eq!(h.policy.effective_policy().source(), PolicySource::Local);
    assert_eq!(h.installer.installs(), 0);
    assert_eq!(h.events.statuses(), vec![Checking, UpToDate]);
}

#[tokio::test]
async fn test_serve_lines_feeds_dispatcher() {
    let h = Harness::new(
        "1.2.3",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Latest),
        None,
    );
    let (mut client, server) = tokio::io::duplex(1024);
    let shutdown = CancellationToken::new();
    let serve = tokio::spawn(serve_lines(server, dispatcher(&h), shutdown.clone()));

    client
        .write_all(b"\n{\"type\":\"command\",\"data\":{\"command\":\"check_update\"}}\n")
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.events.count(UpToDate) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    drop(client);
    serve.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_validates_then_stops() {
    let h = Harness::new(
        "1.3.0",
        AgentOverrideMode::Inherit,
        spec(VersionPinStrategy::Latest),
        None,
    );
    h.markers
        .write(&RollbackMarker::new("1.2.3", "1.3.0"))
        .unwrap();
    let shutdown = CancellationToken::new();

    let run = tokio::spawn(
        h.manager
            .clone()
            .run(Some(h.policy.subscribe()), shutdown.clone()),
    );
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.events.count(Succeeded) == 0 || h.manager.status().next_check.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert!(!h.markers.exists());
}
