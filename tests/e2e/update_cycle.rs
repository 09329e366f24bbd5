//! Full update-cycle scenarios driven through a real warden.
//!
//! Each scenario installs or publishes shell-script builds and asserts on
//! the order in which they actually ran.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::TestHarness;
use saorsa_warden::WardenEvent;
use std::time::Duration;

/// Test that the warden supervises an installed build and shuts down cleanly.
#[tokio::test]
async fn test_supervise_and_shutdown() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    harness
        .install_build("v1", 600)
        .expect("Failed to install build");

    let config = harness.config_supervise_only();
    harness.start(config).await.expect("Failed to start warden");

    harness
        .wait_for_event(
            "warden start",
            |e| matches!(e, WardenEvent::Started),
            Duration::from_secs(10),
        )
        .await
        .expect("Warden should announce itself");
    harness
        .wait_for_event(
            "process start",
            |e| matches!(e, WardenEvent::ProcessStarted { .. }),
            Duration::from_secs(10),
        )
        .await
        .expect("Managed process should start");
    harness
        .wait_for_run("v1", Duration::from_secs(10))
        .await
        .expect("Build v1 should run");

    harness.teardown().await.expect("Failed to teardown");
}

/// Test that a build which keeps exiting is relaunched.
#[tokio::test]
async fn test_restarts_exited_build() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    harness
        .install_build("v1", 1)
        .expect("Failed to install build");

    let config = harness.config_supervise_only();
    harness.start(config).await.expect("Failed to start warden");

    // Two entries in the runs file means at least one restart happened
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while harness.runs().len() < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Build should be relaunched after exiting"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    harness.teardown().await.expect("Failed to teardown");
}

/// Test the full cycle: a newly published version is downloaded, swapped
/// in, and picked up when the running build exits.
#[tokio::test]
async fn test_update_cycle_swaps_and_restarts() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    harness
        .install_build("v1", 3)
        .expect("Failed to install build");
    harness.publish("v1", 3).await;

    let config = harness.config();
    harness.start(config).await.expect("Failed to start warden");
    harness
        .wait_for_run("v1", Duration::from_secs(10))
        .await
        .expect("Build v1 should run");

    // Let the checker record v1 before anything newer appears
    tokio::time::sleep(Duration::from_millis(1500)).await;

    harness.publish("v2", 600).await;
    harness
        .wait_for_event(
            "update completion",
            |e| matches!(e, WardenEvent::UpdateComplete { version } if version == "v2"),
            Duration::from_secs(15),
        )
        .await
        .expect("Update to v2 should complete");

    harness
        .wait_for_run("v2", Duration::from_secs(15))
        .await
        .expect("Build v2 should run after the restart");
    assert_eq!(harness.runs().last().map(String::as_str), Some("v2"));

    let installed =
        std::fs::read_to_string(harness.target()).expect("Target should be readable");
    assert!(installed.contains("echo v2"), "Target should be the v2 build");

    harness.teardown().await.expect("Failed to teardown");
}

/// Test that failed downloads leave the current build untouched and running.
#[tokio::test]
async fn test_failed_download_keeps_current_build() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    harness
        .install_build("v1", 600)
        .expect("Failed to install build");
    harness.publish("v1", 600).await;

    let config = harness.config();
    harness.start(config).await.expect("Failed to start warden");
    harness
        .wait_for_run("v1", Duration::from_secs(10))
        .await
        .expect("Build v1 should run");

    tokio::time::sleep(Duration::from_millis(1500)).await;

    harness.publish_broken("v2").await;
    harness
        .wait_for_event(
            "update failure",
            |e| matches!(e, WardenEvent::UpdateFailed { version, .. } if version == "v2"),
            Duration::from_secs(15),
        )
        .await
        .expect("Update to v2 should fail");

    assert_eq!(harness.runs(), vec!["v1".to_string()]);
    let installed =
        std::fs::read_to_string(harness.target()).expect("Target should be readable");
    assert!(installed.contains("echo v1"), "Target should still be the v1 build");

    harness.teardown().await.expect("Failed to teardown");
}

/// Test that a crashing build keeps being relaunched while update checks
/// stay idle on an unchanged release.
#[tokio::test]
async fn test_crashing_build_restarts_without_update_activity() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    harness
        .install_crashing_build("v1")
        .expect("Failed to install build");
    harness.publish("v1", 600).await;

    let config = harness.config();
    harness.start(config).await.expect("Failed to start warden");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while harness.runs().len() < 3 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Crashing build should be relaunched"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let installed =
        std::fs::read_to_string(harness.target()).expect("Target should be readable");
    assert!(installed.contains("exit 3"), "No update should have landed");

    harness.teardown().await.expect("Failed to teardown");
}

/// Test that a failing release endpoint falls back to the mirror and the
/// update still completes.
#[tokio::test]
async fn test_failing_endpoint_falls_back_to_mirror() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    harness
        .install_build("v1", 3)
        .expect("Failed to install build");
    harness.publish("v1", 3).await;

    let config = harness.config_with_mirror();
    harness.start(config).await.expect("Failed to start warden");
    harness
        .wait_for_run("v1", Duration::from_secs(10))
        .await
        .expect("Build v1 should run");

    tokio::time::sleep(Duration::from_millis(1500)).await;

    harness.publish_with_broken_primary("v2", 600).await;
    harness
        .wait_for_event(
            "update completion via mirror",
            |e| matches!(e, WardenEvent::UpdateComplete { version } if version == "v2"),
            Duration::from_secs(15),
        )
        .await
        .expect("Update to v2 should complete through the mirror");

    harness
        .wait_for_run("v2", Duration::from_secs(15))
        .await
        .expect("Build v2 should run after the restart");

    harness.teardown().await.expect("Failed to teardown");
}

/// Test that a corrupted artifact is rejected and the current build keeps
/// running unmodified.
#[tokio::test]
async fn test_corrupted_artifact_is_rejected() {
    let mut harness = TestHarness::setup().await.expect("Failed to setup harness");
    harness
        .install_build("v1", 600)
        .expect("Failed to install build");
    harness.publish("v1", 600).await;

    let config = harness.config();
    harness.start(config).await.expect("Failed to start warden");
    harness
        .wait_for_run("v1", Duration::from_secs(10))
        .await
        .expect("Build v1 should run");

    tokio::time::sleep(Duration::from_millis(1500)).await;

    harness.publish_tampered("v2").await;
    let failure = harness
        .wait_for_event(
            "checksum rejection",
            |e| matches!(e, WardenEvent::UpdateFailed { version, .. } if version == "v2"),
            Duration::from_secs(15),
        )
        .await
        .expect("Tampered update should be rejected");
    if let WardenEvent::UpdateFailed { reason, .. } = failure {
        assert!(
            reason.contains("Checksum mismatch"),
            "Rejection should name the checksum: {reason}"
        );
    }

    assert_eq!(harness.runs(), vec!["v1".to_string()]);
    let installed =
        std::fs::read_to_string(harness.target()).expect("Target should be readable");
    assert!(installed.contains("echo v1"), "Target should still be the v1 build");

    harness.teardown().await.expect("Failed to teardown");
}
