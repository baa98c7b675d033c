#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Composition-root smoke tests: startup with an in-memory store, config
//! hot-reload, hook-event validation, and ordered shutdown.

use forge_connectors::ConnectorFactory;
use forge_core::ForgeConfig;
use forge_daemon::{Daemon, DaemonOptions};

#[tokio::test]
async fn daemon_starts_and_shuts_down_cleanly() {
    let daemon = Daemon::start(
        ForgeConfig::default(),
        ConnectorFactory::new(),
        DaemonOptions::in_memory(),
    )
    .await
    .expect("daemon start");

    assert!(daemon.manager().snapshot_list().is_empty());
    daemon.shutdown().await;
}

#[tokio::test]
async fn invalid_config_is_rejected_at_start_and_reload() {
    let mut broken = ForgeConfig::default();
    broken.defaults.poll_interval_seconds = 0.0;

    let err = Daemon::start(
        broken.clone(),
        ConnectorFactory::new(),
        DaemonOptions::in_memory(),
    )
    .await
    .err()
    .expect("start should fail");
    assert!(err.to_string().contains("poll_interval_seconds"));

    let daemon = Daemon::start(
        ForgeConfig::default(),
        ConnectorFactory::new(),
        DaemonOptions::in_memory(),
    )
    .await
    .expect("daemon start");

    // A bad reload leaves the previous config live.
    assert!(daemon.reload_config(broken).await.is_err());
    assert!(daemon.config().read().defaults.poll_interval_seconds > 0.0);

    daemon.shutdown().await;
}

#[tokio::test]
async fn hook_event_validates_name_and_agent() {
    let daemon = Daemon::start(
        ForgeConfig::default(),
        ConnectorFactory::new(),
        DaemonOptions::in_memory(),
    )
    .await
    .expect("daemon start");

    let err = daemon
        .handle_hook_event("a1b2c3", "NotAHook")
        .expect_err("unknown event name");
    assert!(err.to_string().contains("NotAHook"));

    let err = daemon
        .handle_hook_event("a1b2c3", "SubagentStart")
        .expect_err("unknown agent");
    assert!(err.to_string().contains("a1b2c3"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn terminal_subscription_requires_a_live_agent() {
    let daemon = Daemon::start(
        ForgeConfig::default(),
        ConnectorFactory::new(),
        DaemonOptions::in_memory(),
    )
    .await
    .expect("daemon start");

    assert!(daemon.subscribe_terminal("ghost1").await.is_err());
    daemon.shutdown().await;
}
