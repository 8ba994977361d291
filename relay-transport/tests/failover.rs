//! Connection-order and failover behavior of the coordinator

mod common;

use serde_json::json;

use relay_core::{
    AlertKind, BackupChannels, ConnectionStatus, Endpoint, EndpointKind, Envelope, HealthStatus,
    RelayError,
};
use relay_transport::{LinkEvent, RelayEvent, RelayManager};

use common::{
    build_coordinator, events_until, registry_with, test_config, ws_endpoint, MockTransport,
};

#[tokio::test]
async fn connects_in_priority_order_skipping_dead_endpoints() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    mock.refuse("primary");

    // Deliberately unsorted input: the scan must order by priority
    let config = test_config(
        vec![
            ws_endpoint("tertiary", 3),
            ws_endpoint("primary", 1),
            ws_endpoint("secondary", 2),
        ],
        BackupChannels::none(),
    );
    let (mut coordinator, _events) = build_coordinator(config, registry_with(mock.clone()));

    let connected = coordinator.connect(&[]).await.unwrap();
    assert_eq!(connected, "secondary");
    assert_eq!(mock.attempts(), vec!["primary", "secondary"]);
    assert_eq!(coordinator.active_endpoint().as_deref(), Some("secondary"));
}

#[tokio::test]
async fn scan_makes_exactly_one_attempt_per_endpoint_until_success() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    mock.refuse("first");
    mock.refuse("second");

    let config = test_config(
        vec![
            ws_endpoint("first", 1),
            ws_endpoint("second", 2),
            ws_endpoint("third", 3),
        ],
        BackupChannels::none(),
    );
    let (mut coordinator, _events) = build_coordinator(config, registry_with(mock.clone()));

    let connected = coordinator.connect(&[]).await.unwrap();
    assert_eq!(connected, "third");
    assert_eq!(mock.attempts(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn scan_reports_exhaustion_when_every_endpoint_refuses() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    mock.refuse("a");
    mock.refuse("b");

    let config = test_config(
        vec![ws_endpoint("a", 1), ws_endpoint("b", 2)],
        BackupChannels::none(),
    );
    let (mut coordinator, _events) = build_coordinator(config, registry_with(mock.clone()));

    let err = coordinator.connect(&[]).await.unwrap_err();
    assert!(matches!(err, RelayError::AllEndpointsExhausted));
    assert_eq!(mock.attempts(), vec!["a", "b"]);
    assert!(coordinator.active_endpoint().is_none());
}

#[tokio::test]
async fn explicit_failover_excludes_the_failed_endpoint_for_the_cycle() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    let config = test_config(
        vec![ws_endpoint("primary", 1), ws_endpoint("secondary", 2)],
        BackupChannels::none(),
    );
    let (mut coordinator, mut events) = build_coordinator(config, registry_with(mock.clone()));

    coordinator.connect(&[]).await.unwrap();
    coordinator.failover("test-induced").await;

    // Primary is skipped even though it would still accept
    assert_eq!(coordinator.active_endpoint().as_deref(), Some("secondary"));
    assert_eq!(mock.attempts(), vec!["primary", "secondary"]);

    let trace = events_until(&mut events, |e| {
        matches!(e, RelayEvent::FailoverCompleted { .. })
    })
    .await;
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::FailoverStarted { from } if from == "primary")));
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::FailoverCompleted { to } if to == "secondary")));
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_fails_over_exactly_once() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    let config = test_config(
        vec![ws_endpoint("primary", 1), ws_endpoint("secondary", 2)],
        BackupChannels::none(),
    );
    let manager = RelayManager::with_registry(config, registry_with(mock.clone())).unwrap();
    let mut events = manager.subscribe();

    let trace = events_until(&mut events, |e| matches!(e, RelayEvent::Connected { .. })).await;
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::Connected { endpoint_id } if endpoint_id == "primary")));

    // The peer vanishes without a close handshake
    mock.inject(
        "primary",
        LinkEvent::Closed {
            code: 1006,
            reason: "connection reset".to_string(),
        },
    )
    .await;

    let trace = events_until(&mut events, |e| {
        matches!(e, RelayEvent::FailoverCompleted { .. })
    })
    .await;
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::FailoverStarted { from } if from == "primary")));
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::FailoverCompleted { to } if to == "secondary")));

    let status = manager.status();
    assert!(status.is_connected);
    assert_eq!(status.active_connection_id.as_deref(), Some("secondary"));
    assert_eq!(status.failover_count, 1);

    // The per-endpoint records reflect the hand-off
    let connections = manager.connections();
    let primary = connections
        .iter()
        .find(|c| c.endpoint_id == "primary")
        .unwrap();
    assert_eq!(primary.status, ConnectionStatus::Failed);
    let secondary = connections
        .iter()
        .find(|c| c.endpoint_id == "secondary")
        .unwrap();
    assert_eq!(secondary.status, ConnectionStatus::Connected);

    manager.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_fails_over_exactly_once() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    // Primary accepts the connection but never answers a ping
    mock.silence("primary");

    let config = test_config(
        vec![ws_endpoint("primary", 1), ws_endpoint("secondary", 2)],
        BackupChannels::none(),
    );
    let failover_threshold_ms = config.failover_threshold_ms;
    let manager = RelayManager::with_registry(config, registry_with(mock.clone())).unwrap();
    let mut events = manager.subscribe();
    events_until(&mut events, |e| {
        matches!(e, RelayEvent::Connected { endpoint_id } if endpoint_id == "primary")
    })
    .await;
    let started = manager.status().uptime_ms;

    let trace = events_until(&mut events, |e| {
        matches!(e, RelayEvent::FailoverCompleted { .. })
    })
    .await;
    let starts = trace
        .iter()
        .filter(|e| matches!(e, RelayEvent::FailoverStarted { .. }))
        .count();
    assert_eq!(starts, 1);
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::FailoverStarted { from } if from == "primary")));
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::FailoverCompleted { to } if to == "secondary")));
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::AlertRaised(a) if a.kind == AlertKind::FailoverActivated)));

    let status = manager.status();
    assert_eq!(status.failover_count, 1);
    assert_eq!(status.active_connection_id.as_deref(), Some("secondary"));
    // The switch cannot have happened before the heartbeat deadline
    assert!(status.uptime_ms - started > failover_threshold_ms);

    let connections = manager.connections();
    let primary = connections
        .iter()
        .find(|c| c.endpoint_id == "primary")
        .unwrap();
    assert_eq!(primary.status, ConnectionStatus::Failed);

    manager.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_reach_subscribers_once() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    let config = test_config(vec![ws_endpoint("primary", 1)], BackupChannels::none());
    let manager = RelayManager::with_registry(config, registry_with(mock.clone())).unwrap();
    let mut events = manager.subscribe();
    events_until(&mut events, |e| matches!(e, RelayEvent::Connected { .. })).await;

    let envelope = Envelope::event(json!({"price": 42}), 1_000);
    mock.inject("primary", LinkEvent::Message(envelope.clone()))
        .await;
    // Replay duplicate: must be dropped by the dedupe window
    mock.inject("primary", LinkEvent::Message(envelope.clone()))
        .await;
    let other = Envelope::event(json!({"price": 43}), 1_001);
    mock.inject("primary", LinkEvent::Message(other.clone())).await;

    let trace = events_until(&mut events, |e| {
        matches!(e, RelayEvent::Message(env) if env.id == other.id)
    })
    .await;
    let delivered: Vec<_> = trace
        .iter()
        .filter(|e| matches!(e, RelayEvent::Message(env) if env.id == envelope.id))
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(manager.status().message_count, 2);

    manager.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn channel_fails_without_backup_and_recovers_on_manual_reconnect() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    mock.refuse("primary");

    let config = test_config(vec![ws_endpoint("primary", 1)], BackupChannels::none());
    let manager = RelayManager::with_registry(config, registry_with(mock.clone())).unwrap();
    // No connection attempt has started yet
    assert!(manager.health_metrics().is_none());
    let mut events = manager.subscribe();

    let trace = events_until(&mut events, |e| matches!(e, RelayEvent::ChannelFailed)).await;
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::AlertRaised(a) if a.severity == relay_core::AlertSeverity::Critical)));
    assert_eq!(manager.health_metrics().unwrap().status, HealthStatus::Failed);
    assert!(!manager.send(Envelope::event(json!({}), 1)));

    // Failed is terminal until an explicit reconnect
    mock.allow("primary");
    assert!(manager.reconnect());
    events_until(&mut events, |e| {
        matches!(e, RelayEvent::Connected { endpoint_id } if endpoint_id == "primary")
    })
    .await;
    assert!(manager.status().is_connected);
    assert_ne!(manager.health_metrics().unwrap().status, HealthStatus::Failed);

    manager.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn destroy_is_idempotent_and_final() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    let config = test_config(vec![ws_endpoint("primary", 1)], BackupChannels::none());
    let manager = RelayManager::with_registry(config, registry_with(mock.clone())).unwrap();
    let mut events = manager.subscribe();
    events_until(&mut events, |e| matches!(e, RelayEvent::Connected { .. })).await;

    manager.destroy().await;
    manager.destroy().await;

    assert!(!manager.send(Envelope::event(json!({}), 1)));
    assert!(!manager.reconnect());
    assert!(!manager.status().is_connected);
}

// Endpoint sorting itself is part of the contract the scan relies on
#[test]
fn endpoint_ordering_is_priority_then_id() {
    let mut endpoints = vec![
        Endpoint::new("b", "wss://b.test", EndpointKind::WebSocket, 2),
        Endpoint::new("a2", "wss://a2.test", EndpointKind::WebSocket, 1),
        Endpoint::new("a1", "wss://a1.test", EndpointKind::WebSocket, 1),
    ];
    endpoints.sort();
    let ids: Vec<&str> = endpoints.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2", "b"]);
}
