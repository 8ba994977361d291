//! Backup activation, queueing, replay and durable recovery

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use relay_core::{BackupChannels, EndpointKind, Envelope, RelayConfig};
use relay_transport::backup::BackupPool;
use relay_transport::{LinkEvent, RelayEvent, RelayManager};

use common::{events_until, registry_with, temp_path, test_config, ws_endpoint, MockTransport};

fn flat_log_only(path: std::path::PathBuf) -> BackupChannels {
    BackupChannels {
        push_stream_address: None,
        poll_address: None,
        flat_log_path: Some(path),
        sqlite_path: None,
    }
}

#[tokio::test(start_paused = true)]
async fn send_queues_to_backup_and_replays_after_recovery() {
    let log_path = temp_path("replay.log");
    let mock = MockTransport::new(EndpointKind::WebSocket);
    let config = test_config(
        vec![ws_endpoint("primary", 1)],
        flat_log_only(log_path.clone()),
    );
    let manager = RelayManager::with_registry(config, registry_with(mock.clone())).unwrap();
    let mut events = manager.subscribe();
    events_until(&mut events, |e| matches!(e, RelayEvent::Connected { .. })).await;

    // Connected: send goes straight over the link
    let live = Envelope::event(json!({"seq": 1}), 1_000);
    assert!(manager.send(live.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(mock.sent("primary").iter().any(|e| e.id == live.id));

    // Primary dies and stays dead: the pool activates the flat log
    mock.refuse("primary");
    mock.inject(
        "primary",
        LinkEvent::Closed {
            code: 1006,
            reason: "connection reset".to_string(),
        },
    )
    .await;
    let trace = events_until(&mut events, |e| {
        matches!(e, RelayEvent::BackupActivated { .. })
    })
    .await;
    assert!(trace
        .iter()
        .any(|e| matches!(e, RelayEvent::BackupActivated { service_id } if service_id == "backup-log")));

    let queued = Envelope::event(json!({"seq": 2}), 2_000);
    assert!(manager.send(queued.clone()));
    assert_eq!(manager.backup_queue_len(), 1);
    assert!(manager.status().backup_active);
    assert!(!manager.status().is_connected);

    // Primary comes back: manual reconnect replays the queue and
    // releases the backup service
    mock.allow("primary");
    assert!(manager.reconnect());
    events_until(&mut events, |e| matches!(e, RelayEvent::BackupDeactivated)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(mock.sent("primary").iter().any(|e| e.id == queued.id));
    assert_eq!(manager.backup_queue_len(), 0);
    assert!(!manager.status().backup_active);
    assert!(manager.status().is_connected);

    manager.destroy().await;
    let _ = std::fs::remove_file(&log_path);
}

#[tokio::test(start_paused = true)]
async fn send_returns_false_when_no_path_exists() {
    let mock = MockTransport::new(EndpointKind::WebSocket);
    mock.refuse("primary");
    let config = test_config(vec![ws_endpoint("primary", 1)], BackupChannels::none());
    let manager = RelayManager::with_registry(config, registry_with(mock)).unwrap();
    let mut events = manager.subscribe();
    events_until(&mut events, |e| matches!(e, RelayEvent::ChannelFailed)).await;

    // No link, no backup: the envelope is dropped and the caller told so
    assert!(!manager.send(Envelope::event(json!({}), 1)));
    assert_eq!(manager.backup_queue_len(), 0);

    manager.destroy().await;
}

#[tokio::test]
async fn durable_backup_recovers_queue_contents_after_restart() {
    let log_path = temp_path("restart.log");
    let config = RelayConfig {
        endpoints: vec![ws_endpoint("primary", 1)],
        backup: flat_log_only(log_path.clone()),
        ..RelayConfig::default()
    };

    let first = Envelope::event(json!({"seq": 1}), 1_000);
    let second = Envelope::event(json!({"seq": 2}), 2_000);
    {
        let pool = BackupPool::from_config(&config).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        pool.activate(tx).await.unwrap();
        assert!(pool.enqueue(first.clone()));
        assert!(pool.enqueue(second.clone()));
        // Interval sync flushes the queue down to the store
        pool.sync().await;
        assert_eq!(pool.queue_len(), 0);
        pool.deactivate().await;
    }

    // A fresh session recovers the persisted envelopes, oldest first
    let pool = BackupPool::from_config(&config).unwrap();
    let (tx, _rx) = mpsc::channel(8);
    pool.activate(tx).await.unwrap();
    assert_eq!(pool.queue_len(), 2);
    let recovered = pool.drain();
    assert_eq!(recovered[0].id, first.id);
    assert_eq!(recovered[1].id, second.id);

    let _ = std::fs::remove_file(&log_path);
}

#[tokio::test(start_paused = true)]
async fn interval_sync_persists_the_queue_while_on_backup() {
    let log_path = temp_path("sync.log");
    let mock = MockTransport::new(EndpointKind::WebSocket);
    mock.refuse("primary");
    let config = test_config(
        vec![ws_endpoint("primary", 1)],
        flat_log_only(log_path.clone()),
    );
    let manager = RelayManager::with_registry(config, registry_with(mock)).unwrap();
    let mut events = manager.subscribe();
    events_until(&mut events, |e| {
        matches!(e, RelayEvent::BackupActivated { .. })
    })
    .await;

    let envelope = Envelope::event(json!({"seq": 1}), 1_000);
    assert!(manager.send(envelope.clone()));
    assert_eq!(manager.backup_queue_len(), 1);

    // Let the sync interval elapse; the queue drains into the store
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(manager.backup_queue_len(), 0);
    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.contains(&envelope.id));

    manager.destroy().await;
    let _ = std::fs::remove_file(&log_path);
}
