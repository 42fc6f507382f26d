//! Socket frames reaching application code through the runtime.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fleet_services::event_bus::AppEvent;
use fleet_services::runtime::Storage;
use fleet_socket::{ConnectionState, FrameKind};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn critical_alert_raises_notification() {
    let h = common::harness(Storage::memory()).await;
    let mut events = h.runtime.events().subscribe();
    h.runtime.login(common::credential()).await.unwrap();
    let server = h.ws.next_server().await;
    common::wait_for_state(&h.runtime, ConnectionState::Connected).await;

    server.send(json!({"type": "fleet_alert", "payload": {"severity": "info", "title": "Fuel low"}}));
    server.send(json!({
        "type": "fleet_alert",
        "payload": {"severity": "critical", "title": "Collision detected", "vehicleId": "TRK-7"}
    }));

    let event = common::wait_for_event(&mut events, |e| matches!(e, AppEvent::CriticalAlert { .. })).await;
    let AppEvent::CriticalAlert { alert } = event else {
        unreachable!()
    };
    assert_eq!(alert.vehicle_id.as_deref(), Some("TRK-7"));
    assert_eq!(*h.notifier.shown.lock().unwrap(), vec!["Collision detected".to_string()]);

    h.runtime.shutdown().await;
    assert_eq!(
        h.runtime.connection().dispatcher().handler_count(&FrameKind::FleetAlert),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn app_handlers_receive_vehicle_updates_after_reconnect() {
    let h = common::harness(Storage::memory()).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    h.runtime
        .connection()
        .dispatcher()
        .on(FrameKind::VehicleUpdate, move |frame| {
            assert!(frame.as_vehicle_update().is_some());
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    h.runtime.login(common::credential()).await.unwrap();
    let first = h.ws.next_server().await;
    common::wait_for_state(&h.runtime, ConnectionState::Connected).await;
    first.close(1006);

    let second = h.ws.next_server().await;
    common::wait_for_state(&h.runtime, ConnectionState::Connected).await;
    assert_eq!(
        second.received_frames()[1],
        json!({"type": "subscribe", "topics": ["alerts", "vehicles"]})
    );
    second.send(json!({"type": "vehicle_update", "payload": {"vehicleId": "TRK-1", "speed": 40.0}}));
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    h.runtime.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn state_changes_reach_event_bus() {
    let h = common::harness(Storage::memory()).await;
    let mut events = h.runtime.events().subscribe();
    h.runtime.login(common::credential()).await.unwrap();
    let server = h.ws.next_server().await;

    common::wait_for_event(&mut events, |e| {
        matches!(e, AppEvent::ConnectionStateChanged { state: ConnectionState::Connected })
    })
    .await;

    server.close(1006);
    common::wait_for_event(&mut events, |e| {
        matches!(e, AppEvent::ConnectionStateChanged { state: ConnectionState::Reconnecting })
    })
    .await;

    h.runtime.shutdown().await;
}
