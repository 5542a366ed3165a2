//! End-to-end scenarios over the full gateway core.

use super::common::{wait_for_event, Gateway, FULL_CAPS, MPU_CAPS, POLL_INTERVAL};
use gateway_common::events::GatewayEvent;
use gateway_common::types::{AlertCode, Quality, SensorKind};
use gateway_device::normalize::encode;
use gateway_modbus::registers::{holding, input};
use gateway_modbus::sim::SimBehavior;
use std::time::{Duration, Instant};

// ============================================================================
// Scenario: discovery of two slaves
// ============================================================================

#[tokio::test]
async fn test_discovery_of_two_slaves() {
    let gateway = Gateway::launch(&[(2, MPU_CAPS), (16, FULL_CAPS)]);
    let mut events = gateway.events.subscribe();

    let found = gateway.manager.discover(1..=20).await.expect("discover");
    assert_eq!(
        found.iter().map(|d| d.unit_id).collect::<Vec<_>>(),
        vec![2, 16]
    );
    for device in &found {
        assert_ne!(device.vendor_code, 0);
        assert_ne!(device.fw_version, 0);
    }

    // Two device rows, one sensor row per implied channel.
    assert_eq!(gateway.store.get_devices().expect("rows").len(), 2);
    assert_eq!(gateway.store.get_sensors(2).expect("rows").len(), 9);
    assert_eq!(gateway.store.get_sensors(16).expect("rows").len(), 12);

    // Both units came online.
    let mut online = Vec::new();
    for _ in 0..2 {
        if let Some(GatewayEvent::DeviceOnline { unit_id, .. }) =
            wait_for_event(&mut events, Duration::from_secs(1), |e| {
                matches!(e, GatewayEvent::DeviceOnline { .. })
            })
            .await
        {
            online.push(unit_id);
        }
    }
    online.sort_unstable();
    assert_eq!(online, vec![2, 16]);

    // Running the same scan again yields the same set, no duplicates.
    let again = gateway.manager.discover(1..=20).await.expect("discover");
    assert_eq!(again.len(), 2);
    assert_eq!(gateway.store.get_devices().expect("rows").len(), 2);
    assert_eq!(gateway.store.get_sensors(16).expect("rows").len(), 12);
}

// ============================================================================
// Scenario: alias write round-trip
// ============================================================================

#[tokio::test]
async fn test_alias_write_round_trip() {
    let gateway = Gateway::launch(&[(2, MPU_CAPS)]);
    gateway.manager.discover(1..=5).await.expect("discover");

    gateway
        .manager
        .set_alias(2, "Sensor-A")
        .await
        .expect("set alias");

    // Wire layout on the slave: length 8 at 0x0030, then four packed
    // words, then the EEPROM save magic accepted.
    assert_eq!(gateway.slave_holding(2, holding::ALIAS_LEN), 8);
    assert_eq!(gateway.slave_holding(2, holding::ALIAS_DATA), 0x5365);
    assert_eq!(gateway.slave_holding(2, holding::ALIAS_DATA + 1), 0x6E73);
    assert_eq!(gateway.slave_holding(2, holding::ALIAS_DATA + 2), 0x6F72);
    assert_eq!(gateway.slave_holding(2, holding::ALIAS_DATA + 3), 0x2D41);

    // The cache serves the new alias immediately.
    assert_eq!(
        gateway.manager.registry().get(2).expect("device").alias,
        "Sensor-A"
    );

    // And a fresh identity read returns it from the device itself.
    let found = gateway.manager.discover(2..=2).await.expect("discover");
    assert_eq!(found[0].alias, "Sensor-A");
}

// ============================================================================
// Scenario: threshold exceed and auto-resolve
// ============================================================================

#[tokio::test]
async fn test_threshold_exceed_and_auto_resolve() {
    let gateway = Gateway::launch(&[(2, MPU_CAPS)]);
    gateway.manager.discover(1..=5).await.expect("discover");

    // Tilt X starts beyond the default 5.0 deg threshold.
    gateway.set_input(2, input::ANGLE_X, encode(SensorKind::TiltX, 6.2));

    let mut events = gateway.events.subscribe();
    gateway
        .poller
        .start(vec![2], None)
        .await
        .expect("polling start");

    let event = wait_for_event(&mut events, Duration::from_secs(2), |e| {
        matches!(e, GatewayEvent::NewAlert { .. })
    })
    .await
    .expect("new_alert event");
    let GatewayEvent::NewAlert { alert } = event else {
        unreachable!()
    };
    assert_eq!(alert.code, AlertCode::ThresholdExceededHi);
    assert_eq!(alert.sensor_id.as_deref(), Some("UNIT_2_TILT_X"));
    assert!(!alert.ack);

    // The breaching measurement was persisted with ALARM quality.
    let rows = gateway
        .store
        .get_measurements("UNIT_2_TILT_X", None, None, 5)
        .expect("measurements");
    assert!(rows.iter().any(|m| m.quality == Quality::Alarm));

    // The tilt settles back inside the thresholds.
    gateway.set_input(2, input::ANGLE_X, encode(SensorKind::TiltX, 3.1));

    let event = wait_for_event(&mut events, Duration::from_secs(2), |e| {
        matches!(e, GatewayEvent::AlertAcknowledged { id, .. } if *id == alert.id)
    })
    .await
    .expect("alert_acknowledged event");
    let GatewayEvent::AlertAcknowledged { auto, reason, .. } = event else {
        unreachable!()
    };
    assert!(auto);
    assert!(reason.contains("normalized"));

    let row = gateway
        .store
        .get_alert(alert.id)
        .expect("query")
        .expect("row");
    assert!(row.ack);
    assert!(row.ack_reason.expect("reason").contains("normalized"));
}

// ============================================================================
// Scenario: device offline deadline
// ============================================================================

#[tokio::test]
async fn test_device_offline_deadline_and_recovery() {
    let gateway = Gateway::launch(&[(2, MPU_CAPS), (16, MPU_CAPS)]);
    gateway.manager.discover(1..=20).await.expect("discover");

    let mut events = gateway.events.subscribe();
    gateway
        .poller
        .start(vec![2, 16], None)
        .await
        .expect("polling start");

    // Unit 16 stops answering entirely.
    gateway.set_behavior(16, SimBehavior::Mute);

    // Connectivity transition after three consecutive failures...
    let offline = wait_for_event(&mut events, Duration::from_secs(3), |e| {
        matches!(e, GatewayEvent::DeviceOffline { unit_id: 16, .. })
    })
    .await;
    assert!(offline.is_some(), "expected device_offline transition");

    // ...and an offline alert once the deadline has passed.
    let event = wait_for_event(&mut events, Duration::from_secs(3), |e| {
        matches!(
            e,
            GatewayEvent::NewAlert { alert } if alert.code == AlertCode::DeviceOffline
        )
    })
    .await
    .expect("offline alert");
    let GatewayEvent::NewAlert { alert } = event else {
        unreachable!()
    };
    assert_eq!(alert.rig_id.as_deref(), Some("UNIT_16"));

    // The slave comes back; the next successful poll resolves the alert.
    gateway.set_behavior(16, SimBehavior::Normal);

    let ack = wait_for_event(&mut events, Duration::from_secs(3), |e| {
        matches!(e, GatewayEvent::AlertAcknowledged { id, auto: true, .. } if *id == alert.id)
    })
    .await;
    assert!(ack.is_some(), "offline alert should auto-resolve");

    let online = wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, GatewayEvent::DeviceOnline { unit_id: 16, .. })
    })
    .await;
    // The online transition may have arrived before the acknowledgement;
    // either way the device must be back online by now.
    let device = gateway.manager.registry().get(16).expect("device");
    assert!(
        online.is_some() || device.status == gateway_common::types::DeviceStatus::Online
    );
}

// ============================================================================
// Scenario: operator command against a running polling loop
// ============================================================================

#[tokio::test]
async fn test_identify_interleaves_with_polling() {
    let gateway = Gateway::launch(&[(2, MPU_CAPS), (16, FULL_CAPS)]);
    gateway.manager.discover(1..=20).await.expect("discover");
    gateway
        .poller
        .start(vec![2, 16], None)
        .await
        .expect("polling start");

    // Let a few ticks run so the command truly contends with polling.
    tokio::time::sleep(POLL_INTERVAL * 3).await;

    let started = Instant::now();
    gateway.manager.identify(2, 5).await.expect("identify");
    let latency = started.elapsed();

    // Serialized between polling transactions: bounded by roughly one
    // poll interval plus one timeout budget.
    assert!(
        latency < POLL_INTERVAL * 4 + Duration::from_millis(100),
        "identify took {latency:?}"
    );
    assert_eq!(gateway.slave_holding(2, holding::IDENTIFY_SECONDS), 5);

    // Polling never stopped.
    let status = gateway.poller.status().await.expect("status");
    assert!(status.running);
    let stats = gateway.bus.stats();
    assert!(stats.rx_frames_ok > 0);
    assert_eq!(stats.crc_errors, 0);
}

// ============================================================================
// Scenario: polling continues across a stop/start cycle
// ============================================================================

#[tokio::test]
async fn test_polling_stop_start_cycle() {
    let gateway = Gateway::launch(&[(2, MPU_CAPS)]);
    gateway.manager.discover(1..=5).await.expect("discover");

    gateway.poller.start(vec![2], None).await.expect("start");
    tokio::time::sleep(POLL_INTERVAL * 4).await;
    gateway.poller.stop().await.expect("stop");

    let ticks_after_stop = gateway.poller.status().await.expect("status").ticks;
    tokio::time::sleep(POLL_INTERVAL * 4).await;
    assert_eq!(
        gateway.poller.status().await.expect("status").ticks,
        ticks_after_stop,
        "no ticks while stopped"
    );

    // Restart replaces the prior state and polls again.
    gateway
        .poller
        .start(vec![2], Some(Duration::from_millis(20)))
        .await
        .expect("restart");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gateway.poller.status().await.expect("status").ticks > 0);
}
