//! E2E tests for correlated commands:
//! DeviceClient → Correlator → Session → MockBroker → simulated device → reply.

mod helpers;

use helpers::TestHarness;
use nl_monitor::client::CommandError;
use nl_mqtt_channel::QoS;
use nl_protocol::commands::DhwMode;

/// Status request resolves to a decoded sample with the device's charge.
#[tokio::test]
async fn e2e_status_roundtrip() {
    let h = TestHarness::connected().await;

    let sample = h.client.get_status().await.unwrap();
    assert_eq!(sample.dhw_charge_per, 42);
    assert_eq!(sample.wifi_rssi, -48);
    assert_eq!(sample.operation_mode.to_string(), "heat_pump_active");
    // Raw 100 plus the 20 °F calibration offset.
    assert_eq!(sample.dhw_target_temperature_setting, 120.0);

    let commands = h.device.state().commands;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].request_topic, "cmd/52/navilink-04786332fca0/st");
    assert_eq!(commands[0].response_topic, "cmd/52/1021/4471/e2e-client/res/st");
    assert_eq!(commands[0].request.additional_value, "5322");
    assert_eq!(h.correlator.pending_count(), 0);

    let published = h.broker.published_to("cmd/52/navilink-04786332fca0/st");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].qos, QoS::AtLeastOnce);
}

/// Concurrent commands each get their own reply.
#[tokio::test]
async fn e2e_concurrent_commands_are_correlated() {
    let h = TestHarness::connected().await;

    let (status, reservations, info) = tokio::join!(
        h.client.get_status(),
        h.client.get_reservations(),
        h.client.get_device_info(),
    );
    assert_eq!(status.unwrap().dhw_charge_per, 42);
    let reservations = reservations.unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].id.as_deref(), Some("morning"));
    assert_eq!(info.unwrap()["channelInfo"]["channelNumber"], 1);

    let session_ids: std::collections::HashSet<_> = h
        .device
        .state()
        .commands
        .into_iter()
        .map(|c| c.session_id)
        .collect();
    assert_eq!(session_ids.len(), 3);
}

/// Control commands change device state visible in the next status.
#[tokio::test]
async fn e2e_set_temperature_then_read_back() {
    let h = TestHarness::connected().await;

    h.client.set_dhw_temperature(130).await.unwrap();
    assert_eq!(h.device.state().target_raw, 110);

    let control = h.device.state().commands.pop().unwrap();
    assert_eq!(control.request_topic, "cmd/52/navilink-04786332fca0/ctrl");
    assert_eq!(control.response_topic, "cmd/52/1021/4471/e2e-client/res");

    let sample = h.client.get_status().await.unwrap();
    assert_eq!(sample.dhw_target_temperature_setting, 130.0);
    assert_eq!(h.client.last_sample().unwrap().dhw_target_temperature_setting, 130.0);
}

#[tokio::test]
async fn e2e_turn_off_and_on() {
    let h = TestHarness::connected().await;

    h.client.turn_off().await.unwrap();
    assert_eq!(h.device.state().dhw_mode, DhwMode::EnergySaver.code());

    h.client.turn_on().await.unwrap();
    assert_eq!(h.device.state().dhw_mode, DhwMode::Hybrid.code());

    h.client.set_dhw_mode(DhwMode::HighDemand).await.unwrap();
    assert_eq!(h.device.state().dhw_mode, 6);
}

/// Out-of-range values never reach the broker.
#[tokio::test]
async fn e2e_invalid_parameters_rejected_locally() {
    let h = TestHarness::connected().await;

    let err = h.client.set_dhw_temperature(200).await.unwrap_err();
    assert!(matches!(err, CommandError::InvalidParameter(_)));
    let err = h.client.set_dhw_mode_code(1).await.unwrap_err();
    assert!(matches!(err, CommandError::InvalidParameter(_)));

    assert!(h.device.state().commands.is_empty());
    assert!(h.broker.published_to("cmd/52/navilink-04786332fca0/ctrl").is_empty());
}

/// Subscriptions cover the device-wide and client-session reply topics.
#[tokio::test]
async fn e2e_reply_topics_subscribed() {
    let h = TestHarness::connected().await;

    let filters: Vec<String> = h.broker.subscriptions().into_iter().map(|(f, _)| f).collect();
    assert!(filters.contains(&"cmd/52/navilink-04786332fca0/res".to_string()));
    assert!(filters.contains(&"cmd/52/1021/4471/e2e-client/res".to_string()));
    assert!(filters.contains(&"cmd/52/1021/4471/e2e-client/res/#".to_string()));
    assert_eq!(h.session.subscriptions().len(), 3);
}
