//! Shared test harness for E2E integration tests.
//!
//! Wires a real `Session`, `Correlator` and `DeviceClient` to the
//! in-memory `MockBroker`, with a simulated water heater answering
//! commands the way the gateway does.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time;

use nl_monitor::client::DeviceClient;
use nl_mqtt_channel::{
    BackoffConfig, ConnectionState, Correlator, Credentials, InboundMessage, MockBroker, Session,
    SessionConfig, SigningParams, StaticCredentials,
};
use nl_protocol::commands::{CommandEnvelope, StatusPoll};
use nl_protocol::device::DeviceInfo;
use nl_protocol::telemetry::StatusDecoder;
use nl_protocol::topics;

pub const CLIENT_ID: &str = "e2e-client";

pub fn sample_device() -> DeviceInfo {
    DeviceInfo {
        mac_address: "04786332fca0".into(),
        device_type: 52,
        additional_value: "5322".into(),
        home_group_id: "1021".into(),
        user_id: "4471".into(),
        controller_id: None,
    }
}

/// Mutable state of the simulated water heater.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub charge: i64,
    pub dhw_mode: i64,
    /// Raw (uncalibrated) target temperature.
    pub target_raw: i64,
    pub operation_mode: i64,
    /// Swallow every request without answering.
    pub silent: bool,
    pub commands: Vec<CommandEnvelope>,
    pub polls: Vec<StatusPoll>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            charge: 42,
            dhw_mode: 3,
            target_raw: 100,
            operation_mode: 32,
            silent: false,
            commands: Vec::new(),
            polls: Vec::new(),
        }
    }
}

/// A water heater behind the broker, answering on the reply topics.
#[derive(Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    pub fn state(&self) -> DeviceState {
        self.state.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut DeviceState)) {
        f(&mut self.state.lock().unwrap());
    }

    fn status_body(state: &DeviceState) -> Value {
        json!({
            "dhwChargePer": state.charge,
            "operationMode": state.operation_mode,
            "dhwOperationSetting": state.dhw_mode,
            "dhwTargetTemperatureSetting": state.target_raw,
            "dhwTemperature": state.target_raw - 2,
            "wifiRssi": -48,
        })
    }

    /// Handle one client publish and produce the device's replies.
    fn respond(&self, device: &DeviceInfo, message: &InboundMessage) -> Vec<InboundMessage> {
        let mut state = self.state.lock().unwrap();

        if message.topic == topics::status_poll(device.device_type, &device.mac_address) {
            let Ok(poll) = serde_json::from_slice::<StatusPoll>(&message.payload) else {
                return Vec::new();
            };
            state.polls.push(poll.clone());
            if state.silent {
                return Vec::new();
            }
            let push = json!({
                "sessionID": poll.session_id,
                "response": {"status": Self::status_body(&state)},
            });
            return vec![InboundMessage::new(
                topics::device_responses(device.device_type, &device.mac_address),
                serde_json::to_vec(&push).unwrap(),
            )];
        }

        let Ok(envelope) = serde_json::from_slice::<CommandEnvelope>(&message.payload) else {
            return Vec::new();
        };
        state.commands.push(envelope.clone());
        if state.silent {
            return Vec::new();
        }

        let request = &envelope.request;
        let response = match (request.mode.as_deref(), request.param.as_deref()) {
            (Some("dhw-temp-setting"), Some([temp])) => {
                state.target_raw = temp - 20;
                json!({"result": "ok"})
            }
            (Some("dhw-mode"), Some([mode])) => {
                state.dhw_mode = *mode;
                json!({"result": "ok"})
            }
            _ if envelope.request_topic.ends_with("/st") => {
                json!({"status": Self::status_body(&state)})
            }
            _ if envelope.request_topic.ends_with("/rsv/rd") => json!({
                "reservation": [
                    {"id": "morning", "startTime": "06:00", "temperature": 125, "enabled": true}
                ]
            }),
            _ if envelope.request_topic.ends_with("/status/start") => {
                json!({"channelInfo": {"channelNumber": 1, "unitCount": 1}})
            }
            _ => return Vec::new(),
        };
        let reply = json!({"sessionID": envelope.session_id, "response": response});
        vec![InboundMessage::new(
            envelope.response_topic.clone(),
            serde_json::to_vec(&reply).unwrap(),
        )]
    }
}

pub fn fast_config() -> SessionConfig {
    let mut config = SessionConfig::new(
        SigningParams::iot("broker.test", "us-east-1"),
        CLIENT_ID,
    );
    config.connect_timeout = Duration::from_secs(1);
    config.operation_timeout = Duration::from_millis(500);
    config.backoff = BackoffConfig {
        max_retries: 3,
        initial_delay_secs: 0.01,
        max_delay_secs: 0.05,
        multiplier: 2.0,
        jitter: false,
    };
    config
}

/// End-to-end test harness: session, correlator and device client on
/// top of a `MockBroker` with a simulated device.
pub struct TestHarness {
    pub broker: MockBroker,
    pub device: SimulatedDevice,
    pub session: Arc<Session>,
    pub correlator: Arc<Correlator<Session>>,
    pub client: Arc<DeviceClient<Session>>,
    correlator_task: JoinHandle<()>,
}

impl TestHarness {
    /// Build, connect and subscribe with a 1 s command timeout.
    pub async fn connected() -> Self {
        Self::connected_with(fast_config(), Duration::from_secs(1)).await
    }

    pub async fn connected_with(config: SessionConfig, command_timeout: Duration) -> Self {
        let broker = MockBroker::new();
        let device = SimulatedDevice::default();
        {
            let device = device.clone();
            let info = sample_device();
            broker.set_responder(move |message| device.respond(&info, message));
        }

        let session = Arc::new(Session::new(
            config,
            Arc::new(broker.clone()),
            Arc::new(StaticCredentials::new(Credentials::new(
                "AKIDEXAMPLE",
                "secret",
                "token",
            ))),
        ));
        let correlator = Arc::new(Correlator::new(session.clone(), sample_device()));
        let correlator_task = {
            let correlator = correlator.clone();
            let messages = session.messages();
            let state = session.watch_state();
            tokio::spawn(async move { correlator.run(messages, state).await })
        };

        session.connect().await.unwrap();
        correlator.subscribe().await.unwrap();

        let client = Arc::new(DeviceClient::new(
            correlator.clone(),
            StatusDecoder::default(),
            command_timeout,
        ));

        Self {
            broker,
            device,
            session,
            correlator,
            client,
            correlator_task,
        }
    }

    /// Stop the correlator's dispatch loop, as the binary does on shutdown.
    pub fn stop_correlator(&self) {
        self.correlator_task.abort();
    }

    pub async fn wait_for_state(&self, wanted: ConnectionState) {
        let mut rx = self.session.watch_state();
        time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
            .await
            .unwrap_or_else(|_| panic!("state never became {wanted}"))
            .unwrap();
    }

    /// Poll `condition` until it holds or two seconds pass.
    pub async fn eventually(&self, mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.correlator_task.abort();
    }
}
