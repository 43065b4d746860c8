//! NaviLink monitor: keeps an MQTT session with the NaviLink gateway,
//! polls one water heater and logs every status sample.

use std::sync::Arc;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use nl_monitor::client::DeviceClient;
use nl_monitor::config::MonitorConfig;
use nl_monitor::poller::{Poller, TelemetrySink};
use nl_mqtt_channel::{
    ConnectionState, Correlator, Session, StaticCredentials, WebSocketConnector,
};
use nl_protocol::telemetry::{StatusDecoder, TelemetrySample};

/// Writes each sample to the structured log.
struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn on_sample(&self, sample: TelemetrySample) {
        tracing::info!(
            charge = sample.dhw_charge_per,
            dhw_temperature = sample.dhw_temperature,
            target = sample.dhw_target_temperature_setting,
            ambient = sample.ambient_temperature,
            power_w = sample.current_inst_power,
            mode = %sample.operation_mode,
            compressor = sample.compressor.as_str(),
            error_code = sample.error_code,
            "telemetry"
        );
        if sample.has_error() {
            tracing::warn!(
                error_code = sample.error_code,
                sub_error_code = sample.sub_error_code,
                "device reports an error"
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "nl-monitor starting");

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/navilink/monitor.toml".to_string());

    let config = MonitorConfig::from_file(&config_path)?;
    let decoder = StatusDecoder::new(config.mode_table()?);
    tracing::info!(
        mac_address = %config.device.mac_address,
        device_type = config.device.device_type,
        endpoint = %config.mqtt.endpoint,
        "config loaded"
    );

    // ── MQTT session ────────────────────────────────────────────
    let session = Arc::new(Session::new(
        config.mqtt.session_config(),
        Arc::new(WebSocketConnector::new()),
        Arc::new(StaticCredentials::new((&config.credentials).into())),
    ));
    let correlator = Arc::new(Correlator::new(session.clone(), config.device.clone()));

    // Receivers are taken before connecting so no early reply is missed.
    let correlator_task = {
        let correlator = correlator.clone();
        let messages = session.messages();
        let state = session.watch_state();
        tokio::spawn(async move { correlator.run(messages, state).await })
    };
    let poller_messages = session.messages();

    session.connect().await?;
    correlator.subscribe().await?;
    tracing::info!(subscriptions = session.subscriptions().len(), "MQTT subscriptions active");

    // ── Initial status ──────────────────────────────────────────
    let client = DeviceClient::new(correlator.clone(), decoder.clone(), config.command_timeout());
    match client.get_status().await {
        Ok(sample) => LogSink.on_sample(sample).await,
        Err(e) => tracing::warn!(error = %e, "initial status request failed"),
    }

    // ── Poller ──────────────────────────────────────────────────
    let poller = Arc::new(Poller::new(
        correlator.clone(),
        decoder,
        config.poller_config(),
        Arc::new(LogSink),
    ));
    let mut poller_handle = poller.start(poller_messages);
    let mut state = session.watch_state();

    tracing::info!("nl-monitor ready");

    tokio::select! {
        result = poller_handle.join() => match result {
            Ok(()) => tracing::error!("poller exited unexpectedly"),
            Err(e) => tracing::error!(error = %e, "poller gave up"),
        },
        _ = state.wait_for(|s| *s == ConnectionState::Failed) => {
            tracing::error!("MQTT session failed, reconnection exhausted");
        }
        // Graceful shutdown on SIGINT
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    poller_handle.stop();
    if let Err(e) = poller_handle.join().await {
        tracing::warn!(error = %e, "poller stopped with error");
    }
    session.disconnect().await;
    // The dispatch loop may not have seen Disconnected yet.
    correlator.fail_all();
    correlator_task.abort();

    let stats = session.statistics();
    tracing::info!(
        messages_sent = stats.messages_sent,
        messages_received = stats.messages_received,
        reconnections = stats.reconnection_count,
        "nl-monitor stopped"
    );
    Ok(())
}
