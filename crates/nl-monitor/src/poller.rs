//! Periodic telemetry polling.
//!
//! The poller publishes a fire-and-forget status request on its own timer
//! and decodes whatever status pushes come back. It never waits for a
//! reply to its polls; the correlator is only used for the initial
//! channel-info request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use nl_mqtt_channel::{
    Channel, Correlator, InboundMessage, IncomingMessage, MqttError, MqttResult, QoS, classify,
    publish_json,
};
use nl_protocol::commands::{CommandRequest, StatusPoll};
use nl_protocol::telemetry::{StatusDecoder, TelemetrySample};
use nl_protocol::topics;

/// Receives every decoded status sample.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn on_sample(&self, sample: TelemetrySample);
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("polling stopped after {failures} consecutive failures: {last_error}")]
    TooManyFailures { failures: u32, last_error: MqttError },

    #[error("poller task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_errors: u32,
    /// First retry delay after a failed poll; doubles per failure.
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
    /// Deadline for the channel-info request sent on start.
    pub info_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_errors: 10,
            error_backoff_base: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(60),
            info_timeout: Duration::from_secs(10),
        }
    }
}

impl PollerConfig {
    /// `min(base * 2^min(failures, 5), max)`
    pub fn error_delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(5);
        self.error_backoff_base
            .saturating_mul(factor)
            .min(self.error_backoff_max)
    }
}

/// Consecutive-failure bookkeeping for the poll loop.
#[derive(Debug, Default)]
struct FailureTracker {
    consecutive: u32,
}

impl FailureTracker {
    fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Count a failure. Returns the delay before the next attempt, or
    /// `None` once `max_errors` is reached.
    fn failure(&mut self, config: &PollerConfig) -> Option<Duration> {
        self.consecutive += 1;
        if self.consecutive >= config.max_errors {
            None
        } else {
            Some(config.error_delay(self.consecutive))
        }
    }
}

/// Status poller for one device.
pub struct Poller<C: Channel + ?Sized> {
    correlator: Arc<Correlator<C>>,
    decoder: StatusDecoder,
    config: PollerConfig,
    sink: Arc<dyn TelemetrySink>,
}

impl<C: Channel + ?Sized + 'static> Poller<C> {
    pub fn new(
        correlator: Arc<Correlator<C>>,
        decoder: StatusDecoder,
        config: PollerConfig,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            correlator,
            decoder,
            config,
            sink,
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Publish one QoS 0 status request.
    pub async fn poll_once(&self) -> MqttResult<()> {
        let device = self.correlator.device();
        let channel = self.correlator.channel();
        let topic = topics::status_poll(device.device_type, &device.mac_address);
        let poll = StatusPoll::new(device, channel.client_id());
        publish_json(&**channel, &topic, &poll, QoS::AtMostOnce).await?;
        tracing::debug!(session_id = %poll.session_id, topic = %topic, "status poll sent");
        Ok(())
    }

    /// Decode a status push and hand it to the sink.
    ///
    /// Returns `true` if a sample was delivered.
    pub async fn handle_message(&self, message: &InboundMessage) -> bool {
        let IncomingMessage::Status { envelope, .. } = classify(message) else {
            return false;
        };
        match self.decoder.decode(&envelope.response) {
            Ok(sample) => {
                self.sink.on_sample(sample).await;
                true
            }
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "undecodable status push");
                false
            }
        }
    }

    /// Spawn the poll loop.
    ///
    /// `messages` should come from the same session the correlator
    /// publishes through.
    pub fn start(self: Arc<Self>, messages: broadcast::Receiver<InboundMessage>) -> PollerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(messages, stop_rx).await });
        PollerHandle {
            stop: stop_tx,
            task: Some(task),
        }
    }

    async fn run(
        &self,
        mut messages: broadcast::Receiver<InboundMessage>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), PollerError> {
        let info_request = CommandRequest::get_device_info();
        tokio::select! {
            result = self
                .correlator
                .send(&info_request, self.config.info_timeout) =>
            {
                match result {
                    Ok(_) => tracing::info!("initial channel info received"),
                    Err(e) => tracing::warn!(error = %e, "initial channel info request failed"),
                }
            }
            _ = stop.changed() => return Ok(()),
        }

        tracing::info!(interval = ?self.config.interval, "poller started");
        let mut failures = FailureTracker::default();
        let mut next_poll = Instant::now();
        let mut listening = true;

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    tracing::info!("poller stopped");
                    return Ok(());
                }
                () = time::sleep_until(next_poll) => match self.poll_once().await {
                    Ok(()) => {
                        failures.success();
                        next_poll = Instant::now() + self.config.interval;
                    }
                    Err(e) => {
                        let Some(delay) = failures.failure(&self.config) else {
                            tracing::error!(
                                failures = failures.consecutive,
                                error = %e,
                                "too many consecutive poll failures, giving up"
                            );
                            return Err(PollerError::TooManyFailures {
                                failures: failures.consecutive,
                                last_error: e,
                            });
                        };
                        tracing::warn!(
                            failures = failures.consecutive,
                            retry_in = ?delay,
                            error = %e,
                            "status poll failed"
                        );
                        next_poll = Instant::now() + delay;
                    }
                },
                received = messages.recv(), if listening => match received {
                    Ok(message) => {
                        self.handle_message(&message).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "poller lagged behind inbound messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("inbound message channel closed");
                        listening = false;
                    }
                },
            }
        }
    }
}

/// Handle to a running poller. Dropping it stops the loop.
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), PollerError>>>,
}

impl PollerHandle {
    /// Ask the loop to exit. Interrupts any pending wait.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Wait for the loop to exit. Cancel safe; once the exit result has
    /// been returned, later calls return `Ok(())`.
    pub async fn join(&mut self) -> Result<(), PollerError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(PollerError::Task(e.to_string())),
        };
        self.task = None;
        result
    }
}
