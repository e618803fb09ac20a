use crate::config::{Config, ConnectionPolicy};
use crate::errors::{Error, Result};
use crate::metrics::{PUBLISHED_TOTAL, PUBLISH_FAILURES_TOTAL, SAMPLES_TOTAL};
use crate::session::{Session, SessionEvent, SessionState};
use crate::telemetry::Telemetry;
use chrono::Utc;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Counters for one run of the publishing loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub attempted: u64,
    pub sent: u64,
    pub failed: u64,
    pub acknowledged: u64,
}

pub struct Publisher<S, R> {
    config: Config,
    session: S,
    events: mpsc::Receiver<SessionEvent>,
    events_open: bool,
    rng: R,
    state: SessionState,
    stats: LoopStats,
}

impl<S: Session, R: Rng> Publisher<S, R> {
    pub fn new(config: Config, session: S, events: mpsc::Receiver<SessionEvent>, rng: R) -> Self {
        Self {
            config,
            session,
            events,
            events_open: true,
            rng,
            state: SessionState::Disconnected,
            stats: LoopStats::default(),
        }
    }

    /// Publishes samples until `shutdown` resolves, the sample limit is hit,
    /// or the connection policy gives up. The session is closed exactly once
    /// on every path out.
    pub async fn run<F: Future>(mut self, shutdown: F) -> Result<LoopStats> {
        tokio::pin!(shutdown);

        self.transition(SessionState::Connecting);
        let outcome = match self.await_connection(shutdown.as_mut()).await {
            Ok(true) => self.publish_loop(shutdown.as_mut()).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        let closed = self.shutdown().await;

        info!(
            "Stopped after {} samples: {} sent, {} failed, {} acknowledged",
            self.stats.attempted, self.stats.sent, self.stats.failed, self.stats.acknowledged
        );

        outcome?;
        closed?;
        Ok(self.stats)
    }

    /// Waits for the first connection outcome. `Ok(false)` means interrupted.
    async fn await_connection<F: Future>(&mut self, mut shutdown: Pin<&mut F>) -> Result<bool> {
        let timeout = self.config.connect_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Simulation stopped by user before connecting");
                    return Ok(false);
                }
                _ = &mut deadline => {
                    warn!("No connection acknowledgement within {:?}", timeout);
                    if self.policy() == ConnectionPolicy::Exit {
                        return Err(Error::ConnectTimeout(timeout));
                    }
                    return Ok(true);
                }
                event = self.events.recv(), if self.events_open => match event {
                    Some(SessionEvent::Connected { session_present }) => {
                        info!("Connected to Azure IoT Hub (session present: {})", session_present);
                        self.transition(SessionState::Connected);
                        return Ok(true);
                    }
                    Some(event @ SessionEvent::ConnectFailed { .. }) => {
                        self.handle_event(event)?;
                        // Reconnect keeps waiting for the transport to retry
                        if self.policy() == ConnectionPolicy::Ignore {
                            return Ok(true);
                        }
                    }
                    Some(event) => self.handle_event(event)?,
                    None => self.events_closed()?,
                }
            }
        }
    }

    async fn publish_loop<F: Future>(&mut self, mut shutdown: Pin<&mut F>) -> Result<()> {
        self.transition(SessionState::Publishing);
        let topic = self.config.topic();
        info!("MQTT topic: {}", topic);

        loop {
            self.publish_sample(&topic).await;

            if let Some(max) = self.config.max_samples {
                if self.stats.attempted >= max {
                    info!("Reached {} samples, stopping", max);
                    return Ok(());
                }
            }

            let pause = tokio::time::sleep(self.config.interval());
            tokio::pin!(pause);

            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Simulation stopped by user");
                        return Ok(());
                    }
                    _ = &mut pause => break,
                    event = self.events.recv(), if self.events_open => match event {
                        Some(event) => self.handle_event(event)?,
                        None => self.events_closed()?,
                    }
                }
            }
        }
    }

    async fn publish_sample(&mut self, topic: &str) {
        let sample = Telemetry::generate(&mut self.rng, self.config.device_id.clone(), Utc::now());
        SAMPLES_TOTAL.inc();
        self.stats.attempted += 1;

        let payload = match sample.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize telemetry: {}", e);
                self.record_failure();
                return;
            }
        };

        match self.session.publish(topic, payload.clone()).await {
            Ok(()) => {
                self.stats.sent += 1;
                PUBLISHED_TOTAL.inc();
                info!("Message sent: {}", payload);
            }
            Err(e) => {
                self.record_failure();
                warn!("Failed to send message: {}", e);
            }
        }
    }

    fn record_failure(&mut self) {
        self.stats.failed += 1;
        PUBLISH_FAILURES_TOTAL.inc();
    }

    fn handle_event(&mut self, event: SessionEvent) -> Result<()> {
        match event {
            SessionEvent::Connected { .. } => {
                info!("Connection re-established");
                Ok(())
            }
            SessionEvent::ConnectFailed { code, reason } => match self.policy() {
                ConnectionPolicy::Exit => Err(match code {
                    Some(code) => Error::ConnectionRefused { code, reason },
                    None => Error::ConnectionLost(reason),
                }),
                policy => {
                    warn!("Connection failed ({}), policy {:?}", reason, policy);
                    Ok(())
                }
            },
            SessionEvent::Disconnected { reason } => match self.policy() {
                ConnectionPolicy::Exit => Err(Error::ConnectionLost(reason)),
                policy => {
                    warn!("Device disconnected ({}), policy {:?}", reason, policy);
                    Ok(())
                }
            },
            SessionEvent::Acknowledged { pkid } => {
                self.stats.acknowledged += 1;
                debug!("Publish {} acknowledged", pkid);
                Ok(())
            }
            SessionEvent::Subscribed { pkid } => {
                debug!("Subscription {} acknowledged", pkid);
                Ok(())
            }
            SessionEvent::MessageReceived { topic, payload } => {
                debug!("Cloud-to-device message on {} ({} bytes)", topic, payload.len());
                Ok(())
            }
        }
    }

    fn events_closed(&mut self) -> Result<()> {
        self.events_open = false;
        match self.policy() {
            ConnectionPolicy::Exit => Err(Error::ConnectionLost(
                "transport task stopped".to_string(),
            )),
            _ => {
                debug!("Transport task stopped, no more session events");
                Ok(())
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.transition(SessionState::Disconnecting);
        let result = self.session.close().await;
        if let Err(e) = &result {
            error!("Failed to close session: {}", e);
        }
        self.events.close();
        self.transition(SessionState::Disconnected);
        result
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session state {} -> {}", self.state, next);
        self.state = next;
    }

    fn policy(&self) -> ConnectionPolicy {
        self.config.on_connection_loss
    }
}
