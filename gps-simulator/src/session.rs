use crate::config::{Config, ConnectionPolicy};
use crate::errors::{Error, Result};
use crate::metrics::{ACKED_TOTAL, CONNECTION_FAILURES_TOTAL, DISCONNECTS_TOTAL};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration, Transport,
};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 100;
const EVENT_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Connection lifecycle, as seen by the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Publishing,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Publishing => "publishing",
            SessionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Notifications from the transport task. Each is delivered at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { session_present: bool },
    /// `code` is the CONNACK return code, or `None` when the transport
    /// failed before the broker answered.
    ConnectFailed { code: Option<u8>, reason: String },
    Acknowledged { pkid: u16 },
    Subscribed { pkid: u16 },
    MessageReceived { topic: String, payload: Vec<u8> },
    Disconnected { reason: String },
}

/// A broker session the publisher can push payloads through.
#[allow(async_fn_in_trait)]
pub trait Session {
    /// Hands the payload to the transport with at-least-once delivery.
    /// Returns once queued; the acknowledgement arrives as a `SessionEvent`.
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    /// Closes the session and stops the transport task. Safe to call twice.
    async fn close(&mut self) -> Result<()>;
}

/// Numeric CONNACK code and its meaning.
pub fn connect_code(code: &ConnectReturnCode) -> (u8, &'static str) {
    match code {
        ConnectReturnCode::Success => (0, "connection accepted"),
        ConnectReturnCode::RefusedProtocolVersion => (1, "unacceptable protocol version"),
        ConnectReturnCode::BadClientId => (2, "identifier rejected"),
        ConnectReturnCode::ServiceUnavailable => (3, "server unavailable"),
        ConnectReturnCode::BadUserNamePassword => (4, "bad user name or password"),
        ConnectReturnCode::NotAuthorized => (5, "not authorized"),
    }
}

pub struct MqttSession {
    client: AsyncClient,
    closing: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MqttSession {
    /// Opens the session and starts servicing the transport in the background.
    pub fn connect(config: &Config) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;
        let options = mqtt_options(config)?;
        info!(
            "Connecting to {}:{} as {}",
            config.endpoint(),
            config.port,
            config.device_id
        );

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let (closing, closing_rx) = watch::channel(false);

        if config.receive_c2d {
            let filter = config.c2d_topic();
            client.try_subscribe(&filter, QoS::AtLeastOnce)?;
            info!("Subscribing to cloud-to-device messages on {}", filter);
        }

        let task = tokio::spawn(service_transport(
            eventloop,
            tx,
            closing_rx,
            config.on_connection_loss,
            config.reconnect_delay(),
        ));

        Ok((
            Self {
                client,
                closing,
                task: Some(task),
            },
            rx,
        ))
    }
}

impl Session for MqttSession {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        if self.task.is_none() {
            return Err(Error::SessionClosed);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(Error::Mqtt)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        // While disconnected the task stops at once; otherwise it flushes
        // the DISCONNECT first.
        let _ = self.closing.send(true);
        let sent = self.client.try_disconnect();

        match tokio::time::timeout(CLOSE_GRACE, &mut task).await {
            Ok(_) => debug!("Transport task finished"),
            Err(_) => {
                warn!("Transport task still running after {:?}, aborting", CLOSE_GRACE);
                task.abort();
            }
        }

        match sent {
            Ok(()) => {
                info!("Session closed");
                Ok(())
            }
            // The transport had already stopped, nothing left to disconnect.
            Err(e) if task.is_finished() => {
                debug!("Disconnect not sent: {}", e);
                Ok(())
            }
            Err(e) => Err(Error::Mqtt(e)),
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn mqtt_options(config: &Config) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(&config.device_id, config.endpoint(), config.port);
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(false);
    options.set_credentials(config.username(), &config.sas_token);
    options.set_transport(transport(config)?);
    Ok(options)
}

/// TLS with server certificate validation and no client certificate.
/// rustls only speaks TLS 1.2 and 1.3.
fn transport(config: &Config) -> Result<Transport> {
    match &config.ca_file {
        Some(path) => {
            let ca = std::fs::read(path)?;
            debug!("Trusting CA bundle {}", path.display());
            Ok(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }))
        }
        None => Ok(Transport::tls_with_default_config()),
    }
}

async fn service_transport(
    mut eventloop: EventLoop,
    events: mpsc::Sender<SessionEvent>,
    mut closing: watch::Receiver<bool>,
    policy: ConnectionPolicy,
    reconnect_delay: Duration,
) {
    let mut connected = false;

    loop {
        let polled = if connected {
            eventloop.poll().await
        } else {
            tokio::select! {
                polled = eventloop.poll() => polled,
                _ = closing.changed() => {
                    debug!("Closed while not connected, stopping transport task");
                    break;
                }
            }
        };

        let event = match polled {
            // Refused CONNACKs surface as `ConnectionError::ConnectionRefused`
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected = true;
                info!("Device connected with result code: 0");
                SessionEvent::Connected {
                    session_present: ack.session_present,
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                ACKED_TOTAL.inc();
                debug!("Device sent message (pkid {})", ack.pkid);
                SessionEvent::Acknowledged { pkid: ack.pkid }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                info!("Topic subscribed (pkid {})", ack.pkid);
                SessionEvent::Subscribed { pkid: ack.pkid }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                info!(
                    "Received message on {}: {}",
                    publish.topic,
                    String::from_utf8_lossy(&publish.payload)
                );
                SessionEvent::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping transport task");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                let event = failure_event(&e, connected);
                connected = false;
                if events.send(event).await.is_err() {
                    break;
                }

                match policy {
                    ConnectionPolicy::Reconnect => {
                        warn!("Reconnecting in {:?}", reconnect_delay);
                        tokio::select! {
                            _ = tokio::time::sleep(reconnect_delay) => continue,
                            _ = closing.changed() => {
                                debug!("Closed while waiting to reconnect");
                                break;
                            }
                        }
                    }
                    ConnectionPolicy::Ignore | ConnectionPolicy::Exit => {
                        warn!("Transport no longer serviced");
                        break;
                    }
                }
            }
        };

        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping transport task");
            break;
        }
    }
}

fn failure_event(e: &ConnectionError, connected: bool) -> SessionEvent {
    match e {
        ConnectionError::ConnectionRefused(code) => {
            let (code, reason) = connect_code(code);
            CONNECTION_FAILURES_TOTAL.inc();
            error!("Connection failed with code {}: {}", code, reason);
            SessionEvent::ConnectFailed {
                code: Some(code),
                reason: reason.to_string(),
            }
        }
        _ if connected => {
            DISCONNECTS_TOTAL.inc();
            error!("Device disconnected: {}", e);
            SessionEvent::Disconnected {
                reason: e.to_string(),
            }
        }
        _ => {
            CONNECTION_FAILURES_TOTAL.inc();
            error!("Connection failed: {}", e);
            SessionEvent::ConnectFailed {
                code: None,
                reason: e.to_string(),
            }
        }
    }
}
