use crate::errors::{Error, Result};
use clap::{Parser, ValueEnum};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const HUB_DOMAIN: &str = "azure-devices.net";
const API_VERSION: &str = "2021-04-12";

/// What to do when the hub refuses the connection or drops it mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConnectionPolicy {
    /// Log and keep going; the transport is no longer serviced.
    Ignore,
    /// Log, shut down and exit with an error.
    Exit,
    /// Log and keep reconnecting after `reconnect_delay`.
    Reconnect,
}

#[derive(Clone, Parser)]
#[command(name = "gps-simulator", version, about = "Publishes simulated GPS positions to Azure IoT Hub")]
pub struct Config {
    /// Device identity registered in the hub
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: String,

    /// Pre-issued shared access signature used as the MQTT password
    #[arg(long, env = "SAS_TOKEN", hide_env_values = true)]
    pub sas_token: String,

    #[arg(long, env = "IOT_HUB_NAME", default_value = "gps-trackly")]
    pub hub_name: String,

    /// Connect here instead of the hub hostname (local brokers, proxies)
    #[arg(long, env = "MQTT_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "MQTT_PORT", default_value_t = 8883)]
    pub port: u16,

    #[arg(long, env = "PUBLISH_INTERVAL_SECS", default_value_t = 10)]
    pub interval_secs: u64,

    #[arg(long, env = "MQTT_KEEP_ALIVE_SECS", default_value_t = 30)]
    pub keep_alive_secs: u64,

    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// PEM bundle to trust instead of the platform root certificates
    #[arg(long, env = "CA_FILE")]
    pub ca_file: Option<PathBuf>,

    #[arg(long, env = "ON_CONNECTION_LOSS", value_enum, default_value_t = ConnectionPolicy::Ignore)]
    pub on_connection_loss: ConnectionPolicy,

    #[arg(long, env = "RECONNECT_DELAY_SECS", default_value_t = 5)]
    pub reconnect_delay_secs: u64,

    /// Seed for reproducible positions
    #[arg(long, env = "RNG_SEED")]
    pub seed: Option<u64>,

    /// Stop after this many samples
    #[arg(long, env = "MAX_SAMPLES")]
    pub max_samples: Option<u64>,

    /// Subscribe to cloud-to-device messages and log them
    #[arg(long, env = "RECEIVE_C2D")]
    pub receive_c2d: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Defaults for everything except identity and token.
    pub fn new(device_id: impl Into<String>, sas_token: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            sas_token: sas_token.into(),
            hub_name: "gps-trackly".to_string(),
            host: None,
            port: 8883,
            interval_secs: 10,
            keep_alive_secs: 30,
            connect_timeout_secs: 30,
            ca_file: None,
            on_connection_loss: ConnectionPolicy::Ignore,
            reconnect_delay_secs: 5,
            seed: None,
            max_samples: None,
            receive_c2d: false,
            metrics_addr: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::Config("device id cannot be empty".to_string()));
        }
        if self.device_id.trim() != self.device_id {
            return Err(Error::Config(
                "device id cannot have leading or trailing whitespace".to_string(),
            ));
        }
        if self.sas_token.trim().is_empty() {
            return Err(Error::Config("SAS token cannot be empty".to_string()));
        }
        if self.hub_name.trim().is_empty() {
            return Err(Error::Config("hub name cannot be empty".to_string()));
        }
        if self.interval_secs == 0 {
            return Err(Error::Config("publish interval must be at least 1 second".to_string()));
        }
        if self.keep_alive_secs == 0 {
            return Err(Error::Config("keep-alive must be at least 1 second".to_string()));
        }
        if self.reconnect_delay_secs == 0 {
            return Err(Error::Config("reconnect delay must be at least 1 second".to_string()));
        }
        Ok(())
    }

    pub fn hostname(&self) -> String {
        format!("{}.{}", self.hub_name, HUB_DOMAIN)
    }

    /// Network address the session dials
    pub fn endpoint(&self) -> String {
        self.host.clone().unwrap_or_else(|| self.hostname())
    }

    pub fn username(&self) -> String {
        format!("{}/{}/?api-version={}", self.hostname(), self.device_id, API_VERSION)
    }

    /// Device-to-cloud telemetry topic
    pub fn topic(&self) -> String {
        format!("devices/{}/messages/events/", self.device_id)
    }

    /// Cloud-to-device topic filter
    pub fn c2d_topic(&self) -> String {
        format!("devices/{}/messages/devicebound/#", self.device_id)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

// The token stays out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("device_id", &self.device_id)
            .field("sas_token", &"***")
            .field("hub_name", &self.hub_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("interval_secs", &self.interval_secs)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("ca_file", &self.ca_file)
            .field("on_connection_loss", &self.on_connection_loss)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("seed", &self.seed)
            .field("max_samples", &self.max_samples)
            .field("receive_c2d", &self.receive_c2d)
            .field("metrics_addr", &self.metrics_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic() {
        let config = Config::new("dev-1", "token");
        assert_eq!(config.topic(), "devices/dev-1/messages/events/");
    }

    #[test]
    fn test_username() {
        let config = Config::new("dev-1", "token");
        assert_eq!(config.hostname(), "gps-trackly.azure-devices.net");
        assert_eq!(
            config.username(),
            "gps-trackly.azure-devices.net/dev-1/?api-version=2021-04-12"
        );
    }

    #[test]
    fn test_endpoint_override_keeps_username() {
        let mut config = Config::new("dev-1", "token");
        assert_eq!(config.endpoint(), "gps-trackly.azure-devices.net");

        config.host = Some("127.0.0.1".to_string());
        assert_eq!(config.endpoint(), "127.0.0.1");
        assert!(config.username().starts_with("gps-trackly.azure-devices.net/"));
    }

    #[test]
    fn test_c2d_topic() {
        let config = Config::new("dev-1", "token");
        assert_eq!(config.c2d_topic(), "devices/dev-1/messages/devicebound/#");
    }

    #[test]
    fn test_defaults_match_cli_defaults() {
        let parsed = Config::try_parse_from([
            "gps-simulator",
            "--device-id",
            "dev-1",
            "--sas-token",
            "token",
        ])
        .unwrap();
        let built = Config::new("dev-1", "token");

        assert_eq!(parsed.hub_name, built.hub_name);
        assert_eq!(parsed.port, 8883);
        assert_eq!(parsed.interval(), Duration::from_secs(10));
        assert_eq!(parsed.keep_alive_secs, built.keep_alive_secs);
        assert_eq!(parsed.connect_timeout_secs, built.connect_timeout_secs);
        assert_eq!(parsed.on_connection_loss, ConnectionPolicy::Ignore);
        assert_eq!(parsed.reconnect_delay_secs, built.reconnect_delay_secs);
        assert!(!parsed.receive_c2d);
        assert!(parsed.max_samples.is_none());
    }

    #[test]
    fn test_policy_from_cli() {
        let parsed = Config::try_parse_from([
            "gps-simulator",
            "--device-id",
            "dev-1",
            "--sas-token",
            "token",
            "--on-connection-loss",
            "reconnect",
        ])
        .unwrap();
        assert_eq!(parsed.on_connection_loss, ConnectionPolicy::Reconnect);
    }

    #[test]
    fn test_validate_rejects_empty_identity() {
        assert!(Config::new("", "token").validate().is_err());
        assert!(Config::new(" dev-1", "token").validate().is_err());
        assert!(Config::new("dev-1", " ").validate().is_err());
        assert!(Config::new("dev-1", "token").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::new("dev-1", "token");
        config.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_reconnect_delay() {
        let mut config = Config::new("dev-1", "token");
        config.reconnect_delay_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.reconnect_delay_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_hides_token() {
        let config = Config::new("dev-1", "SharedAccessSignature sr=secret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("dev-1"));
    }
}
