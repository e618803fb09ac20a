use crate::errors::Result;
use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SAMPLES_TOTAL: Counter = counter(
        "simulator_samples_total",
        "Total GPS samples generated"
    );
    pub static ref PUBLISHED_TOTAL: Counter = counter(
        "simulator_published_total",
        "Total samples handed to the MQTT client"
    );
    pub static ref PUBLISH_FAILURES_TOTAL: Counter = counter(
        "simulator_publish_failures_total",
        "Total samples dropped because publishing failed"
    );
    pub static ref ACKED_TOTAL: Counter = counter(
        "simulator_acked_total",
        "Total publishes acknowledged by the hub"
    );
    pub static ref CONNECTION_FAILURES_TOTAL: Counter = counter(
        "simulator_connection_failures_total",
        "Total refused or failed connection attempts"
    );
    pub static ref DISCONNECTS_TOTAL: Counter = counter(
        "simulator_disconnects_total",
        "Total unexpected disconnects after a successful connection"
    );
}

fn counter(name: &str, help: &str) -> Counter {
    Counter::with_opts(Opts::new(name, help)).unwrap()
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(SAMPLES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUBLISH_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACKED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONNECTION_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISCONNECTS_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_counters_are_exported() {
        init_metrics().unwrap();
        SAMPLES_TOTAL.inc();

        let text = gather_metrics();
        assert!(text.contains("simulator_samples_total"));
        assert!(text.contains("simulator_publish_failures_total"));

        // Registering twice is refused, not a panic
        assert!(init_metrics().is_err());
    }
}
