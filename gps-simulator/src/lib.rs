pub mod config;
pub mod errors;
pub mod metrics;
pub mod publisher;
pub mod session;
pub mod telemetry;
