//! Chatrelay Telemetry - tracing subscriber setup and log-safe formatting

mod redact;
mod subscriber;

pub use redact::mask_secret;
pub use subscriber::{init_subscriber, try_init_subscriber, TelemetryConfig};
