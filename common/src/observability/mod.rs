//! Logging setup and the Prometheus registry shared by engine and host.

mod metrics;
mod tracing;

pub use self::tracing::init_tracing;
pub use metrics::{MetricsContext, MetricsServerConfig};
