//! Shared pieces of the audiopirate client workspace.
//!
//! Holds the control-message protocol spoken with the streaming server,
//! plus the tracing, metrics, and CLI color policy every binary uses.

pub mod cli;
pub mod observability;
pub mod protocol;

pub use cli::ColorWhen;
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use protocol::{AudioFormat, ClientMessage, ProtocolError, ServerMessage, WIRE_BYTES_PER_SAMPLE};
