pub mod config;
pub mod control;
pub mod framing;
pub mod http_job;
pub mod identity;
pub mod manager;
pub mod outbound;
pub mod pool;
pub mod room;
pub mod supervisor;
pub mod wbi;

pub use config::Config;
pub use identity::AgentIdentity;

/// Protocol version string sent to the coordinator in the connect URL.
/// Mirrors `Connector.VERSION` in the original implementation.
pub const PROTOCOL_VERSION: &str = "1.0.4";
