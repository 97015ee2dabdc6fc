//! Session Gateway - session-multiplexing front door for upstream protocol servers
//!
//! Clients open sessions against published endpoints; every session of an
//! endpoint shares one lazily created upstream server instance, which is torn
//! down when its last session ends.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod reaper;
pub mod session;
pub mod transport;
pub mod upstream;

pub use cache::{InstanceCache, InstanceLease, UpstreamInstance};
pub use config::{ApiKeyConfig, GatewayConfig, NamespaceConfig};
pub use directory::{Endpoint, EndpointDirectory, StaticDirectory};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, SESSION_HEADER};
pub use reaper::SessionReaper;
pub use session::{Session, SessionCleanup, SessionRegistry, SessionState};
pub use transport::{Transport, TransportKind};
pub use upstream::{ProcessFactory, UpstreamFactory, UpstreamParts, UpstreamServer};
