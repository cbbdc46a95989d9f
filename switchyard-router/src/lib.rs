//! Switchyard router: matches clients to services by URL, spawning services on demand,
//! and splices the two connections together once the service dials back.

pub mod config;
pub mod error;
pub mod forward;
pub mod launcher;
pub mod package;
pub mod pending;
pub mod port_mapping;
pub mod registry;
pub mod router;
pub mod trackers;
pub mod transport;

pub use config::{Config, ConfigError, TrackerConfig};
pub use error::{Result, RouterError};
pub use launcher::{LaunchRequest, ProcessLauncher, SpawnedProcess, TokioLauncher};
pub use package::{DirectoryLocator, Package, PackageLocator};
pub use pending::{PendingServer, PendingServers, PendingTable};
pub use registry::{Registration, ServiceHandle, ServiceRegistry};
pub use router::{Router, RouterOptions, Session};
pub use transport::{connect, Connection, ConnectionId, Listener};
