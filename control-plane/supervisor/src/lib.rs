pub mod protocol;
pub mod server;
pub mod service;
pub mod supervisor;
pub mod transport;

pub use protocol::{SpawnCommand, SpawnResponse, SpawnSpec, StopSpec};
pub use server::{InternalState, internal_router};
pub use service::{EngineCatalog, InstanceConfig, InstanceKey, PeerEndpoint, health_path};
pub use supervisor::{InstanceStatus, InstanceSupervisor, SpawnError, StopError};
pub use transport::{HttpSpawnTransport, LoopbackTransport, SpawnTransport, SpawnTransportError};
