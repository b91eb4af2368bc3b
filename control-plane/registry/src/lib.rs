pub mod memory;
pub mod model;
pub mod ports;
pub mod sql;
pub mod store;

pub use memory::MemoryStore;
pub use model::{
    ClusterId, ClusterRecord, ClusterState, DeploymentId, DeploymentKind, DeploymentRecord,
    NamespaceId, NamespaceName, NamespaceRecord, Placement, PortBlock, PortReservation,
    ReadinessVector, Role, ServiceKind, ServicePort,
};
pub use ports::{PortAllocError, PortAllocator};
pub use sql::SqlStore;
pub use store::{RegistryError, RegistryResult, RegistryStore};
