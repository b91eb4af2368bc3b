pub mod checkpoint;
pub mod deprovision;
pub mod dns;
pub mod hosts;
pub mod leadership;
pub mod prober;
pub mod provisioner;
pub mod runtime;

pub use checkpoint::ProvisionStep;
pub use deprovision::{DeprovisionError, Deprovisioner};
pub use dns::{DnsError, DnsPublisher, LocalDnsPublisher};
pub use leadership::{LeadershipMonitor, StaticLeadership, StoreLeadership};
pub use prober::ReadinessProber;
pub use provisioner::{ProvisionError, Provisioner};
pub use runtime::LeaderRuntime;
