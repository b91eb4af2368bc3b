pub mod api;
pub mod blobs;
pub mod classify;
pub mod credentials;
pub mod proxy;
pub mod router;
pub mod state;

pub use blobs::{BlobError, BlobStore, FsBlobStore, content_id_for};
pub use classify::{RouteClass, classify};
pub use credentials::{ApiKeys, AuthError, DevWalletVerifier, Identity, WalletVerifier};
pub use router::{GatewayContext, public_router};
pub use state::{ClusterRoutes, PlacementTarget, RouterState};
