//! InstaFix core: post acquisition, expiring cache, remote workers and grid collages.

pub mod codec;
pub mod coordinator;
pub mod extract;
pub mod flight;
pub mod grid;
pub mod origin;
pub mod remote;
pub mod store;
pub mod types;

pub use coordinator::{
    CoordinatorConfig, FetchCoordinator, FetchRoute, LocalFetcher, PostSource, DEFAULT_MEDIA_HOST,
};
pub use extract::{ExtractError, Extractor};
pub use flight::SingleFlight;
pub use grid::{GridCompositor, GridConfig, GridError};
pub use origin::{HttpOrigin, Origin, OriginConfig};
pub use remote::{RemoteConfig, RemoteError, RemoteListener, RemotePool, RemoteWorker, WorkerConfig};
pub use store::{CacheStore, CachedPost, StoreError};
pub use types::*;
