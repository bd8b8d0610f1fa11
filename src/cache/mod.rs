pub mod buffer;
pub mod cache_file;
pub mod cached_read;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod metadata;
pub mod negotiation;
pub mod observer;
pub mod request;
pub mod serial_queue;
pub mod state_machine;
pub mod stats;
pub mod transport;


pub use cache_file::{CacheFile, DiskCacheFile};
pub use config::{CoordinatorConfig, UncachedSeekPolicy};
pub use coordinator::{
    CoordinatorHandle, DownloadCoordinator, DownloadCoordinatorBuilder, ResourceLoader,
    SessionSnapshot,
};
pub use errors::{CacheError, CacheResult};
pub use metadata::{MimeLookup, ResourceMetadata};
pub use observer::{ChannelObserver, DownloadEvent, DownloadObserver, NoopObserver};
pub use request::{MetadataRequest, RangeEvent, RangeReader, RequestId};
pub use state_machine::DownloadState;
pub use stats::{CoordinatorStats, StatsSnapshot};
pub use transport::{HttpTransport, ReqwestTransport};
