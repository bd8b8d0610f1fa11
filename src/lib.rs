//! Progressive download cache for a single remote media resource.
//!
//! A [`DownloadCoordinator`] downloads the whole resource into a local cache
//! file in the background while serving metadata and byte-range requests to
//! consumers from that file.

pub mod cache;

#[cfg(test)]
mod test_utils;

pub use cache::{
    CacheError, CacheFile, CacheResult, ChannelObserver, CoordinatorConfig, CoordinatorHandle,
    DiskCacheFile, DownloadCoordinator, DownloadEvent, DownloadObserver, DownloadState,
    HttpTransport, RangeEvent, RangeReader, ReqwestTransport, ResourceLoader, ResourceMetadata,
    UncachedSeekPolicy,
};
