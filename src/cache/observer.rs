use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use super::errors::CacheError;

/// Receives download lifecycle callbacks.
///
/// All calls come from the coordinator's serial queue, in emission order.
pub trait DownloadObserver: Send + Sync {
    /// `total_expected` is -1 when the length is unknown
    fn progress(&self, bytes_so_far: u64, total_expected: i64);

    fn completed(&self, path: &Path);

    fn failed(&self, error: &CacheError);
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DownloadObserver for NoopObserver {
    fn progress(&self, _bytes_so_far: u64, _total_expected: i64) {}

    fn completed(&self, _path: &Path) {}

    fn failed(&self, _error: &CacheError) {}
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress { bytes_so_far: u64, total_expected: i64 },
    Completed { path: PathBuf },
    Failed { error: CacheError },
}

/// Forwards callbacks into a channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl DownloadObserver for ChannelObserver {
    fn progress(&self, bytes_so_far: u64, total_expected: i64) {
        let _ = self.sender.send(DownloadEvent::Progress {
            bytes_so_far,
            total_expected,
        });
    }

    fn completed(&self, path: &Path) {
        let _ = self.sender.send(DownloadEvent::Completed {
            path: path.to_path_buf(),
        });
    }

    fn failed(&self, error: &CacheError) {
        let _ = self.sender.send(DownloadEvent::Failed {
            error: error.clone(),
        });
    }
}
