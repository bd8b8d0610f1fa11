use parking_lot::Mutex;
use std::sync::Arc;

/// In-memory bytes received from the network but not yet flushed to disk.
///
/// The buffer is bound to one download task at a time. Appends from any other
/// task are rejected, so a superseded task can never interleave bytes into the
/// stream of its successor.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    data: Vec<u8>,
    task_id: u64,
}

pub type SharedWriteBuffer = Arc<Mutex<WriteBuffer>>;

impl WriteBuffer {
    pub fn shared() -> SharedWriteBuffer {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Append bytes on behalf of `task_id`; returns the new length, or `None` if the task is stale
    pub fn append(&mut self, task_id: u64, bytes: &[u8]) -> Option<usize> {
        if task_id != self.task_id {
            return None;
        }
        self.data.extend_from_slice(bytes);
        Some(self.data.len())
    }

    /// Remove every buffered byte
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// Put back bytes taken for a flush that failed, ahead of anything appended since
    pub fn restore(&mut self, mut front: Vec<u8>) {
        if front.is_empty() {
            return;
        }
        front.extend_from_slice(&self.data);
        self.data = front;
    }

    /// Take the remaining bytes and bind the buffer to a new task
    pub fn rebind(&mut self, task_id: u64) -> Vec<u8> {
        self.task_id = task_id;
        self.take()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }
}
