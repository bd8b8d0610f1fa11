use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::errors::CacheError;

/// Lifecycle of the full-body download
#[derive(Debug, Clone)]
pub enum DownloadState {
    /// No download has been started
    Idle,
    /// A download task is in flight
    Running,
    /// Waiting out a backoff delay before resuming
    Retrying,
    /// Whole resource is on disk and verified
    Completed,
    /// Retries exhausted or verification failed
    Failed(CacheError),
}

impl DownloadState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
        }
    }

    /// Check if a state transition is valid
    fn is_valid_transition(from: &DownloadState, to: &DownloadState) -> bool {
        use DownloadState::*;

        match (from, to) {
            (Idle, Running) => true,
            // A new task always supersedes the running one
            (Running, Running) => true,
            (Running, Retrying) => true,
            (Running, Completed) => true,
            (Running, Failed(_)) => true,
            (Retrying, Running) => true,
            (Retrying, Failed(_)) => true,
            // A later consumer request starts a fresh session
            (Failed(_), Running) => true,
            _ => false,
        }
    }
}

/// State transition event
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: &'static str,
    pub to: &'static str,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Handle on the one network task a session may own
#[derive(Debug)]
pub struct ActiveTask {
    pub id: u64,
    pub token: CancellationToken,
}

impl ActiveTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// The single full-body download of a resource.
///
/// `write_offset` only advances when bytes reach the cache file, so it always
/// equals the number of bytes durably flushed for the current task.
#[derive(Debug)]
pub struct DownloadSession {
    pub write_offset: u64,
    /// Range start requested by the current task, 0 for a plain GET
    pub expected_resume_start: u64,
    pub retry_count: u32,
    pub state: DownloadState,
    pub task: Option<ActiveTask>,
    /// Expected resource length, -1 when unknown
    pub expected_total: i64,
    /// Status of the accepted response for the current task
    pub response_status: Option<u16>,
    pub transitions: Vec<StateTransition>,
}

const MAX_RECORDED_TRANSITIONS: usize = 32;

impl Default for DownloadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadSession {
    pub fn new() -> Self {
        Self {
            write_offset: 0,
            expected_resume_start: 0,
            retry_count: 0,
            state: DownloadState::Idle,
            task: None,
            expected_total: -1,
            response_status: None,
            transitions: Vec::new(),
        }
    }

    /// Move to `to`, recording the transition. Invalid transitions are logged and ignored.
    pub fn transition(&mut self, to: DownloadState, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if !DownloadState::is_valid_transition(&self.state, &to) {
            warn!(
                "Ignoring invalid download transition {} -> {} ({})",
                self.state.name(),
                to.name(),
                reason
            );
            return false;
        }

        debug!(
            "Download state {} -> {} ({})",
            self.state.name(),
            to.name(),
            reason
        );
        if self.transitions.len() == MAX_RECORDED_TRANSITIONS {
            self.transitions.remove(0);
        }
        self.transitions.push(StateTransition {
            from: self.state.name(),
            to: to.name(),
            timestamp: Utc::now(),
            reason: Some(reason),
        });
        self.state = to;
        true
    }

    /// Whether `task_id` is the live task of this session
    pub fn owns_task(&self, task_id: u64) -> bool {
        self.task.as_ref().is_some_and(|task| task.id == task_id)
    }

    pub fn is_resuming(&self) -> bool {
        self.expected_resume_start > 0
    }

    /// Cancel and forget the current task, if any
    pub fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Cancelling download task {}", task.id);
            task.cancel();
        }
    }

    /// Cancel the task and start over from a fresh session
    pub fn reset(&mut self) {
        self.cancel_task();
        *self = Self::new();
    }
}
