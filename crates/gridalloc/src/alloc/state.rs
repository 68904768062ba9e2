use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::Map;
use crate::alloc::backend::BackendStatus;

pub type RequestId = String;

/// Canonical lifecycle of a capacity request, shared by all backends.
///
/// `Pending → Running → {Completed, Cancelled, Failed, Timeout}`. The four
/// terminal states are sinks. `Unknown` is never stored in the ledger; it is
/// reported for identifiers the ledger does not know and for status tokens
/// that could not be translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed | JobState::Timeout
        )
    }

    /// Position within the request lifecycle, used to reject backward
    /// transitions reported by a lagging backend.
    fn phase(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Completed
            | JobState::Cancelled
            | JobState::Failed
            | JobState::Timeout => 2,
            JobState::Unknown => 0,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A single capacity request tracked by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: RequestId,
    pub name: String,
    pub state: JobState,
    pub queued_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    units: u64,
    released: bool,
}

impl JobRecord {
    pub fn new(id: RequestId, name: String, units: u64) -> Self {
        Self {
            id,
            name,
            state: JobState::Pending,
            queued_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            units,
            released: false,
        }
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    /// Returns true if the request is still in queue or running.
    pub fn is_active(&self) -> bool {
        matches!(self.state, JobState::Pending | JobState::Running)
    }
}

/// In-memory record of every outstanding capacity request of one provider,
/// together with the capacity counter.
///
/// The ledger is the single source of truth for "what did we ask for and what
/// happened to it". The counter equals the number of units that are queued or
/// running; it is incremented once per successful submission and decremented
/// once per request, either when polling observes a terminal state or when the
/// request is cancelled, whichever comes first.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    jobs: Map<RequestId, JobRecord>,
    capacity: u64,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&mut self, record: JobRecord) {
        self.capacity += record.units;
        if let Some(previous) = self.jobs.insert(record.id.clone(), record) {
            log::warn!("Duplicate request detected: {}", previous.id);
            self.release_units(&previous);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    /// Apply a state observed at the backend to the given request.
    ///
    /// Transitions are forward-only: terminal states are sinks and a report
    /// lagging behind the recorded lifecycle phase is ignored. The first
    /// transition into a terminal state releases the request's units from the
    /// capacity counter; a later cancellation does not release them again.
    ///
    /// Returns the effective state of the request after the observation.
    pub fn observe(&mut self, id: &str, status: &BackendStatus) -> JobState {
        let Some(record) = self.jobs.get_mut(id) else {
            return JobState::Unknown;
        };
        let state = status.state;
        if state == JobState::Unknown
            || record.state.is_terminal()
            || state.phase() < record.state.phase()
        {
            return record.state;
        }
        record.state = state;
        if status.started_at.is_some() {
            record.started_at = status.started_at;
        }
        if status.finished_at.is_some() {
            record.finished_at = status.finished_at;
        }
        let mut released_units = 0;
        if state.is_terminal() && !record.released {
            record.released = true;
            released_units = record.units;
        }
        self.subtract_capacity(released_units);
        state
    }

    /// Remove a request from the ledger, releasing its units unless a terminal
    /// observation released them already.
    pub fn release(&mut self, id: &str) -> Option<JobRecord> {
        let record = self.jobs.remove(id)?;
        self.release_units(&record);
        Some(record)
    }

    /// Drop every record and zero the counter. Used by provider disposal.
    pub fn clear(&mut self) {
        self.jobs.clear();
        self.capacity = 0;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    /// Identifiers of requests that are still queued or running.
    pub fn active_ids(&self) -> Vec<RequestId> {
        self.jobs
            .values()
            .filter(|record| record.is_active())
            .map(|record| record.id.clone())
            .collect()
    }

    fn release_units(&mut self, record: &JobRecord) {
        if !record.released {
            let units = record.units;
            self.subtract_capacity(units);
        }
    }

    fn subtract_capacity(&mut self, units: u64) {
        debug_assert!(self.capacity >= units);
        self.capacity = self.capacity.saturating_sub(units);
    }
}
