pub mod common;
pub mod pbs;
pub mod sge;
pub mod slurm;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use crate::Map;
use crate::alloc::backend::pbs::PbsHandler;
use crate::alloc::backend::sge::SgeHandler;
use crate::alloc::backend::slurm::SlurmHandler;
use crate::alloc::state::{JobState, RequestId};
use crate::manager::info::ManagerType;

/// Static description of what a backend supports, queried by the runtime
/// before it invokes elastic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// The backend can grow and shrink capacity by submitting and cancelling
    /// individual requests.
    pub elastic_scaling: bool,
    /// Scheduler commands have to be executed through a remote channel rather
    /// than on the local host.
    pub requires_channel: bool,
}

/// Site-level submission parameters shared by all requests of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    timelimit: Duration,
    additional_args: Vec<String>,
}

impl SiteConfig {
    pub fn new(timelimit: Duration, additional_args: Vec<String>) -> Self {
        Self {
            timelimit,
            additional_args,
        }
    }

    pub fn timelimit(&self) -> Duration {
        self.timelimit
    }

    pub fn additional_args(&self) -> &[String] {
        &self.additional_args
    }
}

/// Everything a backend needs to build and submit one allocation request.
#[derive(Debug, Clone)]
pub struct SubmitSpec {
    /// Worker command started inside the allocation.
    pub command: String,
    /// Capacity units (nodes or array tasks) acquired by this request.
    pub units: u64,
    /// Human-readable request label.
    pub name: String,
    pub timelimit: Duration,
    pub additional_args: Vec<String>,
}

pub enum SubmitMode {
    /// Submit an allocation request in a normal way.
    Submit,
    /// Submit a held request only to test site parameters.
    DryRun,
}

/// Outcome of one submission attempt.
#[derive(Debug)]
pub struct SubmissionOutcome {
    /// Directory containing the submit script and stdout/stderr of the
    /// request (if submission was successful) and with debug information.
    ///
    /// It is returned even when the submission fails so that the operator can
    /// inspect what was sent to the scheduler.
    working_dir: PathBuf,
    /// Identifier assigned by the backend, if it accepted the request.
    id: crate::Result<RequestId>,
}

impl SubmissionOutcome {
    pub fn new(id: crate::Result<RequestId>, working_dir: PathBuf) -> Self {
        Self { id, working_dir }
    }

    pub fn into_id(self) -> crate::Result<RequestId> {
        self.id
    }

    pub fn working_dir(&self) -> &Path {
        self.working_dir.as_path()
    }
}

/// State reported by the backend for a single request, translated into the
/// canonical vocabulary. Timestamps are filled in where the backend exposes
/// them.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub state: JobState,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl From<JobState> for BackendStatus {
    fn from(state: JobState) -> Self {
        Self {
            state,
            started_at: None,
            finished_at: None,
        }
    }
}

pub type StatusMap = Map<RequestId, crate::Result<BackendStatus>>;

/// Handler that can communicate with one batch scheduler (SGE/Slurm/PBS).
///
/// The returned futures are constructed synchronously and capture owned data,
/// so they can be driven to completion without borrowing the handler.
pub trait BackendHandler {
    /// Capability descriptor of this backend. Pure, no side effects.
    fn capabilities(&self) -> BackendCapabilities;

    /// Submit one allocation request that will start the worker command.
    ///
    /// If the method returns an error, no directory was created on disk.
    /// If it returns Ok, the directory was created and the submission result
    /// can be read out of the `id` field of [`SubmissionOutcome`].
    fn submit_allocation(
        &mut self,
        spec: SubmitSpec,
        mode: SubmitMode,
    ) -> Pin<Box<dyn Future<Output = crate::Result<SubmissionOutcome>>>>;

    /// Get the status of a set of existing requests.
    /// This function takes multiple requests at once to amortize the query
    /// cost.
    fn get_status_of_requests(
        &self,
        ids: &[RequestId],
    ) -> Pin<Box<dyn Future<Output = crate::Result<StatusMap>>>>;

    /// Cancel a request. Success means the scheduler acknowledged the
    /// cancellation through the command's exit status.
    fn cancel_request(
        &self,
        id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = crate::Result<()>>>>;
}

pub fn create_backend_handler(
    manager: &ManagerType,
    working_root: PathBuf,
    name: Option<String>,
) -> crate::Result<Box<dyn BackendHandler>> {
    Ok(match manager {
        ManagerType::Sge => Box::new(SgeHandler::new(working_root, name)),
        ManagerType::Slurm => Box::new(SlurmHandler::new(working_root, name)),
        ManagerType::Pbs => Box::new(PbsHandler::new(working_root, name)),
    })
}
