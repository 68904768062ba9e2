use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use futures::future::join_all;
use tempfile::TempDir;

use crate::alloc::backend::{
    BackendCapabilities, BackendHandler, SiteConfig, SubmitMode, SubmitSpec,
    create_backend_handler,
};
use crate::alloc::controller::{Controller, ControllerConfig};
use crate::alloc::state::{JobRecord, JobState, RequestId, ResourceLedger};
use crate::common::error::GridAllocError;
use crate::manager::info::ManagerType;
use crate::{Map, Set};

/// Uniform capacity-management contract on top of one batch scheduler.
///
/// A provider owns its [`ResourceLedger`] and capacity counter exclusively;
/// the task-execution runtime drives it through `submit`/`status`/`cancel`
/// and reads `current_capacity` to make its elasticity decisions.
pub struct ExecutionProvider {
    manager: ManagerType,
    site: SiteConfig,
    handler: Box<dyn BackendHandler>,
    ledger: ResourceLedger,
    controller: Option<Controller>,
    disposed: bool,
}

impl ExecutionProvider {
    pub fn new(
        manager: ManagerType,
        site: SiteConfig,
        working_root: PathBuf,
        name: Option<String>,
    ) -> crate::Result<Self> {
        let handler = create_backend_handler(&manager, working_root, name)?;
        Ok(Self::with_handler(manager, site, handler))
    }

    /// Create a provider on top of an already constructed backend handler.
    pub fn with_handler(
        manager: ManagerType,
        site: SiteConfig,
        handler: Box<dyn BackendHandler>,
    ) -> Self {
        Self {
            manager,
            site,
            handler,
            ledger: ResourceLedger::new(),
            controller: None,
            disposed: false,
        }
    }

    pub fn manager(&self) -> &ManagerType {
        &self.manager
    }

    /// Static capability descriptor of the underlying backend.
    pub fn capabilities(&self) -> BackendCapabilities {
        self.handler.capabilities()
    }

    /// Number of capacity units currently queued or running. Reads the
    /// counter only, the backend is not queried.
    pub fn current_capacity(&self) -> u64 {
        self.ledger.capacity()
    }

    pub fn job(&self, id: &str) -> Option<&JobRecord> {
        self.ledger.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.ledger.jobs()
    }

    /// Submit one capacity request that starts `capacity` workers running
    /// `command`.
    ///
    /// On success the request is recorded as PENDING and the capacity counter
    /// grows by `capacity`. On failure nothing is recorded and the scheduler
    /// diagnostic is attached to the returned error.
    pub async fn submit(
        &mut self,
        command: &str,
        capacity: u64,
        name: &str,
    ) -> crate::Result<RequestId> {
        self.ensure_live()?;
        if command.trim().is_empty() {
            return Err(GridAllocError::Submission(
                "worker command must not be empty".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(GridAllocError::Submission(
                "requested capacity must be at least 1".to_string(),
            ));
        }

        let spec = SubmitSpec {
            command: command.to_string(),
            units: capacity,
            name: name.to_string(),
            timelimit: self.site.timelimit(),
            additional_args: self.site.additional_args().to_vec(),
        };
        let outcome = self.handler.submit_allocation(spec, SubmitMode::Submit).await?;
        let working_dir = outcome.working_dir().to_path_buf();
        match outcome.into_id() {
            Ok(id) => {
                log::info!(
                    "Submitted {} request {id} ({capacity} units, timelimit {})",
                    self.manager,
                    humantime::format_duration(self.site.timelimit())
                );
                self.ledger
                    .register(JobRecord::new(id.clone(), name.to_string(), capacity));
                Ok(id)
            }
            Err(error) => {
                log::error!(
                    "Submission into {} failed: {error}; debug files are in {}",
                    self.manager,
                    working_dir.display()
                );
                Err(error)
            }
        }
    }

    /// Report the canonical state of each given request.
    ///
    /// Identifiers unknown to the ledger map to [`JobState::Unknown`] without
    /// querying the backend; known identifiers are queried in one batch. The
    /// call fails only when the command transport fails as a whole; per-id
    /// problems are logged and reported as [`JobState::Unknown`].
    pub async fn status(
        &mut self,
        ids: &Set<RequestId>,
    ) -> crate::Result<Map<RequestId, JobState>> {
        let mut result = Map::with_capacity(ids.len());
        let known: Vec<RequestId> = ids
            .iter()
            .filter(|id| self.ledger.contains(id))
            .cloned()
            .collect();
        for id in ids {
            if !self.ledger.contains(id) {
                result.insert(id.clone(), JobState::Unknown);
            }
        }
        if known.is_empty() {
            return Ok(result);
        }

        let mut statuses = self.handler.get_status_of_requests(&known).await?;
        for id in known {
            let state = match statuses.remove(&id) {
                Some(Ok(status)) => self.ledger.observe(&id, &status),
                Some(Err(error)) => {
                    log::error!("Cannot get status of request {id}: {error}");
                    JobState::Unknown
                }
                None => {
                    log::warn!("Backend did not report status of request {id}");
                    JobState::Unknown
                }
            };
            result.insert(id, state);
        }
        Ok(result)
    }

    /// Cancel the given requests, best-effort and per-identifier.
    ///
    /// Returns one bool per input identifier in the same order, `true` iff
    /// the backend acknowledged the cancellation. A failure for one
    /// identifier never aborts processing of the rest.
    pub async fn cancel(&mut self, ids: &[RequestId]) -> Vec<bool> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.cancel_single(id).await);
        }
        results
    }

    async fn cancel_single(&mut self, id: &RequestId) -> bool {
        let Some(record) = self.ledger.get(id) else {
            return false;
        };
        if !record.is_active() {
            // The request already reached a terminal state through polling,
            // there is nothing left to cancel at the scheduler.
            log::debug!("Request {id} has already finished, dropping its record");
            self.ledger.release(id);
            return false;
        }
        match self.handler.cancel_request(id).await {
            Ok(()) => {
                self.ledger.release(id);
                log::info!("Cancelled request {id}");
                true
            }
            Err(error) => {
                log::warn!("Cancellation of request {id} failed: {error}");
                false
            }
        }
    }

    /// Start the auxiliary controller process workers connect back to.
    pub async fn start_controller(&mut self, config: &ControllerConfig) -> crate::Result<()> {
        self.ensure_live()?;
        if self.controller.is_some() {
            return Err(GridAllocError::GenericError(
                "controller is already running".to_string(),
            ));
        }
        self.controller = Some(Controller::start(config).await?);
        Ok(())
    }

    /// Stop the controller if this provider started one.
    pub async fn stop_controller(&mut self) -> crate::Result<()> {
        match self.controller.take() {
            Some(mut controller) => controller.stop().await,
            None => Ok(()),
        }
    }

    pub fn has_controller(&self) -> bool {
        self.controller.is_some()
    }

    /// Best-effort teardown of everything this provider created: cancels all
    /// requests that are still queued or running and stops the controller.
    ///
    /// Idempotent; afterwards the provider is inert (submissions fail,
    /// cancellations report `false`).
    pub async fn dispose(&mut self) {
        self.begin_dispose().run().await;
    }

    /// Split disposal into a synchronous part and a sweep future so that a
    /// provider shared behind a `RefCell` is never borrowed across an await.
    pub(crate) fn begin_dispose(&mut self) -> DisposeSweep {
        if self.disposed {
            return DisposeSweep::default();
        }
        self.disposed = true;

        let mut cancellations = Vec::new();
        for id in self.ledger.active_ids() {
            cancellations.push((id.clone(), self.handler.cancel_request(&id)));
        }
        self.ledger.clear();
        DisposeSweep {
            cancellations,
            controller: self.controller.take(),
        }
    }

    fn ensure_live(&self) -> crate::Result<()> {
        if self.disposed {
            return Err(GridAllocError::GenericError(
                "provider has already been disposed".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pending teardown work extracted from a provider.
#[derive(Default)]
pub(crate) struct DisposeSweep {
    cancellations: Vec<(
        RequestId,
        Pin<Box<dyn Future<Output = crate::Result<()>>>>,
    )>,
    controller: Option<Controller>,
}

impl DisposeSweep {
    /// Run the sweep. Failures are logged and ignored, teardown must never
    /// bring the process down.
    pub(crate) async fn run(self) {
        if self.cancellations.is_empty() && self.controller.is_none() {
            return;
        }
        log::debug!("Cancelling all outstanding requests");
        let (ids, futures): (Vec<_>, Vec<_>) = self.cancellations.into_iter().unzip();
        for (id, result) in ids.into_iter().zip(join_all(futures).await) {
            if let Err(error) = result {
                log::warn!("Failed to cancel request {id}: {error}");
            }
        }
        if let Some(mut controller) = self.controller {
            if let Err(error) = controller.stop().await {
                log::warn!("Failed to stop controller: {error}");
            }
        }
    }
}

/// Submit a held test request with the given site parameters and immediately
/// cancel it again, verifying that the scheduler accepts them.
pub async fn try_submit_request(
    manager: ManagerType,
    site: &SiteConfig,
    command: &str,
) -> crate::Result<()> {
    let tmpdir = TempDir::with_prefix("gridalloc")?;
    let mut handler = create_backend_handler(&manager, tmpdir.path().to_path_buf(), None)?;

    let spec = SubmitSpec {
        command: command.to_string(),
        units: 1,
        name: "dry-run".to_string(),
        timelimit: site.timelimit(),
        additional_args: site.additional_args().to_vec(),
    };
    let outcome = handler.submit_allocation(spec, SubmitMode::DryRun).await?;
    let id = outcome.into_id()?;
    handler.cancel_request(&id).await?;
    Ok(())
}
