//! This module implements capacity provisioning on top of external batch
//! schedulers. A provider submits allocation requests into SGE/Slurm/PBS in
//! response to the demands of a task-execution runtime, tracks their
//! lifecycle in a ledger and tears everything down again on shutdown.
//!
//! The term `request` represents one scheduler job in this module, to
//! distinguish it from the jobs of the runtime sitting on top.
pub mod backend;
pub mod controller;
pub mod guard;
pub mod provider;
pub mod state;

pub use backend::{BackendCapabilities, BackendHandler, SiteConfig, create_backend_handler};
pub use controller::{Controller, ControllerConfig, ControllerConfigBuilder};
pub use guard::{GuardToken, ShutdownCoordinator, dispose_provider, shutdown_on_interrupt};
pub use provider::{ExecutionProvider, try_submit_request};
pub use state::{JobRecord, JobState, RequestId, ResourceLedger};
