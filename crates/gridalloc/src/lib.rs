#![deny(clippy::await_holding_refcell_ref)]

pub mod alloc;
pub mod common;
pub mod manager;

pub type Error = crate::common::error::GridAllocError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = hashbrown::HashMap<K, V>;
pub type Set<T> = hashbrown::HashSet<T>;

// Reexports
pub use alloc::{ExecutionProvider, JobState, RequestId, ShutdownCoordinator};
pub use common::wrapped::WrappedRcRefCell;
pub use manager::info::ManagerType;
