use crate::alloc::provider::ExecutionProvider;
use crate::common::wrapped::WrappedRcRefCell;

/// Handle identifying one registration with the [`ShutdownCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardToken(u64);

type Entry = (GuardToken, WrappedRcRefCell<ExecutionProvider>);

/// Process-wide shutdown coordinator.
///
/// Providers register themselves at construction time and deregister when
/// they are explicitly disposed; `shutdown` tears down whatever is still
/// registered. The sweep is best-effort and idempotent, so it is safe to run
/// it both from an interrupt handler and from a regular shutdown path.
#[derive(Default)]
pub struct ShutdownCoordinator {
    entries: Vec<Entry>,
    next_token: u64,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&mut self, provider: WrappedRcRefCell<ExecutionProvider>) -> GuardToken {
        self.next_token += 1;
        let token = GuardToken(self.next_token);
        self.entries.push((token, provider));
        token
    }

    /// Remove a registration, e.g. because the provider was disposed
    /// explicitly. Returns false if the token is not registered (anymore).
    pub fn deregister(&mut self, token: GuardToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_token, _)| *entry_token != token);
        self.entries.len() != before
    }

    pub fn registered_count(&self) -> usize {
        self.entries.len()
    }

    /// Dispose every registered provider: cancel all requests that are still
    /// queued or running and stop their controllers. Failures are logged,
    /// never raised.
    pub async fn shutdown(&mut self) {
        let entries = self.take_entries();
        run_sweep(entries).await;
    }

    fn take_entries(&mut self) -> Vec<Entry> {
        std::mem::take(&mut self.entries)
    }
}

/// Dispose a shared provider without holding its borrow across an await
/// point.
pub async fn dispose_provider(provider: &WrappedRcRefCell<ExecutionProvider>) {
    let sweep = provider.get_mut().begin_dispose();
    sweep.run().await;
}

async fn run_sweep(entries: Vec<Entry>) {
    for (_, provider) in entries {
        dispose_provider(&provider).await;
    }
}

/// Wait for SIGINT and then tear down every provider registered with the
/// coordinator.
pub async fn shutdown_on_interrupt(coordinator: WrappedRcRefCell<ShutdownCoordinator>) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for SIGINT: {error}");
        return;
    }
    log::info!("Received SIGINT, attempting to stop all outstanding requests");
    let entries = coordinator.get_mut().take_entries();
    run_sweep(entries).await;
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::path::PathBuf;
    use std::pin::Pin;
    use std::time::Duration;

    use crate::Set;
    use crate::alloc::backend::{
        BackendCapabilities, BackendHandler, SiteConfig, StatusMap, SubmissionOutcome,
        SubmitMode, SubmitSpec,
    };
    use crate::alloc::guard::ShutdownCoordinator;
    use crate::alloc::provider::ExecutionProvider;
    use crate::alloc::state::RequestId;
    use crate::common::wrapped::WrappedRcRefCell;
    use crate::manager::info::ManagerType;

    struct CountingHandler {
        counter: WrappedRcRefCell<u64>,
        cancelled: WrappedRcRefCell<Set<RequestId>>,
    }

    impl BackendHandler for CountingHandler {
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                elastic_scaling: true,
                requires_channel: false,
            }
        }

        fn submit_allocation(
            &mut self,
            _spec: SubmitSpec,
            _mode: SubmitMode,
        ) -> Pin<Box<dyn Future<Output = crate::Result<SubmissionOutcome>>>> {
            let counter = self.counter.clone();
            Box::pin(async move {
                let mut counter = counter.get_mut();
                *counter += 1;
                Ok(SubmissionOutcome::new(
                    Ok(counter.to_string()),
                    PathBuf::default(),
                ))
            })
        }

        fn get_status_of_requests(
            &self,
            _ids: &[RequestId],
        ) -> Pin<Box<dyn Future<Output = crate::Result<StatusMap>>>> {
            Box::pin(async move { Ok(StatusMap::default()) })
        }

        fn cancel_request(
            &self,
            id: &RequestId,
        ) -> Pin<Box<dyn Future<Output = crate::Result<()>>>> {
            let cancelled = self.cancelled.clone();
            let id = id.clone();
            Box::pin(async move {
                cancelled.get_mut().insert(id);
                Ok(())
            })
        }
    }

    fn create_provider() -> (ExecutionProvider, WrappedRcRefCell<Set<RequestId>>) {
        let cancelled = WrappedRcRefCell::wrap(Set::new());
        let provider = ExecutionProvider::with_handler(
            ManagerType::Slurm,
            SiteConfig::new(Duration::from_secs(60), vec![]),
            Box::new(CountingHandler {
                counter: WrappedRcRefCell::wrap(0),
                cancelled: cancelled.clone(),
            }),
        );
        (provider, cancelled)
    }

    #[tokio::test]
    async fn shutdown_disposes_registered_providers() {
        let mut coordinator = ShutdownCoordinator::new();
        let (mut provider, cancelled) = create_provider();

        let first = provider.submit("worker start", 1, "worker").await.unwrap();
        let second = provider.submit("worker start", 1, "worker").await.unwrap();

        let provider = WrappedRcRefCell::wrap(provider);
        coordinator.register(provider.clone());

        coordinator.shutdown().await;
        assert_eq!(coordinator.registered_count(), 0);
        {
            let cancelled = cancelled.get();
            assert!(cancelled.contains(&first));
            assert!(cancelled.contains(&second));
        }
        assert_eq!(provider.get().current_capacity(), 0);

        // Second sweep has nothing left to do.
        coordinator.shutdown().await;
        assert_eq!(cancelled.get().len(), 2);
    }

    #[tokio::test]
    async fn deregistered_provider_is_not_swept() {
        let mut coordinator = ShutdownCoordinator::new();
        let (mut kept, kept_cancelled) = create_provider();
        let (mut removed, removed_cancelled) = create_provider();

        kept.submit("worker start", 1, "worker").await.unwrap();
        removed.submit("worker start", 1, "worker").await.unwrap();

        coordinator.register(WrappedRcRefCell::wrap(kept));
        let removed = WrappedRcRefCell::wrap(removed);
        let token = coordinator.register(removed.clone());

        assert!(coordinator.deregister(token));
        assert!(!coordinator.deregister(token));

        coordinator.shutdown().await;
        assert_eq!(kept_cancelled.get().len(), 1);
        assert!(removed_cancelled.get().is_empty());
        assert_eq!(removed.get().current_capacity(), 1);
    }
}
