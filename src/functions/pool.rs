use crate::functions::dispatch::ClaimDispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Runs dispatches as independent tasks, at most `max_in_flight` at a time.
///
/// Submission never blocks: the task is spawned immediately and waits for a
/// permit on its own. Tasks are tracked so shutdown can wait for them.
pub struct DispatchPool {
    dispatcher: ClaimDispatcher,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl DispatchPool {
    pub fn new(dispatcher: ClaimDispatcher, max_in_flight: usize) -> Self {
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tasks: JoinSet::new(),
        }
    }

    pub fn submit(&mut self, id: i64) {
        self.reap();

        let dispatcher = self.dispatcher.clone();
        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                if let Err(e) = dispatcher.dispatch(id).await {
                    tracing::error!(outbox_id = id, error = %e, "outbox dispatch failed");
                }
            }
            .in_current_span(),
        );
    }

    /// Submits every pending row in ascending id order and returns how many.
    pub async fn drain_pending(&mut self) -> anyhow::Result<usize> {
        let ids = self.dispatcher.store().pending_ids().await?;
        for &id in &ids {
            self.submit(id);
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "processing pending outbox messages");
        }
        Ok(ids.len())
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub async fn wait_idle(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            log_join_error(result);
        }
    }

    /// Waits up to `grace` for in-flight dispatches. Whatever is still running
    /// afterwards is detached, not aborted, and the count is returned.
    pub async fn shutdown(mut self, grace: Duration) -> usize {
        let in_flight = self.tasks.len();
        if in_flight == 0 {
            return 0;
        }

        tracing::info!(
            in_flight,
            grace_ms = grace.as_millis() as u64,
            "waiting for in-flight outbox dispatches"
        );
        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return 0;
        }

        let remaining = self.tasks.len();
        tracing::warn!(
            remaining,
            "shutdown grace elapsed, leaving outbox dispatches to finish in background"
        );
        self.tasks.detach_all();
        remaining
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_join_error(result);
        }
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result
        && e.is_panic()
    {
        tracing::error!(error = %e, "outbox dispatch task panicked");
    }
}
