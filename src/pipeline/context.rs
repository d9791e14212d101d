//! Pipeline context: shared state handed to every stage of a run.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::Sleeper;
use crate::config::Config;
use crate::error::Result;
use crate::rapi::ArchiveClient;
use crate::recorder::ResultRecorder;
use crate::retry::{retry_with_backoff, with_timeout};
use crate::store::{RecordStore, SharedStore};
use crate::types::Event;

/// Shared context for one run, reducing parameter passing between stages.
pub(crate) struct PipelineContext {
    pub(crate) config: Arc<Config>,
    pub(crate) client: Arc<dyn ArchiveClient>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) store: SharedStore,
    pub(crate) recorder: ResultRecorder,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    pub(crate) cancel: CancellationToken,
}

impl PipelineContext {
    /// Publish an event; having no subscribers is fine.
    pub(super) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Write a snapshot of a store the caller already holds locked.
    ///
    /// A failed write is logged and the run continues; the next snapshot
    /// replaces the table anyway. Callers keep the store locked across the
    /// write, which keeps snapshots in order.
    pub(super) async fn save(&self, store: &RecordStore) {
        if let Err(e) = self.persist(store).await {
            tracing::error!(
                path = %self.recorder.path().display(),
                error = %e,
                "Failed to save results table"
            );
        }
    }

    /// Write a snapshot and report failure to the caller.
    pub(super) async fn persist(&self, store: &RecordStore) -> Result<()> {
        self.recorder.write(store.clone()).await?;
        self.emit(Event::ResultsSaved {
            path: self.recorder.path().to_path_buf(),
        });
        Ok(())
    }

    /// Lock the store and write a snapshot.
    pub(super) async fn snapshot(&self) {
        let store = self.store.lock().await;
        self.save(&store).await;
    }

    /// Run one remote call under its timeout and the shared retry policy.
    pub(super) async fn remote<T, F, Fut>(
        &self,
        operation: &'static str,
        limit: Duration,
        call: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.retrying(operation, || with_timeout(limit, operation, call()))
            .await
    }

    /// Run a call under the shared retry policy only; the call bounds its own waits.
    pub(super) async fn retrying<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        retry_with_backoff(
            &self.config.retry,
            self.sleeper.as_ref(),
            &self.cancel,
            operation,
            call,
        )
        .await
    }
}
