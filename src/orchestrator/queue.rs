use super::operation::{Operation, OperationKind, OperationResult};
use crate::models::{AppName, OperationId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, sleep_until, timeout};

/// Hands state-change requests to the single orchestrator worker and keeps
/// finished results around for callers to poll. Cheap to clone; all clones
/// share the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pending: Mutex<VecDeque<Operation>>,
    results: Mutex<HashMap<OperationId, (DateTime<Utc>, OperationResult)>>,
    notify: Notify,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(VecDeque::new()),
                results: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    fn enqueue(&self, kind: OperationKind) -> OperationId {
        let id = OperationId::new();
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.push_back(Operation { id, kind });
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Notify about new operation: {id}.");
        }
        self.inner.notify.notify_one();
        id
    }

    pub fn enqueue_install(
        &self,
        app: AppName,
        choices: BTreeMap<String, AppName>,
    ) -> OperationId {
        self.enqueue(OperationKind::Install { app, choices })
    }

    pub fn enqueue_uninstall(&self, app: AppName) -> OperationId {
        self.enqueue(OperationKind::Uninstall { app })
    }

    pub fn enqueue_reconcile(&self) -> OperationId {
        self.enqueue(OperationKind::Reconcile)
    }

    /// Parks the worker until a new operation arrives, with a periodic wake
    /// as a safety net.
    pub async fn wait_for_work(&self) {
        tokio::select! {
            _ = self.inner.notify.notified() => {
                log::debug!("Got notified about new items in the queue.");
            }
            _ = sleep(Duration::from_secs(30)) => {
                log::debug!("Regular queue check.");
            }
        }
    }

    /// Snapshots and clears the pending list. The worker calls this after
    /// the batch window so concurrent requests land in one transaction.
    pub fn drain_pending(&self) -> Vec<Operation> {
        self.inner
            .pending
            .lock()
            .map(|mut pending| pending.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn record_result(&self, ids: &[OperationId], result: &OperationResult) {
        if let Ok(mut results) = self.inner.results.lock() {
            let now = Utc::now();
            for id in ids {
                results.insert(*id, (now, result.clone()));
            }
        }
    }

    pub fn peek_result(&self, id: &OperationId) -> Option<OperationResult> {
        self.inner
            .results
            .lock()
            .ok()
            .and_then(|results| results.get(id).map(|(_, result)| result.clone()))
    }

    /// Polls for the result of an operation until `wait_timeout` elapses.
    pub async fn try_wait_for_operation(
        &self,
        id: &OperationId,
        wait_timeout: Duration,
    ) -> Option<OperationResult> {
        let interval = Duration::from_millis(100);

        let mut interval_timer = tokio::time::interval(interval);
        let start_time = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    match timeout(wait_timeout, async { self.peek_result(id) }).await {
                        Ok(Some(result)) => return Some(result),
                        Ok(None) => continue,
                        Err(err) => {
                            log::debug!("Did not receive result within {} sec: {err}", wait_timeout.as_secs());
                            break;
                        }
                    }
                }
                _ = sleep_until(start_time + wait_timeout) => {
                    log::debug!("Timeout reached, stopping querying the queue");
                    break;
                }
            }
        }

        None
    }

    pub fn prune_results(&self, older_than: DateTime<Utc>) -> usize {
        self.inner
            .results
            .lock()
            .map(|mut results| {
                let before = results.len();
                results.retain(|_, (finished_at, _)| *finished_at >= older_than);
                before - results.len()
            })
            .unwrap_or(0)
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::operation::OperationOutcome;
    use super::*;
    use chrono::TimeDelta;
    use std::str::FromStr;

    #[test]
    fn drain_empties_the_pending_list() {
        let queue = OperationQueue::new();
        queue.enqueue_install(AppName::from_str("app-x").unwrap(), BTreeMap::new());
        queue.enqueue_reconcile();

        assert_eq!(queue.drain_pending().len(), 2);
        assert!(queue.drain_pending().is_empty());
    }

    #[tokio::test]
    async fn results_are_pollable_per_operation() {
        let queue = OperationQueue::new();
        let id = queue.enqueue_reconcile();
        assert_eq!(queue.peek_result(&id), None);

        let result = Ok(OperationOutcome {
            rebuild_id: None,
            apps: Vec::new(),
        });
        queue.record_result(&[id], &result);

        assert_eq!(queue.peek_result(&id), Some(result.clone()));
        assert_eq!(
            queue
                .try_wait_for_operation(&id, Duration::from_secs(1))
                .await,
            Some(result)
        );
    }

    #[tokio::test]
    async fn waiting_for_an_unknown_operation_times_out() {
        let queue = OperationQueue::new();
        let id = OperationId::new();

        assert_eq!(
            queue
                .try_wait_for_operation(&id, Duration::from_millis(250))
                .await,
            None
        );
    }

    #[test]
    fn old_results_are_pruned() {
        let queue = OperationQueue::new();
        let id = queue.enqueue_reconcile();
        queue.record_result(
            &[id],
            &Ok(OperationOutcome {
                rebuild_id: None,
                apps: Vec::new(),
            }),
        );

        assert_eq!(queue.prune_results(Utc::now() - TimeDelta::hours(1)), 0);
        assert_eq!(queue.prune_results(Utc::now() + TimeDelta::hours(1)), 1);
        assert_eq!(queue.peek_result(&id), None);
    }
}
