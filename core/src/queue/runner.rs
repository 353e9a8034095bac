use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{MaintenanceTask, QueueEntry, TaskQueue};
use crate::config::QueueConfig;
use crate::errors::{QueueResult, StoreError};
use crate::store::{Lease, LockManager, Repository};

/// Result of one [`QueueRunner::run_cycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The lock was acquired but nothing was queued
    Empty,
    /// Another node holds the update lock
    LockContended,
    /// Every queued descriptor was processed and moved to history
    Drained { executed: usize, failed: usize },
}

/// Drains the queue under the cluster-wide update lock.
pub struct QueueRunner {
    queue: TaskQueue,
    tasks: HashMap<String, Arc<dyn MaintenanceTask>>,
}

impl QueueRunner {
    pub fn new(repository: Arc<Repository>, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        let queue = TaskQueue::new(repository, config);
        queue.ensure_layout()?;
        Ok(Self {
            queue,
            tasks: HashMap::new(),
        })
    }

    /// Register the task for its kind, replacing any previous one.
    pub fn with_task(mut self, task: Arc<dyn MaintenanceTask>) -> Self {
        self.tasks.insert(task.kind().to_string(), task);
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn config(&self) -> &QueueConfig {
        self.queue.config()
    }

    pub fn repository(&self) -> &Arc<Repository> {
        self.queue.repository()
    }

    /// Acquire the update lock without waiting and drain the queue.
    ///
    /// The lease is kept alive while tasks run and released afterwards if this
    /// node still owns it.
    pub async fn run_cycle(&self) -> QueueResult<CycleOutcome> {
        let config = self.config();
        let repository = self.repository();

        let lease = match repository.try_lock(
            &config.update_path,
            config.lease_seconds,
            &config.cluster_node_id,
        ) {
            Ok(lease) => lease,
            Err(StoreError::AlreadyLocked(path)) => {
                debug!(
                    path = %path,
                    node = %config.cluster_node_id,
                    "Update lock held by another node, skipping cycle"
                );
                return Ok(CycleOutcome::LockContended);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            node = %config.cluster_node_id,
            token = %lease.token,
            "Update lock acquired"
        );

        let (stop_tx, keep_alive) = self.spawn_keep_alive(lease.clone());
        let drained = self.drain().await;

        let _ = stop_tx.send(());
        if let Err(e) = keep_alive.await {
            warn!("Keep-alive task ended abnormally: {}", e);
        }

        match repository.unlock(&lease) {
            Ok(()) => debug!(node = %config.cluster_node_id, "Update lock released"),
            Err(StoreError::LockLost(path)) => warn!(
                path = %path,
                node = %config.cluster_node_id,
                "Update lock was lost before release"
            ),
            Err(e) => warn!("Failed to release update lock: {}", e),
        }

        let (executed, failed) = drained?;
        if executed == 0 {
            return Ok(CycleOutcome::Empty);
        }
        info!(executed, failed, "Task queue drained");
        Ok(CycleOutcome::Drained { executed, failed })
    }

    /// Run and archive queued entries until the queue is empty.
    async fn drain(&self) -> QueueResult<(usize, usize)> {
        let mut executed = 0;
        let mut failed = 0;

        while let Some(entry) = self.queue.head()? {
            if !self.execute(&entry).await {
                failed += 1;
            }
            self.queue.archive(&entry)?;
            executed += 1;
        }
        Ok((executed, failed))
    }

    /// Returns `false` when the entry could not be run successfully.
    async fn execute(&self, entry: &QueueEntry) -> bool {
        let descriptor = match &entry.descriptor {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(path = %entry.path, "{}", e);
                return false;
            }
        };

        let Some(task) = self.tasks.get(&descriptor.kind) else {
            warn!(
                task = %entry.name,
                kind = %descriptor.kind,
                "No maintenance task registered for kind"
            );
            return false;
        };

        debug!(task = %entry.name, kind = %descriptor.kind, "Running maintenance task");
        match task.run(descriptor, self.repository()).await {
            Ok(()) => {
                info!(task = %entry.name, kind = %descriptor.kind, "Maintenance task completed");
                true
            }
            Err(e) => {
                error!(
                    task = %entry.name,
                    kind = %descriptor.kind,
                    "Maintenance task failed: {:#}",
                    e
                );
                false
            }
        }
    }

    fn spawn_keep_alive(&self, lease: Lease) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let repository = Arc::clone(self.repository());
        let period = Duration::from_secs(self.config().keep_alive_seconds);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => match repository.refresh_lease(&lease) {
                        Ok(renewed) => debug!(
                            path = %renewed.path,
                            expires_at = %renewed.expires_at,
                            renewals = renewed.renewal_count,
                            "Update lease renewed"
                        ),
                        Err(e) => {
                            warn!("Keep-alive stopped: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        (stop_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::QueueError;
    use crate::queue::TaskDescriptor;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Map;

    struct Recording {
        kind: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl MaintenanceTask for Recording {
        fn kind(&self) -> &str {
            self.kind
        }

        async fn run(&self, descriptor: &TaskDescriptor, _repository: &Arc<Repository>) -> anyhow::Result<()> {
            self.seen.lock().push(descriptor.name.clone());
            if self.fail {
                anyhow::bail!("{} exploded", descriptor.name);
            }
            Ok(())
        }
    }

    fn runner(seen: &Arc<Mutex<Vec<String>>>) -> QueueRunner {
        QueueRunner::new(Repository::new(), QueueConfig::default())
            .unwrap()
            .with_task(Arc::new(Recording {
                kind: "reindex",
                seen: Arc::clone(seen),
                fail: false,
            }))
            .with_task(Arc::new(Recording {
                kind: "broken",
                seen: Arc::clone(seen),
                fail: true,
            }))
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&seen);

        assert_eq!(runner.run_cycle().await.unwrap(), CycleOutcome::Empty);
        assert!(!runner.repository().is_locked("/update"));
    }

    #[tokio::test]
    async fn test_drains_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&seen);
        runner.queue().enqueue("a", "reindex", Map::new()).unwrap();
        runner.queue().enqueue("b", "reindex", Map::new()).unwrap();

        let outcome = runner.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Drained { executed: 2, failed: 0 });
        assert_eq!(*seen.lock(), vec!["a", "b"]);
        assert!(runner.queue().pending().unwrap().is_empty());
        assert!(!runner.repository().is_locked("/update"));
    }

    #[tokio::test]
    async fn test_failures_still_move_to_history() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&seen);
        runner.queue().enqueue("boom", "broken", Map::new()).unwrap();
        runner.queue().enqueue("mystery", "unknown-kind", Map::new()).unwrap();
        runner.queue().enqueue("fine", "reindex", Map::new()).unwrap();

        let outcome = runner.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Drained { executed: 3, failed: 2 });

        let history: Vec<String> = runner
            .queue()
            .history()
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(history, vec!["boom-1", "mystery-1", "fine-1"]);
    }

    #[test]
    fn test_rejects_invalid_lease_timing() {
        let zero_keep_alive = QueueConfig {
            keep_alive_seconds: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(
            QueueRunner::new(Repository::new(), zero_keep_alive),
            Err(QueueError::Config(_))
        ));

        let keep_alive_past_lease = QueueConfig {
            lease_seconds: 30,
            keep_alive_seconds: 30,
            ..QueueConfig::default()
        };
        let repo = Repository::new();
        assert!(matches!(
            QueueRunner::new(Arc::clone(&repo), keep_alive_past_lease),
            Err(QueueError::Config(_))
        ));
        // nothing is created for a rejected configuration
        assert!(!repo.exists("/update"));
    }

    #[tokio::test]
    async fn test_contended_lock_skips_cycle() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&seen);
        runner.queue().enqueue("a", "reindex", Map::new()).unwrap();

        let held = runner.repository().try_lock("/update", 120, "other-node").unwrap();
        assert_eq!(runner.run_cycle().await.unwrap(), CycleOutcome::LockContended);
        assert!(seen.lock().is_empty());
        assert_eq!(runner.queue().pending().unwrap().len(), 1);

        runner.repository().unlock(&held).unwrap();
        assert_eq!(
            runner.run_cycle().await.unwrap(),
            CycleOutcome::Drained { executed: 1, failed: 0 }
        );
    }

    struct Slow {
        renewals: Arc<Mutex<Option<u32>>>,
    }

    #[async_trait]
    impl MaintenanceTask for Slow {
        fn kind(&self) -> &str {
            "slow"
        }

        async fn run(&self, _descriptor: &TaskDescriptor, repository: &Arc<Repository>) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(61)).await;
            *self.renewals.lock() = repository.get_lock("/update").map(|l| l.renewal_count);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_renews_lease_during_long_task() {
        let renewals = Arc::new(Mutex::new(None));
        let runner = QueueRunner::new(Repository::new(), QueueConfig::default())
            .unwrap()
            .with_task(Arc::new(Slow {
                renewals: Arc::clone(&renewals),
            }));
        runner.queue().enqueue("long", "slow", Map::new()).unwrap();

        runner.run_cycle().await.unwrap();
        assert_eq!(*renewals.lock(), Some(1));
    }
}
