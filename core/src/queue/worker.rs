use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CycleOutcome, QueueRunner};
use crate::errors::{QueueError, QueueResult};
use crate::store::NodeEvent;

/// Background task that runs queue cycles for this node.
///
/// A cycle runs once at startup (unless disabled in the queue config), after
/// each descriptor added under the queue path, and on [`QueueWorker::trigger`].
/// Triggers arriving during a cycle coalesce into one follow-up cycle.
pub struct QueueWorker {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub fn spawn(runner: Arc<QueueRunner>) -> Self {
        let (trigger_tx, mut trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        // subscribe before spawning so nothing enqueued from here on is missed
        let mut events = runner.repository().subscribe();
        let prefix = format!("{}/", runner.config().queue_path());

        let handle = tokio::spawn(async move {
            info!(node = %runner.config().cluster_node_id, "Queue worker started");
            if runner.config().run_on_startup {
                run_logged(&runner).await;
            }

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Queue worker shutting down");
                        break;
                    }
                    Some(()) = trigger_rx.recv() => run_logged(&runner).await,
                    event = events.recv() => match event {
                        Ok(NodeEvent::Added { path, .. }) if path.starts_with(&prefix) => {
                            debug!(path = %path, "Task descriptor added");
                            run_logged(&runner).await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Queue worker missed store events");
                            run_logged(&runner).await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("Queue worker stopped");
        });

        Self {
            trigger_tx,
            shutdown_tx,
            handle,
        }
    }

    /// Request a cycle. A request already pending absorbs this one.
    pub fn trigger(&self) -> QueueResult<()> {
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(QueueError::WorkerStopped),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop after the current cycle, if any, and wait for the worker to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!("Queue worker panicked: {}", e);
        }
    }
}

async fn run_logged(runner: &QueueRunner) {
    match runner.run_cycle().await {
        Ok(CycleOutcome::Drained { executed, failed }) => {
            debug!(executed, failed, "Queue cycle finished")
        }
        Ok(outcome) => debug!(?outcome, "Queue cycle finished"),
        Err(e) => error!("Queue cycle failed: {}", e),
    }
}
