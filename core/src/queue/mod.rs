//! Cluster task queue.
//!
//! Maintenance work is described by [`TaskDescriptor`] nodes appended under
//! `<update>/<queue>`. Exactly one cluster node at a time drains the queue: it
//! holds a lease lock on `<update>` while it runs each descriptor's
//! [`MaintenanceTask`] and moves the descriptor to `<update>/<history>` as
//! `<name>-<n>`.
//!
//! - [`TaskQueue`] appends and inspects descriptors.
//! - [`QueueRunner`] performs one locked drain cycle.
//! - [`QueueWorker`] runs cycles on a tokio task, at startup and whenever a
//!   descriptor appears.

mod runner;
mod worker;

pub use runner::{CycleOutcome, QueueRunner};
pub use worker::QueueWorker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::errors::{QueueError, QueueResult, StoreError};
use crate::store::{Repository, Session};

/// Node type of a queued task descriptor.
pub const NT_TASK: &str = "docflow:task";

/// A unit of queued maintenance work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    /// Selects the [`MaintenanceTask`] that runs this descriptor
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
    pub enqueued_by: String,
}

impl TaskDescriptor {
    fn to_properties(&self) -> QueueResult<Map<String, Value>> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(QueueError::MalformedDescriptor {
                path: self.name.clone(),
                reason: "descriptor is not an object".to_string(),
            }),
            Err(e) => Err(QueueError::MalformedDescriptor {
                path: self.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn from_properties(path: &str, properties: &Map<String, Value>) -> QueueResult<Self> {
        serde_json::from_value(Value::Object(properties.clone())).map_err(|e| {
            QueueError::MalformedDescriptor {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Work executed for a queued descriptor of a given kind.
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    /// Descriptor kind this task handles.
    fn kind(&self) -> &str;

    async fn run(&self, descriptor: &TaskDescriptor, repository: &Arc<Repository>) -> anyhow::Result<()>;
}

/// The head of the queue as seen by a runner.
#[derive(Debug)]
pub struct QueueEntry {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub descriptor: QueueResult<TaskDescriptor>,
}

/// Queue and history nodes below the update root.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    repository: Arc<Repository>,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(repository: Arc<Repository>, config: QueueConfig) -> Self {
        Self { repository, config }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn session(&self) -> Session {
        self.repository.session(&self.config.cluster_node_id)
    }

    /// Create the update root with its queue and history folders.
    pub fn ensure_layout(&self) -> QueueResult<()> {
        let mut session = self.session();
        session.ensure_path(&self.config.queue_path())?;
        session.ensure_path(&self.config.history_path())?;
        if !session.has_pending_changes() {
            return Ok(());
        }
        match session.save() {
            Ok(()) => {
                debug!(update_path = %self.config.update_path, "Queue layout created");
                Ok(())
            }
            // another node created it first
            Err(StoreError::Conflict(_) | StoreError::ItemExists(_))
                if self.repository.exists(&self.config.queue_path())
                    && self.repository.exists(&self.config.history_path()) =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Append a descriptor. Pending names are unique; `ItemExists` otherwise.
    pub fn enqueue(&self, name: &str, kind: &str, params: Map<String, Value>) -> QueueResult<TaskDescriptor> {
        let descriptor = TaskDescriptor {
            name: name.to_string(),
            kind: kind.to_string(),
            params,
            enqueued_at: self.repository.now(),
            enqueued_by: self.config.cluster_node_id.clone(),
        };
        let properties = descriptor.to_properties()?;

        let queue_path = self.config.queue_path();
        let mut session = self.session();
        session.ensure_path(&queue_path)?;
        session.add_node(&queue_path, name, NT_TASK, properties)?;
        session.save()?;

        info!(task = %name, kind = %kind, "Maintenance task enqueued");
        Ok(descriptor)
    }

    /// Pending descriptors in queue order.
    pub fn pending(&self) -> QueueResult<Vec<TaskDescriptor>> {
        self.listing(&self.config.queue_path())
            .map(|entries| entries.into_iter().map(|(_, d)| d).collect())
    }

    /// Archived descriptors with their history node names, oldest first.
    pub fn history(&self) -> QueueResult<Vec<(String, TaskDescriptor)>> {
        self.listing(&self.config.history_path())
    }

    fn listing(&self, path: &str) -> QueueResult<Vec<(String, TaskDescriptor)>> {
        let session = self.session();
        if !session.exists(path) {
            return Ok(Vec::new());
        }
        session
            .children(path)?
            .into_iter()
            .filter(|node| node.node_type == NT_TASK)
            .map(|node| {
                let descriptor = TaskDescriptor::from_properties(&node.path, &node.properties)?;
                Ok((node.name, descriptor))
            })
            .collect()
    }

    /// First pending descriptor, if any.
    pub fn head(&self) -> QueueResult<Option<QueueEntry>> {
        let queue_path = self.config.queue_path();
        let session = self.session();
        if !session.exists(&queue_path) {
            return Ok(None);
        }
        let head = session
            .children(&queue_path)?
            .into_iter()
            .find(|node| node.node_type == NT_TASK);

        Ok(head.map(|node| QueueEntry {
            descriptor: TaskDescriptor::from_properties(&node.path, &node.properties),
            id: node.id,
            name: node.name,
            path: node.path,
        }))
    }

    /// Move a processed entry into history as `<name>-<n>`. Returns the new path.
    pub fn archive(&self, entry: &QueueEntry) -> QueueResult<String> {
        let history_path = self.config.history_path();
        let mut session = self.session();
        session.ensure_path(&history_path)?;

        let next = session
            .children(&history_path)?
            .iter()
            .filter_map(|node| history_index(&node.name, &entry.name))
            .max()
            .unwrap_or(0)
            + 1;
        let archived_name = format!("{}-{}", entry.name, next);

        session.move_node(entry.id, &history_path, &archived_name)?;
        session.save()?;

        let archived = format!("{}/{}", history_path, archived_name);
        debug!(from = %entry.path, to = %archived, "Task moved to history");
        Ok(archived)
    }
}

/// `n` when `node_name` is `<name>-<n>`.
fn history_index(node_name: &str, name: &str) -> Option<u64> {
    node_name
        .strip_prefix(name)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> TaskQueue {
        let queue = TaskQueue::new(Repository::new(), QueueConfig::default());
        queue.ensure_layout().unwrap();
        queue
    }

    #[test]
    fn test_history_index() {
        assert_eq!(history_index("reindex-3", "reindex"), Some(3));
        assert_eq!(history_index("reindex-all-3", "reindex"), None);
        assert_eq!(history_index("reindex", "reindex"), None);
        assert_eq!(history_index("other-1", "reindex"), None);
    }

    #[test]
    fn test_enqueue_keeps_order_and_params() {
        let queue = queue();
        let params = json!({ "path": "/content/news" }).as_object().cloned().unwrap();
        queue.enqueue("first", "reindex", params).unwrap();
        queue.enqueue("second", "cleanup", Map::new()).unwrap();

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].name, "first");
        assert_eq!(pending[0].params["path"], "/content/news");
        assert_eq!(pending[0].enqueued_by, "default");
        assert_eq!(pending[1].kind, "cleanup");

        let head = queue.head().unwrap().unwrap();
        assert_eq!(head.name, "first");
        assert_eq!(head.path, "/update/queue/first");
    }

    #[test]
    fn test_duplicate_pending_name_rejected() {
        let queue = queue();
        queue.enqueue("job", "reindex", Map::new()).unwrap();
        assert!(matches!(
            queue.enqueue("job", "reindex", Map::new()),
            Err(QueueError::Store(StoreError::ItemExists(_)))
        ));
    }

    #[test]
    fn test_archive_numbers_history_entries() {
        let queue = queue();

        for _ in 0..3 {
            queue.enqueue("job", "reindex", Map::new()).unwrap();
            let head = queue.head().unwrap().unwrap();
            queue.archive(&head).unwrap();
        }

        let names: Vec<String> = queue.history().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["job-1", "job-2", "job-3"]);
        assert!(queue.pending().unwrap().is_empty());
        assert!(queue.head().unwrap().is_none());
    }

    #[test]
    fn test_ensure_layout_is_idempotent() {
        let queue = queue();
        queue.ensure_layout().unwrap();
        assert!(queue.repository().exists("/update/queue"));
        assert!(queue.repository().exists("/update/history"));
    }
}
