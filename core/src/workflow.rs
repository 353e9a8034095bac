//! Document workflow façade
//!
//! [`DocumentWorkflow`] exposes the lifecycle operations of one document
//! handle for one user. Every operation opens a fresh session, projects the
//! handle, fires the matching event and either saves the session or discards
//! it. [`hints`](DocumentWorkflow::hints) reports which operations would
//! currently succeed, without side effects.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::WorkflowContext;
use crate::definition::StateMachineDefinition;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::executor::{FireOutcome, StateMachineExecutor};
use crate::expression::ExpressionEvaluator;
use crate::model::{DocumentHandle, DocumentVariant};
use crate::registry::DefinitionRegistry;
use crate::store::{ContentHandle, HandleSession, Repository, Version};

/// Event names of the document lifecycle operations
pub mod ops {
    pub const OBTAIN_EDITABLE_INSTANCE: &str = "obtain_editable_instance";
    pub const COMMIT_EDITABLE_INSTANCE: &str = "commit_editable_instance";
    pub const DISPOSE_EDITABLE_INSTANCE: &str = "dispose_editable_instance";
    pub const UNLOCK: &str = "unlock";
    pub const PUBLISH: &str = "publish";
    pub const DEPUBLISH: &str = "depublish";
    pub const REQUEST_PUBLICATION: &str = "request_publication";
    pub const REQUEST_DEPUBLICATION: &str = "request_depublication";
    pub const SCHEDULE_PUBLICATION: &str = "schedule_publication";
    pub const SCHEDULE_DEPUBLICATION: &str = "schedule_depublication";
    pub const ACCEPT_REQUEST: &str = "accept_request";
    pub const REJECT_REQUEST: &str = "reject_request";
    pub const CANCEL_REQUEST: &str = "cancel_request";
    pub const RENAME: &str = "rename";
    pub const VERSION: &str = "version";
    pub const RESTORE_VERSION_TO: &str = "restore_version_to";
}

/// Whether a missing transition is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invocation {
    /// Caller asked for the operation; no transition is `NotAllowed`
    Explicit,
    /// Notification; no transition is a silent no-op
    Advisory,
}

/// Lifecycle operations on one document handle, acting as one user.
pub struct DocumentWorkflow {
    definition: Arc<StateMachineDefinition>,
    evaluator: ExpressionEvaluator,
    repository: Arc<Repository>,
    handle_path: RwLock<String>,
    user: String,
}

impl DocumentWorkflow {
    pub fn new(
        definition: Arc<StateMachineDefinition>,
        evaluator: ExpressionEvaluator,
        repository: Arc<Repository>,
        handle_path: &str,
        user: &str,
    ) -> Self {
        Self {
            definition,
            evaluator,
            repository,
            handle_path: RwLock::new(handle_path.to_string()),
            user: user.to_string(),
        }
    }

    /// Workflow driven by the registry's definition named `definition`.
    pub fn from_registry(
        registry: &DefinitionRegistry,
        definition: &str,
        repository: Arc<Repository>,
        handle_path: &str,
        user: &str,
    ) -> WorkflowResult<Self> {
        let definition = registry.get(definition)?;
        Ok(Self::new(
            definition,
            ExpressionEvaluator::new(),
            repository,
            handle_path,
            user,
        ))
    }

    /// Current path of the handle; follows successful renames.
    pub fn handle_path(&self) -> String {
        self.handle_path.read().clone()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn definition(&self) -> &StateMachineDefinition {
        &self.definition
    }

    // ========================================================================
    // HINTS
    // ========================================================================

    /// Availability of every operation declared in the definition, plus the
    /// `info` values of the current state. Never fails: if the handle cannot
    /// be read every operation is reported unavailable.
    pub fn hints(&self) -> BTreeMap<String, Value> {
        let mut hints: BTreeMap<String, Value> = self
            .definition
            .events()
            .into_iter()
            .map(|event| (event, Value::Bool(false)))
            .collect();

        match self.compute_hints() {
            Ok(computed) => hints.extend(computed),
            Err(e) => {
                debug!(path = %self.handle_path(), user = %self.user, error = %e, "Hints unavailable");
            }
        }
        hints
    }

    fn compute_hints(&self) -> WorkflowResult<BTreeMap<String, Value>> {
        let mut session = self.repository.session(&self.user);
        let path = self.handle_path();
        let handle = session.handle(&path)?;
        let ctx = WorkflowContext::new(&self.user, DocumentHandle::project(&handle)?)
            .with_now(handle.now());
        let executor = StateMachineExecutor::new(&self.definition, &self.evaluator);

        let state = executor.settle(&ctx)?;
        let mut hints: BTreeMap<String, Value> = executor
            .enabled_events(&ctx)?
            .into_iter()
            .map(|event| (event, Value::Bool(true)))
            .collect();
        for (key, value) in executor.info(&state, &ctx)? {
            hints.entry(key).or_insert(value);
        }
        Ok(hints)
    }

    // ========================================================================
    // GENERIC INVOCATION
    // ========================================================================

    /// Fire `event`; fails with `NotAllowed` if no transition is enabled.
    pub fn trigger(&self, event: &str, payload: Map<String, Value>) -> WorkflowResult<Option<Value>> {
        self.invoke(event, payload, Invocation::Explicit)
    }

    /// Fire `event` if some transition accepts it; otherwise do nothing.
    pub fn notify(&self, event: &str, payload: Map<String, Value>) -> WorkflowResult<Option<Value>> {
        self.invoke(event, payload, Invocation::Advisory)
    }

    fn invoke(
        &self,
        event: &str,
        payload: Map<String, Value>,
        invocation: Invocation,
    ) -> WorkflowResult<Option<Value>> {
        let mut session = self.repository.session(&self.user);
        let path = self.handle_path();
        let mut handle = session.handle(&path)?;

        match self.run(event, payload, invocation, &mut handle) {
            Ok(result) => {
                let new_path = handle.path().to_string();
                if let Err(e) = handle.save() {
                    warn!(event = %event, path = %path, user = %self.user, error = %e, "Save failed, changes discarded");
                    discard(&mut handle);
                    return Err(e.into());
                }
                if new_path != path {
                    *self.handle_path.write() = new_path;
                }
                Ok(result)
            }
            Err(e) => {
                warn!(event = %event, path = %path, user = %self.user, error = %e, "Workflow operation failed");
                discard(&mut handle);
                Err(e)
            }
        }
    }

    fn run(
        &self,
        event: &str,
        payload: Map<String, Value>,
        invocation: Invocation,
        handle: &mut HandleSession<'_>,
    ) -> WorkflowResult<Option<Value>> {
        let projected = DocumentHandle::project(&*handle)?;
        let mut ctx = WorkflowContext::new(&self.user, projected)
            .with_event(event, payload)
            .with_now(handle.now());
        let executor = StateMachineExecutor::new(&self.definition, &self.evaluator);

        match executor.fire(event, &mut ctx, handle)? {
            FireOutcome::Fired(record) => {
                info!(
                    event = %event,
                    path = %handle.path(),
                    user = %self.user,
                    state = %record.settled_state,
                    duration_ms = record.duration_ms,
                    "Workflow operation completed"
                );
                Ok(ctx.take_result())
            }
            FireOutcome::NoTransition { state, reasons } => match invocation {
                Invocation::Explicit => Err(WorkflowError::NotAllowed {
                    operation: event.to_string(),
                    state,
                    reasons,
                }),
                Invocation::Advisory => {
                    debug!(event = %event, state = %state, "Notification ignored");
                    Ok(None)
                }
            },
        }
    }

    fn invoke_unit(&self, event: &str, payload: Map<String, Value>) -> WorkflowResult<()> {
        self.trigger(event, payload).map(|_| ())
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Obtain the draft for editing, creating it if needed.
    pub fn obtain_editable_instance(&self) -> WorkflowResult<DocumentVariant> {
        let result = self.trigger(ops::OBTAIN_EDITABLE_INSTANCE, Map::new())?;
        decode(ops::OBTAIN_EDITABLE_INSTANCE, result)
    }

    /// Commit the draft into the unpublished variant and release it.
    pub fn commit_editable_instance(&self) -> WorkflowResult<DocumentVariant> {
        let result = self.trigger(ops::COMMIT_EDITABLE_INSTANCE, Map::new())?;
        decode(ops::COMMIT_EDITABLE_INSTANCE, result)
    }

    pub fn dispose_editable_instance(&self) -> WorkflowResult<()> {
        self.invoke_unit(ops::DISPOSE_EDITABLE_INSTANCE, Map::new())
    }

    /// Release the draft held by the invoking user.
    pub fn unlock(&self) -> WorkflowResult<()> {
        self.invoke_unit(ops::UNLOCK, Map::new())
    }

    pub fn publish(&self) -> WorkflowResult<()> {
        self.invoke_unit(ops::PUBLISH, Map::new())
    }

    pub fn depublish(&self) -> WorkflowResult<()> {
        self.invoke_unit(ops::DEPUBLISH, Map::new())
    }

    pub fn request_publication(&self) -> WorkflowResult<()> {
        self.invoke_unit(ops::REQUEST_PUBLICATION, Map::new())
    }

    pub fn request_depublication(&self) -> WorkflowResult<()> {
        self.invoke_unit(ops::REQUEST_DEPUBLICATION, Map::new())
    }

    pub fn schedule_publication(&self, at: DateTime<Utc>) -> WorkflowResult<()> {
        self.invoke_unit(ops::SCHEDULE_PUBLICATION, payload([("at", Value::String(at.to_rfc3339()))]))
    }

    pub fn schedule_depublication(&self, at: DateTime<Utc>) -> WorkflowResult<()> {
        self.invoke_unit(
            ops::SCHEDULE_DEPUBLICATION,
            payload([("at", Value::String(at.to_rfc3339()))]),
        )
    }

    pub fn accept_request(&self) -> WorkflowResult<()> {
        self.invoke_unit(ops::ACCEPT_REQUEST, Map::new())
    }

    pub fn reject_request(&self, reason: Option<&str>) -> WorkflowResult<()> {
        let reason = reason.map(|r| Value::String(r.to_string())).unwrap_or(Value::Null);
        self.invoke_unit(ops::REJECT_REQUEST, payload([("reason", reason)]))
    }

    pub fn cancel_request(&self) -> WorkflowResult<()> {
        self.invoke_unit(ops::CANCEL_REQUEST, Map::new())
    }

    /// Rename the handle and its variants. The façade follows the new path.
    pub fn rename(&self, new_name: &str) -> WorkflowResult<()> {
        self.invoke_unit(
            ops::RENAME,
            payload([("new_name", Value::String(new_name.to_string()))]),
        )
    }

    /// Check in the current content; returns the new version.
    pub fn version(&self) -> WorkflowResult<Version> {
        let result = self.trigger(ops::VERSION, Map::new())?;
        decode(ops::VERSION, result)
    }

    /// Restore into `target` the latest version of `variant` created at or
    /// before `historic`.
    pub fn restore_version_to(
        &self,
        variant: &DocumentVariant,
        target: &DocumentVariant,
        historic: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let as_value = |v: &DocumentVariant| {
            serde_json::to_value(v).map_err(|e| WorkflowError::task(ops::RESTORE_VERSION_TO, e))
        };
        self.invoke_unit(
            ops::RESTORE_VERSION_TO,
            payload([
                ("variant", as_value(variant)?),
                ("target", as_value(target)?),
                ("historic", Value::String(historic.to_rfc3339())),
            ]),
        )
    }
}

fn discard(handle: &mut HandleSession<'_>) {
    if let Err(e) = handle.refresh(false) {
        warn!(path = %handle.path(), error = %e, "Failed to discard session changes");
    }
}

fn payload<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn decode<T: serde::de::DeserializeOwned>(operation: &str, result: Option<Value>) -> WorkflowResult<T> {
    let value = result.ok_or_else(|| {
        WorkflowError::IllegalState(format!("'{}' completed without a result", operation))
    })?;
    serde_json::from_value(value).map_err(|e| WorkflowError::task(operation, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VariantState;

    fn setup() -> (Arc<Repository>, Arc<StateMachineDefinition>) {
        let repo = Repository::new();
        let mut session = repo.session("admin");
        session.create_handle("/content/news").unwrap();
        session.save().unwrap();
        (repo, Arc::new(StateMachineDefinition::document_workflow().unwrap()))
    }

    fn workflow(repo: &Arc<Repository>, def: &Arc<StateMachineDefinition>, user: &str) -> DocumentWorkflow {
        DocumentWorkflow::new(
            Arc::clone(def),
            ExpressionEvaluator::new(),
            Arc::clone(repo),
            "/content/news",
            user,
        )
    }

    #[test]
    fn test_edit_commit_publish_cycle() {
        let (repo, def) = setup();
        let alice = workflow(&repo, &def, "alice");

        let draft = alice.obtain_editable_instance().unwrap();
        assert_eq!(draft.state, VariantState::Draft);
        assert_eq!(draft.holder.as_deref(), Some("alice"));

        let unpublished = alice.commit_editable_instance().unwrap();
        assert_eq!(unpublished.state, VariantState::Unpublished);
        assert!(unpublished.is_available_in("preview"));

        alice.publish().unwrap();
        let hints = alice.hints();
        assert_eq!(hints["depublish"], Value::Bool(true));
        assert_eq!(hints["publish"], Value::Bool(false));
        assert_eq!(hints["unlock"], Value::Bool(false));
    }

    #[test]
    fn test_not_allowed_reports_state() {
        let (repo, def) = setup();
        let alice = workflow(&repo, &def, "alice");

        match alice.depublish() {
            Err(WorkflowError::NotAllowed { operation, state, .. }) => {
                assert_eq!(operation, "depublish");
                assert_eq!(state, "offline");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_notify_ignores_disabled_event() {
        let (repo, def) = setup();
        let alice = workflow(&repo, &def, "alice");
        assert_eq!(alice.notify("depublish", Map::new()).unwrap(), None);
        assert_eq!(alice.notify("no_such_event", Map::new()).unwrap(), None);
    }

    #[test]
    fn test_hints_for_missing_handle_are_all_false() {
        let (repo, def) = setup();
        let ghost = DocumentWorkflow::new(
            Arc::clone(&def),
            ExpressionEvaluator::new(),
            repo,
            "/content/missing",
            "alice",
        );
        let hints = ghost.hints();
        assert_eq!(hints.len(), def.events().len());
        assert!(hints.values().all(|v| *v == Value::Bool(false)));
    }
}
