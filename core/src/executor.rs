/// State-machine executor
///
/// Interprets a [`StateMachineDefinition`] against a workflow context:
/// - settling: starting at the initial state, follow the first eventless
///   transition whose guard holds until none does
/// - firing: in the settled state, take the first transition declared for the
///   event whose guard holds, run its actions, then the target's entry actions
/// - enablement: report which events currently have a passing transition
///
/// Execution is synchronous and runs to completion; the first failing action
/// aborts the fire.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info};

use crate::context::WorkflowContext;
use crate::definition::{StateDef, StateMachineDefinition, Transition};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::expression::{EvalContext, ExpressionEvaluator};
use crate::store::ContentHandle;

/// Record of a fired transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub event: String,

    /// State the event was fired in
    pub from_state: String,

    /// Declared target; equal to `from_state` for targetless transitions
    pub to_state: String,

    /// State reached after routing from the target
    pub settled_state: String,

    pub duration_ms: u64,
}

/// Result of firing an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Fired(TransitionRecord),

    /// No transition for the event passed its guard; nothing ran.
    NoTransition {
        state: String,
        /// `reason` of every declared transition whose guard failed
        reasons: Vec<String>,
    },
}

pub struct StateMachineExecutor<'a> {
    definition: &'a StateMachineDefinition,
    evaluator: &'a ExpressionEvaluator,
}

impl<'a> StateMachineExecutor<'a> {
    pub fn new(definition: &'a StateMachineDefinition, evaluator: &'a ExpressionEvaluator) -> Self {
        Self {
            definition,
            evaluator,
        }
    }

    fn state(&self, id: &str) -> WorkflowResult<&'a StateDef> {
        self.definition.state(id).ok_or_else(|| {
            WorkflowError::IllegalState(format!(
                "state '{}' is not part of definition '{}'",
                id,
                self.definition.name()
            ))
        })
    }

    fn guard_holds(&self, transition: &Transition, vars: &EvalContext) -> WorkflowResult<bool> {
        match &transition.guard {
            Some(guard) => Ok(self.evaluator.evaluate_bool(guard, vars)?),
            None => Ok(true),
        }
    }

    /// Resolve the current state from the initial state.
    pub fn settle(&self, ctx: &WorkflowContext) -> WorkflowResult<String> {
        self.settle_from(self.definition.initial(), &ctx.eval_context())
    }

    fn settle_from(&self, start: &str, vars: &EvalContext) -> WorkflowResult<String> {
        let mut current = self.state(start)?;
        let mut steps = 0;

        loop {
            let mut next = None;
            for transition in current.eventless() {
                if self.guard_holds(transition, vars)? {
                    next = transition.target.as_deref();
                    break;
                }
            }

            let Some(target) = next else {
                return Ok(current.id.clone());
            };

            steps += 1;
            if steps > self.definition.max_routing_steps() {
                return Err(WorkflowError::Routing(format!(
                    "no stable state after {} steps from '{}' in '{}'",
                    self.definition.max_routing_steps(),
                    start,
                    self.definition.name()
                )));
            }
            current = self.state(target)?;
        }
    }

    /// Fire `event` in the settled state.
    pub fn fire(
        &self,
        event: &str,
        ctx: &mut WorkflowContext,
        handle: &mut dyn ContentHandle,
    ) -> WorkflowResult<FireOutcome> {
        let start_time = Instant::now();
        let vars = ctx.eval_context();
        let source_id = self.settle_from(self.definition.initial(), &vars)?;
        let source = self.state(&source_id)?;

        let mut reasons = Vec::new();
        let mut chosen = None;
        for transition in source.transitions_for(event) {
            if self.guard_holds(transition, &vars)? {
                chosen = Some(transition);
                break;
            }
            if let Some(reason) = &transition.reason {
                reasons.push(reason.clone());
            }
        }

        let Some(transition) = chosen else {
            debug!(event = %event, state = %source_id, "No transition enabled");
            return Ok(FireOutcome::NoTransition {
                state: source_id,
                reasons,
            });
        };

        for action in &transition.actions {
            action.execute(self.evaluator, ctx, handle)?;
        }

        // any targeted transition is external, a self-target included
        let (to_state, settled_state) = match &transition.target {
            Some(target) => {
                for action in &self.state(target)?.entry {
                    action.execute(self.evaluator, ctx, handle)?;
                }
                let settled = self.settle_from(target, &ctx.eval_context())?;
                (target.clone(), settled)
            }
            None => (source_id.clone(), source_id.clone()),
        };

        let record = TransitionRecord {
            event: event.to_string(),
            from_state: source_id,
            to_state,
            settled_state,
            duration_ms: start_time.elapsed().as_millis() as u64,
        };
        info!(
            event = %record.event,
            from = %record.from_state,
            to = %record.settled_state,
            path = %handle.path(),
            "Transition fired"
        );
        Ok(FireOutcome::Fired(record))
    }

    /// Events of the settled state with a passing guard. A guard that fails to
    /// evaluate counts as not passing.
    pub fn enabled_events(&self, ctx: &WorkflowContext) -> WorkflowResult<BTreeSet<String>> {
        let vars = ctx.eval_context();
        let state = self.state(&self.settle_from(self.definition.initial(), &vars)?)?;

        let mut enabled = BTreeSet::new();
        for transition in &state.transitions {
            let Some(event) = &transition.event else { continue };
            if enabled.contains(event) {
                continue;
            }
            match self.guard_holds(transition, &vars) {
                Ok(true) => {
                    enabled.insert(event.clone());
                }
                Ok(false) => {}
                Err(e) => debug!(event = %event, error = %e, "Guard failed to evaluate"),
            }
        }
        Ok(enabled)
    }

    /// Evaluated `info` values of a state; failures yield `null`.
    pub fn info(&self, state_id: &str, ctx: &WorkflowContext) -> WorkflowResult<BTreeMap<String, Value>> {
        let vars = ctx.eval_context();
        Ok(self
            .state(state_id)?
            .info
            .iter()
            .map(|(key, expression)| {
                let value = self.evaluator.evaluate(expression, &vars).unwrap_or(Value::Null);
                (key.clone(), value)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentHandle, DocumentVariant, VariantState};
    use crate::store::Repository;
    use serde_json::{json, Map};

    const CHART: &str = r#"
name = "lamp"
initial = "route"

[[states]]
id = "route"

[[states.transitions]]
guard = "draft != null"
target = "on"

[[states.transitions]]
target = "off"

[[states]]
id = "off"
info = { label = "'dark'" }

[[states.transitions]]
event = "toggle"
guard = "user == 'admin'"
reason = "only admin may switch on"
target = "route"
actions = [{ type = "copy_variant", source = "null", target_state = "'draft'" }]

[[states.transitions]]
event = "toggle"
guard = "user == 'root'"
reason = "only root may switch on"
target = "route"

[[states.transitions]]
event = "peek"
actions = [{ type = "result", value = "'nothing here'" }]

[[states]]
id = "on"
entry = [{ type = "result", value = "'entered'" }]

[[states.transitions]]
event = "toggle"
target = "route"
actions = [{ type = "remove_variant", variant = "draft" }]

[[states.transitions]]
event = "broken"
guard = "draft.missing.deeper == 1"
"#;

    const LOOPING: &str = r#"
name = "loop"
initial = "a"
max_routing_steps = 4

[[states]]
id = "a"

[[states.transitions]]
target = "b"

[[states]]
id = "b"

[[states.transitions]]
target = "a"
"#;

    fn definition() -> StateMachineDefinition {
        StateMachineDefinition::from_toml_str(CHART).unwrap()
    }

    fn context(user: &str, handle: &dyn ContentHandle) -> WorkflowContext {
        WorkflowContext::new(user, DocumentHandle::project(handle).unwrap())
    }

    #[test]
    fn test_settles_through_eventless_transitions() {
        let def = definition();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("admin");
        let handle = session.create_handle("/lamp").unwrap();

        assert_eq!(executor.settle(&context("admin", &handle)).unwrap(), "off");
    }

    #[test]
    fn test_fire_runs_actions_and_entry() {
        let def = definition();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("admin");
        let mut handle = session.create_handle("/lamp").unwrap();
        let mut ctx = context("admin", &handle);

        match executor.fire("toggle", &mut ctx, &mut handle).unwrap() {
            FireOutcome::Fired(record) => {
                assert_eq!(record.from_state, "off");
                assert_eq!(record.to_state, "route");
                assert_eq!(record.settled_state, "on");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(handle.variant(VariantState::Draft).unwrap().is_some());

        let mut ctx = context("admin", &handle);
        assert!(matches!(
            executor.fire("toggle", &mut ctx, &mut handle).unwrap(),
            FireOutcome::Fired(_)
        ));
        assert!(handle.variants().unwrap().is_empty());
    }

    #[test]
    fn test_entry_actions_run_only_for_direct_target() {
        let def = StateMachineDefinition::from_toml_str(
            &CHART.replace("target = \"route\"\nactions = [{ type = \"copy_variant\"", "target = \"on\"\nactions = [{ type = \"copy_variant\""),
        )
        .unwrap();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("admin");
        let mut handle = session.create_handle("/lamp").unwrap();

        let mut ctx = context("admin", &handle);
        executor.fire("toggle", &mut ctx, &mut handle).unwrap();
        assert_eq!(ctx.result(), Some(&json!("entered")));

        // settling into "on" later never re-runs its entry actions
        let ctx = context("admin", &handle);
        assert_eq!(executor.settle(&ctx).unwrap(), "on");
        assert!(ctx.result().is_none());
    }

    #[test]
    fn test_self_target_reenters_state() {
        let def = StateMachineDefinition::from_toml_str(
            r#"
name = "counter"
initial = "idle"

[[states]]
id = "idle"
entry = [{ type = "result", value = "'entered'" }]

[[states.transitions]]
event = "restart"
target = "idle"

[[states.transitions]]
event = "stay"
actions = [{ type = "result", value = "'stayed'" }]
"#,
        )
        .unwrap();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("admin");
        let mut handle = session.create_handle("/counter").unwrap();

        let mut ctx = context("admin", &handle);
        match executor.fire("restart", &mut ctx, &mut handle).unwrap() {
            FireOutcome::Fired(record) => {
                assert_eq!(record.from_state, "idle");
                assert_eq!(record.to_state, "idle");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(ctx.result(), Some(&json!("entered")));

        let mut ctx = context("admin", &handle);
        executor.fire("stay", &mut ctx, &mut handle).unwrap();
        assert_eq!(ctx.result(), Some(&json!("stayed")));
    }

    #[test]
    fn test_no_transition_collects_reasons() {
        let def = definition();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("bob");
        let mut handle = session.create_handle("/lamp").unwrap();
        let mut ctx = context("bob", &handle);

        assert_eq!(
            executor.fire("toggle", &mut ctx, &mut handle).unwrap(),
            FireOutcome::NoTransition {
                state: "off".to_string(),
                reasons: vec![
                    "only admin may switch on".to_string(),
                    "only root may switch on".to_string()
                ],
            }
        );
        assert!(handle.variants().unwrap().is_empty());
    }

    #[test]
    fn test_targetless_transition_stays() {
        let def = definition();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("bob");
        let mut handle = session.create_handle("/lamp").unwrap();
        let mut ctx = context("bob", &handle).with_event("peek", Map::new());

        match executor.fire("peek", &mut ctx, &mut handle).unwrap() {
            FireOutcome::Fired(record) => assert_eq!(record.settled_state, "off"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(ctx.result(), Some(&json!("nothing here")));
    }

    #[test]
    fn test_enabled_events_and_info() {
        let def = definition();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("admin");
        let mut handle = session.create_handle("/lamp").unwrap();

        let enabled = executor.enabled_events(&context("bob", &handle)).unwrap();
        assert_eq!(enabled.into_iter().collect::<Vec<_>>(), vec!["peek"]);
        let enabled = executor.enabled_events(&context("admin", &handle)).unwrap();
        assert!(enabled.contains("toggle"));
        assert_eq!(
            executor.info("off", &context("admin", &handle)).unwrap()["label"],
            json!("dark")
        );

        handle
            .add_variant(DocumentVariant::new(VariantState::Draft))
            .unwrap();
        // the failing guard on "broken" reports disabled instead of erroring
        let enabled = executor.enabled_events(&context("admin", &handle)).unwrap();
        assert_eq!(enabled.into_iter().collect::<Vec<_>>(), vec!["toggle"]);
    }

    #[test]
    fn test_guard_error_aborts_fire() {
        let def = definition();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("admin");
        let mut handle = session.create_handle("/lamp").unwrap();
        handle
            .add_variant(DocumentVariant::new(VariantState::Draft))
            .unwrap();
        let mut ctx = context("admin", &handle);

        assert!(matches!(
            executor.fire("broken", &mut ctx, &mut handle),
            Err(WorkflowError::Evaluation(_))
        ));
    }

    #[test]
    fn test_cyclic_routing_is_rejected() {
        let def = StateMachineDefinition::from_toml_str(LOOPING).unwrap();
        let evaluator = ExpressionEvaluator::new();
        let executor = StateMachineExecutor::new(&def, &evaluator);
        let repo = Repository::new();
        let mut session = repo.session("admin");
        let handle = session.create_handle("/loop").unwrap();

        assert!(matches!(
            executor.settle(&context("admin", &handle)),
            Err(WorkflowError::Routing(_))
        ));
    }
}
