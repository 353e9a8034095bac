/// State-chart definitions
///
/// A definition is authored in TOML and compiled into an immutable
/// [`StateMachineDefinition`] shared via `Arc`.
///
/// # TOML Format
///
/// ```toml
/// name = "document-workflow"
/// initial = "status"
///
/// [[states]]
/// id = "status"
///
/// [[states.transitions]]
/// guard = "request != null"
/// target = "review"
///
/// [[states]]
/// id = "editing"
/// info = { in_use_by = "draft.holder" }
///
/// [[states.transitions]]
/// event = "unlock"
/// guard = "draft.holder == user"
/// reason = "draft is not held by the invoking user"
/// target = "status"
/// actions = [{ type = "set_holder", variant = "draft", holder = "null" }]
/// ```
///
/// Transitions without an `event` are routing transitions: they are followed
/// automatically while settling and must not carry actions.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use crate::action::{Action, ActionDef};
use crate::errors::{DefinitionError, DefinitionResult};
use crate::expression::ExpressionEvaluator;

/// Name of the definition bundled with the crate
pub const DOCUMENT_WORKFLOW: &str = "document-workflow";

const DOCUMENT_WORKFLOW_TOML: &str = include_str!("../definitions/document-workflow.toml");

fn default_max_routing_steps() -> usize {
    32
}

// ============================================================================
// TOML REPRESENTATION
// ============================================================================

/// TOML-friendly definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub initial: String,
    #[serde(default = "default_max_routing_steps")]
    pub max_routing_steps: usize,
    #[serde(default)]
    pub states: Vec<TomlState>,
}

/// TOML-friendly state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlState {
    pub id: String,
    #[serde(default)]
    pub entry: Vec<ActionDef>,
    /// Extra hint values, as expressions
    #[serde(default)]
    pub info: BTreeMap<String, String>,
    #[serde(default)]
    pub transitions: Vec<TomlTransition>,
}

/// TOML-friendly transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlTransition {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    /// Reported when the guard blocks an explicit operation
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

// ============================================================================
// COMPILED DEFINITION
// ============================================================================

#[derive(Debug, Clone)]
pub struct Transition {
    pub event: Option<String>,
    pub guard: Option<String>,
    pub target: Option<String>,
    pub reason: Option<String>,
    pub actions: Vec<Action>,
}

impl Transition {
    pub fn is_eventless(&self) -> bool {
        self.event.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct StateDef {
    pub id: String,
    pub entry: Vec<Action>,
    pub info: BTreeMap<String, String>,
    pub transitions: Vec<Transition>,
}

impl StateDef {
    /// Transitions for `event`, in declaration order.
    pub fn transitions_for<'a>(&'a self, event: &'a str) -> impl Iterator<Item = &'a Transition> {
        self.transitions
            .iter()
            .filter(move |t| t.event.as_deref() == Some(event))
    }

    pub fn eventless(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter().filter(|t| t.is_eventless())
    }
}

/// Immutable, validated state chart.
#[derive(Debug, Clone)]
pub struct StateMachineDefinition {
    name: String,
    description: Option<String>,
    initial: String,
    max_routing_steps: usize,
    states: Vec<StateDef>,
    index: HashMap<String, usize>,
}

impl StateMachineDefinition {
    /// Parse and validate a TOML definition.
    pub fn from_toml_str(s: &str) -> DefinitionResult<Self> {
        let raw: TomlDefinition = toml::from_str(s)?;
        Self::compile(raw)
    }

    /// Load a definition from a TOML file.
    pub fn load(path: &Path) -> DefinitionResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// The bundled document lifecycle chart.
    pub fn document_workflow() -> DefinitionResult<Self> {
        Self::from_toml_str(DOCUMENT_WORKFLOW_TOML)
    }

    pub fn compile(raw: TomlDefinition) -> DefinitionResult<Self> {
        if raw.max_routing_steps == 0 {
            return Err(DefinitionError::Invalid(
                "max_routing_steps must be greater than 0".to_string(),
            ));
        }

        let mut index = HashMap::new();
        for (i, state) in raw.states.iter().enumerate() {
            if index.insert(state.id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateState(state.id.clone()));
            }
        }

        if !index.contains_key(&raw.initial) {
            return Err(DefinitionError::UnknownState {
                state: raw.initial.clone(),
                referenced_from: "initial".to_string(),
            });
        }

        let evaluator = ExpressionEvaluator::new();
        let mut states = Vec::with_capacity(raw.states.len());

        for state in raw.states {
            let entry = state
                .entry
                .iter()
                .map(Action::from_def)
                .collect::<DefinitionResult<Vec<_>>>()?;

            for (key, expression) in &state.info {
                check_expression(&evaluator, expression, &format!("state '{}' info '{}'", state.id, key))?;
            }

            let mut transitions = Vec::with_capacity(state.transitions.len());
            for (position, t) in state.transitions.into_iter().enumerate() {
                let location = format!(
                    "state '{}' transition #{} ({})",
                    state.id,
                    position + 1,
                    t.event.as_deref().unwrap_or("eventless")
                );

                if let Some(target) = &t.target {
                    if !index.contains_key(target) {
                        return Err(DefinitionError::UnknownState {
                            state: target.clone(),
                            referenced_from: location,
                        });
                    }
                }

                if t.event.is_none() {
                    if !t.actions.is_empty() {
                        return Err(DefinitionError::EventlessWithActions(state.id.clone()));
                    }
                    if t.target.is_none() {
                        return Err(DefinitionError::Invalid(format!(
                            "{} has neither event nor target",
                            location
                        )));
                    }
                }

                if let Some(guard) = &t.guard {
                    check_expression(&evaluator, guard, &location)?;
                }

                let actions = t
                    .actions
                    .iter()
                    .map(Action::from_def)
                    .collect::<DefinitionResult<Vec<_>>>()?;

                transitions.push(Transition {
                    event: t.event,
                    guard: t.guard,
                    target: t.target,
                    reason: t.reason,
                    actions,
                });
            }

            states.push(StateDef {
                id: state.id,
                entry,
                info: state.info,
                transitions,
            });
        }

        Ok(Self {
            name: raw.name,
            description: raw.description,
            initial: raw.initial,
            max_routing_steps: raw.max_routing_steps,
            states,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn max_routing_steps(&self) -> usize {
        self.max_routing_steps
    }

    pub fn states(&self) -> &[StateDef] {
        &self.states
    }

    pub fn state(&self, id: &str) -> Option<&StateDef> {
        self.index.get(id).map(|i| &self.states[*i])
    }

    /// Every operation declared anywhere in the chart.
    pub fn events(&self) -> BTreeSet<String> {
        self.states
            .iter()
            .flat_map(|s| s.transitions.iter())
            .filter_map(|t| t.event.clone())
            .collect()
    }
}

fn check_expression(
    evaluator: &ExpressionEvaluator,
    expression: &str,
    location: &str,
) -> DefinitionResult<()> {
    evaluator
        .parse(expression)
        .map(|_| ())
        .map_err(|e| DefinitionError::InvalidExpression {
            location: location.to_string(),
            message: e.to_string(),
        })
}
