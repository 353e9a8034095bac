/// Workflow actions
///
/// An action is declared in a state chart as `{ type = "...", <param> = ... }`.
/// String parameters are expressions evaluated against the workflow context
/// when the action runs; booleans, numbers and arrays are literals. Every
/// action except `result` binds its parameters into exactly one
/// [`WorkflowTask`] and executes it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::context::WorkflowContext;
use crate::errors::{DefinitionError, DefinitionResult, WorkflowResult};
use crate::expression::{
    coerce_bool, coerce_object_id, coerce_optional_string, coerce_string, coerce_timestamp,
    type_name, EvalContext, EvalError, EvalResult, Expr, ExpressionEvaluator,
};
use crate::model::{DocumentHandle, RequestType, VariantState};
use crate::store::ContentHandle;
use crate::task::WorkflowTask;

/// Declarative action as written in a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, toml::Value>,
}

impl ActionDef {
    pub fn new(action_type: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<toml::Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

/// An action parameter: an expression or a literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Expr(String),
    Literal(Value),
}

impl Param {
    fn resolve(&self, evaluator: &ExpressionEvaluator, vars: &EvalContext) -> EvalResult<Value> {
        match self {
            Param::Expr(expression) => evaluator.evaluate(expression, vars),
            Param::Literal(value) => Ok(value.clone()),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Param::Expr(e) if e.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CopyVariant {
        source: Param,
        target_state: Param,
    },
    ConfigVariant {
        variant: Param,
        availabilities: Option<Param>,
        apply_modified: Option<Param>,
        versionable: Option<Param>,
        set_holder: Option<Param>,
    },
    SetHolder {
        variant: Param,
        holder: Param,
    },
    RemoveVariant {
        variant: Param,
    },
    CreateRequest {
        request_type: Param,
        scheduled_at: Option<Param>,
        reason: Option<Param>,
    },
    RejectRequest {
        request: Param,
        reason: Option<Param>,
    },
    RemoveRequest {
        request: Param,
    },
    Rename {
        new_name: Param,
    },
    Version {
        variant: Param,
    },
    VersionRestoreTo {
        variant: Param,
        target: Param,
        historic: Param,
    },
    /// Store a value in the context's result slot
    Result {
        value: Option<Param>,
    },
}

/// Parameter lookup over an [`ActionDef`], tracking what was consumed.
struct ParamReader<'a> {
    def: &'a ActionDef,
    consumed: Vec<&'static str>,
}

impl<'a> ParamReader<'a> {
    fn new(def: &'a ActionDef) -> Self {
        Self {
            def,
            consumed: Vec::new(),
        }
    }

    fn optional(&mut self, name: &'static str) -> DefinitionResult<Option<Param>> {
        self.consumed.push(name);
        let Some(raw) = self.def.params.get(name) else {
            return Ok(None);
        };
        let invalid = || DefinitionError::InvalidParameter {
            action: self.def.action_type.clone(),
            param: name.to_string(),
            value: raw.to_string(),
        };
        let param = match raw {
            toml::Value::String(s) => Param::Expr(s.clone()),
            toml::Value::Boolean(_) | toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Array(_) => {
                Param::Literal(serde_json::to_value(raw).map_err(|_| invalid())?)
            }
            toml::Value::Datetime(_) | toml::Value::Table(_) => return Err(invalid()),
        };
        Ok(Some(param))
    }

    fn required(&mut self, name: &'static str) -> DefinitionResult<Param> {
        self.optional(name)?
            .ok_or_else(|| DefinitionError::MissingParameter {
                action: self.def.action_type.clone(),
                param: name.to_string(),
            })
    }

    /// A required parameter whose literal value, if it is one, must parse as `T`.
    fn required_enum<T: FromStr>(
        &mut self,
        name: &'static str,
        evaluator: &ExpressionEvaluator,
    ) -> DefinitionResult<Param> {
        let param = self.required(name)?;
        let literal = match &param {
            Param::Expr(e) => match evaluator.parse(e) {
                Ok(Expr::Literal(Value::String(s))) => Some(s),
                _ => None,
            },
            Param::Literal(Value::String(s)) => Some(s.clone()),
            Param::Literal(_) => None,
        };
        if let Some(literal) = literal {
            if literal.parse::<T>().is_err() {
                return Err(DefinitionError::InvalidParameter {
                    action: self.def.action_type.clone(),
                    param: name.to_string(),
                    value: literal,
                });
            }
        }
        Ok(param)
    }

    fn finish(self) -> DefinitionResult<()> {
        match self
            .def
            .params
            .keys()
            .find(|k| !self.consumed.contains(&k.as_str()))
        {
            Some(unexpected) => Err(DefinitionError::InvalidParameter {
                action: self.def.action_type.clone(),
                param: unexpected.clone(),
                value: "unexpected parameter".to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl Action {
    /// Build an action from its declaration, validating parameters.
    pub fn from_def(def: &ActionDef) -> DefinitionResult<Self> {
        let evaluator = ExpressionEvaluator::new();
        let mut p = ParamReader::new(def);

        let action = match def.action_type.as_str() {
            "copy_variant" => Action::CopyVariant {
                source: p.required("source")?,
                target_state: p.required_enum::<VariantState>("target_state", &evaluator)?,
            },
            "config_variant" => Action::ConfigVariant {
                variant: p.required("variant")?,
                availabilities: p.optional("availabilities")?,
                apply_modified: p.optional("apply_modified")?,
                versionable: p.optional("versionable")?,
                set_holder: p.optional("set_holder")?,
            },
            "set_holder" => Action::SetHolder {
                variant: p.required("variant")?,
                holder: p.required("holder")?,
            },
            "remove_variant" => Action::RemoveVariant {
                variant: p.required("variant")?,
            },
            "create_request" => Action::CreateRequest {
                request_type: p.required_enum::<RequestType>("request_type", &evaluator)?,
                scheduled_at: p.optional("scheduled_at")?,
                reason: p.optional("reason")?,
            },
            "reject_request" => Action::RejectRequest {
                request: p.required("request")?,
                reason: p.optional("reason")?,
            },
            "remove_request" => Action::RemoveRequest {
                request: p.required("request")?,
            },
            "rename" => Action::Rename {
                new_name: p.required("new_name")?,
            },
            "version" => Action::Version {
                variant: p.required("variant")?,
            },
            "restore_version_to" => Action::VersionRestoreTo {
                variant: p.required("variant")?,
                target: p.required("target")?,
                historic: p.required("historic")?,
            },
            "result" => Action::Result {
                value: p.optional("value")?,
            },
            other => return Err(DefinitionError::UnknownAction(other.to_string())),
        };

        p.finish()?;

        for param in action.expressions() {
            if let Err(e) = evaluator.parse(param) {
                if !param.trim().is_empty() {
                    return Err(DefinitionError::InvalidExpression {
                        location: format!("action '{}'", def.action_type),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(action)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::CopyVariant { .. } => "copy_variant",
            Action::ConfigVariant { .. } => "config_variant",
            Action::SetHolder { .. } => "set_holder",
            Action::RemoveVariant { .. } => "remove_variant",
            Action::CreateRequest { .. } => "create_request",
            Action::RejectRequest { .. } => "reject_request",
            Action::RemoveRequest { .. } => "remove_request",
            Action::Rename { .. } => "rename",
            Action::Version { .. } => "version",
            Action::VersionRestoreTo { .. } => "restore_version_to",
            Action::Result { .. } => "result",
        }
    }

    fn params(&self) -> Vec<&Param> {
        match self {
            Action::CopyVariant { source, target_state } => vec![source, target_state],
            Action::ConfigVariant {
                variant,
                availabilities,
                apply_modified,
                versionable,
                set_holder,
            } => {
                let mut params = vec![variant];
                params.extend(
                    [availabilities, apply_modified, versionable, set_holder]
                        .into_iter()
                        .flatten(),
                );
                params
            }
            Action::SetHolder { variant, holder } => vec![variant, holder],
            Action::RemoveVariant { variant } | Action::Version { variant } => vec![variant],
            Action::CreateRequest {
                request_type,
                scheduled_at,
                reason,
            } => {
                let mut params = vec![request_type];
                params.extend([scheduled_at, reason].into_iter().flatten());
                params
            }
            Action::RejectRequest { request, reason } => {
                let mut params = vec![request];
                params.extend(reason.iter());
                params
            }
            Action::RemoveRequest { request } => vec![request],
            Action::Rename { new_name } => vec![new_name],
            Action::VersionRestoreTo {
                variant,
                target,
                historic,
            } => vec![variant, target, historic],
            Action::Result { value } => value.iter().collect(),
        }
    }

    fn expressions(&self) -> impl Iterator<Item = &str> {
        self.params().into_iter().filter_map(|p| match p {
            Param::Expr(e) => Some(e.as_str()),
            Param::Literal(_) => None,
        })
    }

    /// Resolve parameters and bind them into a task. `None` for `result`.
    pub fn bind(
        &self,
        evaluator: &ExpressionEvaluator,
        vars: &EvalContext,
    ) -> WorkflowResult<Option<WorkflowTask>> {
        let eval = |param: &Param| param.resolve(evaluator, vars);
        let eval_opt = |param: &Option<Param>| -> EvalResult<Option<Value>> {
            param.as_ref().map(|p| p.resolve(evaluator, vars)).transpose()
        };

        let task = match self {
            Action::CopyVariant { source, target_state } => WorkflowTask::CopyVariant {
                source: optional_variant_ref(&eval(source)?)?,
                target_state: variant_state(&eval(target_state)?)?,
            },
            Action::ConfigVariant {
                variant,
                availabilities,
                apply_modified,
                versionable,
                set_holder,
            } => WorkflowTask::ConfigVariant {
                variant: variant_ref(&eval(variant)?)?,
                availabilities: eval_opt(availabilities)?
                    .map(|v| channel_list(&v))
                    .transpose()?,
                apply_modified: flag(eval_opt(apply_modified)?)?,
                versionable: flag(eval_opt(versionable)?)?,
                set_holder: flag(eval_opt(set_holder)?)?,
            },
            Action::SetHolder { variant, holder } => WorkflowTask::SetHolder {
                variant: variant_ref(&eval(variant)?)?,
                holder: coerce_optional_string(&eval(holder)?)?,
            },
            Action::RemoveVariant { variant } => WorkflowTask::RemoveVariant {
                variant: variant_ref(&eval(variant)?)?,
            },
            Action::CreateRequest {
                request_type,
                scheduled_at,
                reason,
            } => WorkflowTask::CreateRequest {
                request_type: request_type_of(&eval(request_type)?)?,
                scheduled_at: match eval_opt(scheduled_at)? {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(coerce_timestamp(&v)?),
                },
                reason: eval_opt(reason)?
                    .map(|v| coerce_optional_string(&v))
                    .transpose()?
                    .flatten(),
            },
            Action::RejectRequest { request, reason } => WorkflowTask::RejectRequest {
                request: coerce_object_id(&eval(request)?, "request")?,
                reason: eval_opt(reason)?
                    .map(|v| coerce_optional_string(&v))
                    .transpose()?
                    .flatten(),
            },
            Action::RemoveRequest { request } => WorkflowTask::RemoveRequest {
                request: coerce_object_id(&eval(request)?, "request")?,
            },
            Action::Rename { new_name } => WorkflowTask::RenameDocument {
                new_name: coerce_string(&eval(new_name)?)?,
            },
            Action::Version { variant } => WorkflowTask::Version {
                variant: variant_ref(&eval(variant)?)?,
            },
            Action::VersionRestoreTo {
                variant,
                target,
                historic,
            } => WorkflowTask::VersionRestoreTo {
                variant: variant_ref(&eval(variant)?)?,
                target: variant_ref(&eval(target)?)?,
                historic: historic_timestamp(&eval(historic)?)?,
            },
            Action::Result { .. } => return Ok(None),
        };

        Ok(Some(task))
    }

    /// Run the action against the context and the handle.
    ///
    /// After a task ran, the context's handle snapshot is re-projected so later
    /// actions see its effects.
    pub fn execute(
        &self,
        evaluator: &ExpressionEvaluator,
        ctx: &mut WorkflowContext,
        handle: &mut dyn ContentHandle,
    ) -> WorkflowResult<()> {
        let vars = ctx.eval_context();

        if let Action::Result { value } = self {
            let result = match value {
                Some(param) if !param.is_blank() => param.resolve(evaluator, &vars)?,
                _ => Value::Null,
            };
            ctx.set_result(result);
            return Ok(());
        }

        let Some(task) = self.bind(evaluator, &vars)? else {
            return Ok(());
        };

        debug!(action = self.kind(), task = task.name(), "Executing action");
        if let Some(output) = task.execute(ctx, handle)? {
            ctx.set_result(output);
        }
        ctx.replace_handle(DocumentHandle::project(handle)?);
        Ok(())
    }
}

// ============================================================================
// PARAMETER COERCION
// ============================================================================

fn variant_ref(value: &Value) -> EvalResult<String> {
    coerce_object_id(value, "variant")
}

fn optional_variant_ref(value: &Value) -> EvalResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        other => variant_ref(other).map(Some),
    }
}

fn variant_state(value: &Value) -> EvalResult<VariantState> {
    let s = coerce_string(value)?;
    s.parse().map_err(|_| EvalError::TypeCoercion {
        expected: "variant state".to_string(),
        found: format!("'{}'", s),
    })
}

fn request_type_of(value: &Value) -> EvalResult<RequestType> {
    let s = coerce_string(value)?;
    s.parse().map_err(|_| EvalError::TypeCoercion {
        expected: "request type".to_string(),
        found: format!("'{}'", s),
    })
}

fn flag(value: Option<Value>) -> EvalResult<bool> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(v) => coerce_bool(&v),
    }
}

/// Channel names from an array or a comma separated string.
fn channel_list(value: &Value) -> EvalResult<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()),
        Value::Array(items) => items.iter().map(coerce_string).collect(),
        other => Err(EvalError::TypeCoercion {
            expected: "channel list".to_string(),
            found: type_name(other).to_string(),
        }),
    }
}

/// A point in time from a timestamp string or a version object's `created`.
fn historic_timestamp(value: &Value) -> EvalResult<DateTime<Utc>> {
    match value {
        Value::Object(map) => match map.get("created") {
            Some(created) => coerce_timestamp(created),
            None => coerce_timestamp(value),
        },
        other => coerce_timestamp(other),
    }
}
