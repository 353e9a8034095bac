/// Per-call workflow context.
///
/// Carries the acting user, the trigger event, the event payload, the
/// projected handle, the store time and the result slot. The result slot is
/// the only thing actions may write.
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::expression::EvalContext;
use crate::model::{DocumentHandle, VariantState};

#[derive(Debug, Clone)]
pub struct WorkflowContext {
    user: String,
    event: Option<String>,
    payload: Map<String, Value>,
    handle: DocumentHandle,
    now: DateTime<Utc>,
    result: Option<Value>,
}

impl WorkflowContext {
    pub fn new(user: &str, handle: DocumentHandle) -> Self {
        Self {
            user: user.to_string(),
            event: None,
            payload: Map::new(),
            handle,
            now: Utc::now(),
            result: None,
        }
    }

    /// Time seen by `now()` in guards, normally the repository clock.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_event(mut self, event: &str, payload: Map<String, Value>) -> Self {
        self.event = Some(event.to_string());
        self.payload = payload;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn handle(&self) -> &DocumentHandle {
        &self.handle
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Replace the handle snapshot after a task changed the store.
    pub(crate) fn replace_handle(&mut self, handle: DocumentHandle) {
        self.handle = handle;
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, value: Value) {
        self.result = Some(value);
    }

    pub fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }

    /// Variables visible to guard and parameter expressions.
    pub fn eval_context(&self) -> EvalContext {
        let handle = &self.handle;
        EvalContext::new()
            .with_variable("user", Value::String(self.user.clone()))
            .with_variable(
                "event",
                self.event.clone().map(Value::String).unwrap_or(Value::Null),
            )
            .with_variable("handle", json!({ "path": handle.path, "name": handle.name }))
            .with_variable("draft", handle.variant_json(VariantState::Draft))
            .with_variable("unpublished", handle.variant_json(VariantState::Unpublished))
            .with_variable("published", handle.variant_json(VariantState::Published))
            .with_variable("request", handle.active_request_json())
            .with_variable("requests", handle.requests_json())
            .with_variable("payload", Value::Object(self.payload.clone()))
            .with_now(self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ExpressionEvaluator;
    use crate::model::{DocumentVariant, PublicationRequest, RequestType};

    #[test]
    fn test_eval_context_exposes_variants() {
        let mut draft = DocumentVariant::new(VariantState::Draft).with_holder("alice");
        draft.id = "d-1".to_string();
        let handle =
            DocumentHandle::from_parts("/content/news", "news", vec![draft], vec![]).unwrap();

        let mut payload = Map::new();
        payload.insert("newName".to_string(), Value::from("headlines"));
        let ctx = WorkflowContext::new("alice", handle).with_event("rename", payload);
        let vars = ctx.eval_context();
        let eval = ExpressionEvaluator::new();

        assert!(eval.evaluate_bool("draft.holder == user", &vars).unwrap());
        assert!(eval.evaluate_bool("published == null", &vars).unwrap());
        assert_eq!(eval.evaluate("handle.name", &vars).unwrap(), json!("news"));
        assert_eq!(eval.evaluate("payload.newName", &vars).unwrap(), json!("headlines"));
        assert_eq!(eval.evaluate("event", &vars).unwrap(), json!("rename"));
    }

    #[test]
    fn test_guards_read_context_time() {
        let mut request =
            PublicationRequest::new(RequestType::ScheduledPublish, "alice", Utc::now());
        request.scheduled_at = Some("2030-06-01T09:00:00Z".parse().unwrap());
        let handle =
            DocumentHandle::from_parts("/content/news", "news", vec![], vec![request]).unwrap();
        let eval = ExpressionEvaluator::new();
        let guard = "request.scheduled_at <= now()";

        let before = WorkflowContext::new("alice", handle.clone())
            .with_now("2030-06-01T08:00:00Z".parse().unwrap());
        assert!(!eval.evaluate_bool(guard, &before.eval_context()).unwrap());

        let after = WorkflowContext::new("alice", handle)
            .with_now("2030-06-01T10:00:00Z".parse().unwrap());
        assert!(eval.evaluate_bool(guard, &after.eval_context()).unwrap());
    }

    #[test]
    fn test_result_slot() {
        let handle = DocumentHandle::from_parts("/content/news", "news", vec![], vec![]).unwrap();
        let mut ctx = WorkflowContext::new("alice", handle);
        assert!(ctx.result().is_none());
        ctx.set_result(json!({ "ok": true }));
        assert_eq!(ctx.take_result(), Some(json!({ "ok": true })));
        assert!(ctx.result().is_none());
    }
}
