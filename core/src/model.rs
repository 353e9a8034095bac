/// Workflow data model: the in-memory projection of a document handle.
///
/// A handle aggregates at most one variant per lifecycle state and an
/// ordered list of publication requests. The projection is rebuilt from the
/// store on every workflow call and never persisted on its own.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::{WorkflowError, WorkflowResult};
use crate::store::ContentHandle;

/// Lifecycle state of a document variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantState {
    Draft,
    Unpublished,
    Published,
}

impl VariantState {
    pub const ALL: [VariantState; 3] = [
        VariantState::Draft,
        VariantState::Unpublished,
        VariantState::Published,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VariantState::Draft => "draft",
            VariantState::Unpublished => "unpublished",
            VariantState::Published => "published",
        }
    }
}

impl fmt::Display for VariantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(VariantState::Draft),
            "unpublished" => Ok(VariantState::Unpublished),
            "published" => Ok(VariantState::Published),
            other => Err(format!("unknown variant state '{}'", other)),
        }
    }
}

/// Kind of a publication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Publish,
    Depublish,
    Rejected,
    ScheduledPublish,
    ScheduledDepublish,
}

impl RequestType {
    /// Rejected requests are history; every other kind is pending.
    pub fn is_active(&self) -> bool {
        !matches!(self, RequestType::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Publish => "publish",
            RequestType::Depublish => "depublish",
            RequestType::Rejected => "rejected",
            RequestType::ScheduledPublish => "scheduled_publish",
            RequestType::ScheduledDepublish => "scheduled_depublish",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "publish" => Ok(RequestType::Publish),
            "depublish" => Ok(RequestType::Depublish),
            "rejected" => Ok(RequestType::Rejected),
            "scheduled_publish" | "scheduledpublish" => Ok(RequestType::ScheduledPublish),
            "scheduled_depublish" | "scheduleddepublish" => Ok(RequestType::ScheduledDepublish),
            other => Err(format!("unknown request type '{}'", other)),
        }
    }
}

/// One lifecycle copy of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVariant {
    /// Store node id; assigned by the store on creation
    #[serde(default)]
    pub id: String,

    pub state: VariantState,

    /// User currently holding the variant for editing
    #[serde(default)]
    pub holder: Option<String>,

    /// Channels the variant is available in (`live`, `preview`)
    #[serde(default)]
    pub availability: Vec<String>,

    #[serde(default)]
    pub created_by: Option<String>,

    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_modified_by: Option<String>,

    #[serde(default)]
    pub last_modification_date: Option<DateTime<Utc>>,

    /// Document fields
    #[serde(default)]
    pub content: Map<String, Value>,
}

impl DocumentVariant {
    pub fn new(state: VariantState) -> Self {
        Self {
            id: String::new(),
            state,
            holder: None,
            availability: Vec::new(),
            created_by: None,
            creation_date: None,
            last_modified_by: None,
            last_modification_date: None,
            content: Map::new(),
        }
    }

    pub fn with_content(mut self, content: Map<String, Value>) -> Self {
        self.content = content;
        self
    }

    pub fn with_holder(mut self, holder: &str) -> Self {
        self.holder = Some(holder.to_string());
        self
    }

    pub fn with_availability(mut self, channels: &[&str]) -> Self {
        self.availability = channels.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Record creation metadata for a freshly materialized variant.
    pub fn stamp_created(&mut self, user: &str, at: DateTime<Utc>) {
        self.created_by = Some(user.to_string());
        self.creation_date = Some(at);
        self.stamp_modified(user, at);
    }

    pub fn stamp_modified(&mut self, user: &str, at: DateTime<Utc>) {
        self.last_modified_by = Some(user.to_string());
        self.last_modification_date = Some(at);
    }

    pub fn is_available_in(&self, channel: &str) -> bool {
        self.availability.iter().any(|c| c == channel)
    }
}

/// A pending or historical publication request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationRequest {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub request_type: RequestType,

    pub requester: String,

    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Rejection reason
    #[serde(default)]
    pub reason: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl PublicationRequest {
    pub fn new(request_type: RequestType, requester: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            request_type,
            requester: requester.to_string(),
            scheduled_at: None,
            reason: None,
            created_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.request_type.is_active()
    }
}

/// Projection of a document handle: variants keyed by state plus requests.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentHandle {
    pub path: String,
    pub name: String,
    variants: BTreeMap<VariantState, DocumentVariant>,
    requests: Vec<PublicationRequest>,
}

impl DocumentHandle {
    /// Project a handle from the store.
    ///
    /// Fails with [`WorkflowError::InvalidModel`] when the store holds two
    /// variants in the same state or more than one active request.
    pub fn project(handle: &dyn ContentHandle) -> WorkflowResult<Self> {
        let name = handle.name()?;
        Self::from_parts(
            handle.path(),
            &name,
            handle.variants()?,
            handle.requests()?,
        )
    }

    pub fn from_parts(
        path: &str,
        name: &str,
        variants: Vec<DocumentVariant>,
        requests: Vec<PublicationRequest>,
    ) -> WorkflowResult<Self> {
        let mut by_state = BTreeMap::new();
        for variant in variants {
            let state = variant.state;
            if by_state.insert(state, variant).is_some() {
                return Err(WorkflowError::InvalidModel(format!(
                    "{} has more than one {} variant",
                    path, state
                )));
            }
        }

        let active = requests.iter().filter(|r| r.is_active()).count();
        if active > 1 {
            return Err(WorkflowError::InvalidModel(format!(
                "{} has {} active requests",
                path, active
            )));
        }

        Ok(Self {
            path: path.to_string(),
            name: name.to_string(),
            variants: by_state,
            requests,
        })
    }

    pub fn variant(&self, state: VariantState) -> Option<&DocumentVariant> {
        self.variants.get(&state)
    }

    pub fn variants(&self) -> impl Iterator<Item = &DocumentVariant> {
        self.variants.values()
    }

    pub fn draft(&self) -> Option<&DocumentVariant> {
        self.variant(VariantState::Draft)
    }

    pub fn unpublished(&self) -> Option<&DocumentVariant> {
        self.variant(VariantState::Unpublished)
    }

    pub fn published(&self) -> Option<&DocumentVariant> {
        self.variant(VariantState::Published)
    }

    pub fn requests(&self) -> &[PublicationRequest] {
        &self.requests
    }

    /// The single non-rejected request, if any.
    pub fn active_request(&self) -> Option<&PublicationRequest> {
        self.requests.iter().find(|r| r.is_active())
    }

    pub fn variant_json(&self, state: VariantState) -> Value {
        self.variant(state)
            .and_then(|v| serde_json::to_value(v).ok())
            .unwrap_or(Value::Null)
    }

    pub fn active_request_json(&self) -> Value {
        self.active_request()
            .and_then(|r| serde_json::to_value(r).ok())
            .unwrap_or(Value::Null)
    }

    pub fn requests_json(&self) -> Value {
        Value::Array(
            self.requests
                .iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect(),
        )
    }
}
