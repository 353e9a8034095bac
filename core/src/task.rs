/// Workflow tasks: the atomic units of work that mutate a document handle.
///
/// Tasks receive fully resolved parameters from their action and operate on
/// the handle's session; nothing they do is visible outside the session until
/// the façade saves it.
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::context::WorkflowContext;
use crate::errors::{StoreError, WorkflowError, WorkflowResult};
use crate::model::{DocumentVariant, PublicationRequest, RequestType, VariantState};
use crate::store::ContentHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowTask {
    /// Create or overwrite the `target_state` variant from `source`'s content.
    /// Without a source an empty variant is created.
    CopyVariant {
        source: Option<String>,
        target_state: VariantState,
    },
    ConfigVariant {
        variant: String,
        availabilities: Option<Vec<String>>,
        apply_modified: bool,
        versionable: bool,
        set_holder: bool,
    },
    SetHolder {
        variant: String,
        holder: Option<String>,
    },
    RemoveVariant {
        variant: String,
    },
    CreateRequest {
        request_type: RequestType,
        scheduled_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    },
    RejectRequest {
        request: String,
        reason: Option<String>,
    },
    RemoveRequest {
        request: String,
    },
    RenameDocument {
        new_name: String,
    },
    Version {
        variant: String,
    },
    /// Restore the latest version of `variant` created at or before
    /// `historic` into `target`.
    VersionRestoreTo {
        variant: String,
        target: String,
        historic: DateTime<Utc>,
    },
}

impl WorkflowTask {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowTask::CopyVariant { .. } => "copy_variant",
            WorkflowTask::ConfigVariant { .. } => "config_variant",
            WorkflowTask::SetHolder { .. } => "set_holder",
            WorkflowTask::RemoveVariant { .. } => "remove_variant",
            WorkflowTask::CreateRequest { .. } => "create_request",
            WorkflowTask::RejectRequest { .. } => "reject_request",
            WorkflowTask::RemoveRequest { .. } => "remove_request",
            WorkflowTask::RenameDocument { .. } => "rename_document",
            WorkflowTask::Version { .. } => "version",
            WorkflowTask::VersionRestoreTo { .. } => "version_restore_to",
        }
    }

    /// Run the task. Some tasks produce a value for the result slot.
    pub fn execute(
        &self,
        ctx: &mut WorkflowContext,
        handle: &mut dyn ContentHandle,
    ) -> WorkflowResult<Option<Value>> {
        let user = ctx.user().to_string();
        let now = handle.now();

        match self {
            WorkflowTask::CopyVariant {
                source,
                target_state,
            } => {
                let content = match source {
                    Some(id) => find_variant(handle, id)?.content,
                    None => Default::default(),
                };

                match handle.variant(*target_state)? {
                    Some(mut target) => {
                        target.content = content;
                        target.stamp_modified(&user, now);
                        handle.update_variant(&target)?;
                    }
                    None => {
                        let mut target = DocumentVariant::new(*target_state).with_content(content);
                        target.stamp_created(&user, now);
                        handle.add_variant(target)?;
                    }
                }
                debug!(path = %handle.path(), target = %target_state, "Variant copied");
                Ok(None)
            }

            WorkflowTask::ConfigVariant {
                variant,
                availabilities,
                apply_modified,
                versionable,
                set_holder,
            } => {
                let mut target = find_variant(handle, variant)?;
                if let Some(channels) = availabilities {
                    target.availability = channels.clone();
                }
                if *apply_modified {
                    target.stamp_modified(&user, now);
                }
                if *set_holder {
                    target.holder = Some(user.clone());
                }
                handle.update_variant(&target)?;
                if *versionable {
                    handle.checkin(&target.id)?;
                }
                Ok(None)
            }

            WorkflowTask::SetHolder { variant, holder } => {
                handle.set_holder(variant, holder.as_deref())?;
                Ok(None)
            }

            WorkflowTask::RemoveVariant { variant } => {
                handle.remove_variant(variant)?;
                Ok(None)
            }

            WorkflowTask::CreateRequest {
                request_type,
                scheduled_at,
                reason,
            } => {
                if let Some(active) = handle.requests()?.into_iter().find(|r| r.is_active()) {
                    return Err(WorkflowError::IllegalState(format!(
                        "{} already has an active {} request",
                        handle.path(),
                        active.request_type
                    )));
                }
                let scheduled = matches!(
                    request_type,
                    RequestType::ScheduledPublish | RequestType::ScheduledDepublish
                );
                if scheduled && scheduled_at.is_none() {
                    return Err(WorkflowError::task(
                        self.name(),
                        format!("{} request requires a scheduled time", request_type),
                    ));
                }

                let mut request = PublicationRequest::new(*request_type, &user, now);
                request.scheduled_at = *scheduled_at;
                request.reason = reason.clone();
                let id = handle.add_request(request)?;
                Ok(Some(json!({ "request": id })))
            }

            WorkflowTask::RejectRequest { request, reason } => {
                let mut target = find_request(handle, request)?;
                target.request_type = RequestType::Rejected;
                target.reason = reason.clone();
                handle.update_request(&target)?;
                Ok(None)
            }

            WorkflowTask::RemoveRequest { request } => {
                handle.remove_request(request)?;
                Ok(None)
            }

            WorkflowTask::RenameDocument { new_name } => {
                let old_path = handle.path().to_string();
                handle.rename(new_name)?;
                debug!(from = %old_path, to = %handle.path(), "Document renamed");
                Ok(None)
            }

            WorkflowTask::Version { variant } => {
                let version = handle.checkin(variant)?;
                serde_json::to_value(&version)
                    .map(Some)
                    .map_err(|e| WorkflowError::task(self.name(), e))
            }

            WorkflowTask::VersionRestoreTo {
                variant,
                target,
                historic,
            } => {
                let version = handle
                    .versions(variant)?
                    .into_iter()
                    .filter(|v| v.created <= *historic)
                    .max_by_key(|v| v.index)
                    .ok_or_else(|| {
                        WorkflowError::task(
                            self.name(),
                            format!("no version of {} at or before {}", variant, historic),
                        )
                    })?;

                let mut restored = find_variant(handle, target)?;
                restored.content = version.content;
                restored.stamp_modified(&user, now);
                handle.update_variant(&restored)?;
                Ok(None)
            }
        }
    }
}

fn find_variant(handle: &dyn ContentHandle, id: &str) -> WorkflowResult<DocumentVariant> {
    handle
        .variants()?
        .into_iter()
        .find(|v| v.id == id)
        .ok_or_else(|| WorkflowError::Store(StoreError::NotFound(id.to_string())))
}

fn find_request(handle: &dyn ContentHandle, id: &str) -> WorkflowResult<PublicationRequest> {
    handle
        .requests()?
        .into_iter()
        .find(|r| r.id == id)
        .ok_or_else(|| WorkflowError::Store(StoreError::NotFound(id.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DocumentHandle;
    use crate::store::{Repository, Session};
    use serde_json::Map;
    use std::sync::Arc;

    fn seeded() -> (Arc<Repository>, Session) {
        let repo = Repository::new();
        let mut session = repo.session("alice");
        {
            let mut handle = session.create_handle("/content/news").unwrap();
            let mut content = Map::new();
            content.insert("title".to_string(), json!("Hello"));
            handle
                .add_variant(DocumentVariant::new(VariantState::Unpublished).with_content(content))
                .unwrap();
        }
        session.save().unwrap();
        (repo, session)
    }

    fn context(handle: &dyn ContentHandle) -> WorkflowContext {
        WorkflowContext::new("alice", DocumentHandle::project(handle).unwrap())
    }

    #[test]
    fn test_copy_variant_creates_and_overwrites() {
        let (_repo, mut session) = seeded();
        let mut handle = session.handle("/content/news").unwrap();
        let mut ctx = context(&handle);
        let source = handle.variant(VariantState::Unpublished).unwrap().unwrap();

        let copy = WorkflowTask::CopyVariant {
            source: Some(source.id.clone()),
            target_state: VariantState::Published,
        };
        copy.execute(&mut ctx, &mut handle).unwrap();
        copy.execute(&mut ctx, &mut handle).unwrap();

        let variants = handle.variants().unwrap();
        assert_eq!(variants.len(), 2);
        let published = handle.variant(VariantState::Published).unwrap().unwrap();
        assert_eq!(published.content["title"], json!("Hello"));
        assert_eq!(published.created_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_create_request_rejects_second_active_request() {
        let (_repo, mut session) = seeded();
        let mut handle = session.handle("/content/news").unwrap();
        let mut ctx = context(&handle);

        let request = WorkflowTask::CreateRequest {
            request_type: RequestType::Publish,
            scheduled_at: None,
            reason: None,
        };
        request.execute(&mut ctx, &mut handle).unwrap();
        assert!(matches!(
            request.execute(&mut ctx, &mut handle),
            Err(WorkflowError::IllegalState(_))
        ));
    }

    #[test]
    fn test_scheduled_request_requires_time() {
        let (_repo, mut session) = seeded();
        let mut handle = session.handle("/content/news").unwrap();
        let mut ctx = context(&handle);

        let request = WorkflowTask::CreateRequest {
            request_type: RequestType::ScheduledDepublish,
            scheduled_at: None,
            reason: None,
        };
        assert!(matches!(
            request.execute(&mut ctx, &mut handle),
            Err(WorkflowError::Task { task, .. }) if task == "create_request"
        ));
    }

    #[test]
    fn test_reject_request_keeps_history() {
        let (_repo, mut session) = seeded();
        let mut handle = session.handle("/content/news").unwrap();
        let mut ctx = context(&handle);

        WorkflowTask::CreateRequest {
            request_type: RequestType::Publish,
            scheduled_at: None,
            reason: None,
        }
        .execute(&mut ctx, &mut handle)
        .unwrap();
        let id = handle.requests().unwrap()[0].id.clone();

        WorkflowTask::RejectRequest {
            request: id,
            reason: Some("needs a better title".to_string()),
        }
        .execute(&mut ctx, &mut handle)
        .unwrap();

        let requests = handle.requests().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_type, RequestType::Rejected);
        assert_eq!(requests[0].reason.as_deref(), Some("needs a better title"));
    }

    #[test]
    fn test_version_restore_picks_latest_before_point() {
        let (_repo, mut session) = seeded();
        let mut handle = session.handle("/content/news").unwrap();
        let mut ctx = context(&handle);
        let mut variant = handle.variant(VariantState::Unpublished).unwrap().unwrap();

        let first = WorkflowTask::Version {
            variant: variant.id.clone(),
        }
        .execute(&mut ctx, &mut handle)
        .unwrap()
        .unwrap();
        let first_created = first["created"].as_str().unwrap().parse::<DateTime<Utc>>().unwrap();

        variant.content.insert("title".to_string(), json!("Changed"));
        handle.update_variant(&variant).unwrap();

        WorkflowTask::VersionRestoreTo {
            variant: variant.id.clone(),
            target: variant.id.clone(),
            historic: first_created,
        }
        .execute(&mut ctx, &mut handle)
        .unwrap();

        let restored = handle.variant(VariantState::Unpublished).unwrap().unwrap();
        assert_eq!(restored.content["title"], json!("Hello"));

        let too_early = WorkflowTask::VersionRestoreTo {
            variant: variant.id.clone(),
            target: variant.id.clone(),
            historic: first_created - chrono::Duration::days(1),
        };
        assert!(matches!(
            too_early.execute(&mut ctx, &mut handle),
            Err(WorkflowError::Task { .. })
        ));
    }

    #[test]
    fn test_config_variant_sets_channels_and_holder() {
        let (_repo, mut session) = seeded();
        let mut handle = session.handle("/content/news").unwrap();
        let mut ctx = context(&handle);
        let variant = handle.variant(VariantState::Unpublished).unwrap().unwrap();

        WorkflowTask::ConfigVariant {
            variant: variant.id.clone(),
            availabilities: Some(vec!["preview".to_string()]),
            apply_modified: true,
            versionable: true,
            set_holder: true,
        }
        .execute(&mut ctx, &mut handle)
        .unwrap();

        let updated = handle.variant(VariantState::Unpublished).unwrap().unwrap();
        assert!(updated.is_available_in("preview"));
        assert_eq!(updated.holder.as_deref(), Some("alice"));
        assert_eq!(updated.last_modified_by.as_deref(), Some("alice"));
        assert_eq!(handle.versions(&variant.id).unwrap().len(), 1);
    }
}
