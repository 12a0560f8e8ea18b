//! Applies repair plans against the credential store, one action at a time.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    context::MigrationContext,
    error::Result,
    inventory::CredentialSelector,
    model::{
        CredentialOwner, CredentialRecord, CredentialScope, NewCredentialDocument, PARAMETERS_TYPE,
        PatchOp, VOID_PROJECT_ID,
    },
    plan::RepairAction,
    store::{CredentialApi, CredentialStore, SecretVault},
};

pub use crate::model::HELPER_ASSET_ID;

pub const MIGRATED_RECORD_NAME: &str = "orchestration_flow_parameters_migrated";
const PLACEHOLDER_SECRET_KEY: &str = "task_credentials_empty_secret_param";
const PLACEHOLDER_SECRET_VALUE: &str = "placeholder";
pub const REASON_CREATE_FAILED: &str = "kept until every project has its own record";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableMode {
    /// Re-point the record at the void project; the document stays for audit.
    #[default]
    Void,
    /// Delete the document.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure(String),
    Ignored(String),
}

impl ActionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ActionOutcome::Failure(_))
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Success => f.write_str("success"),
            ActionOutcome::Failure(reason) => write!(f, "failure: {reason}"),
            ActionOutcome::Ignored(reason) => write!(f, "ignored: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub action: &'static str,
    pub subject: String,
    pub reason: String,
    pub outcome: ActionOutcome,
}

/// One mutual-exclusion scope per primary pipeline id.
#[derive(Debug, Default)]
pub struct GroupLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    pub fn handle(&self, primary_pipeline_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(primary_pipeline_id.to_string())
            .or_default()
            .clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub disable_mode: DisableMode,
    /// Written as `owner.user_id` of records the executor creates.
    pub owner_user_id: String,
}

pub struct RepairExecutor<'a> {
    store: &'a dyn CredentialStore,
    api: &'a dyn CredentialApi,
    vault: &'a dyn SecretVault,
    options: ExecutorOptions,
    helper_secret: Mutex<Option<String>>,
    locks: GroupLocks,
}

impl<'a> RepairExecutor<'a> {
    pub fn new(
        store: &'a dyn CredentialStore,
        api: &'a dyn CredentialApi,
        vault: &'a dyn SecretVault,
        options: ExecutorOptions,
    ) -> Self {
        RepairExecutor {
            store,
            api,
            vault,
            options,
            helper_secret: Mutex::new(None),
            locks: GroupLocks::default(),
        }
    }

    /// Apply one group's plan while holding that group's lock. A failing action is
    /// reported and the remaining actions still run.
    ///
    /// Creates run before disables, and disables are held back when any create failed:
    /// an unscoped record is only retired once every affected project has a complete
    /// record of its own, so an interrupted group still shows up on the next run.
    /// Results come back in plan order.
    pub fn execute(
        &self,
        ctx: &MigrationContext,
        primary_pipeline_id: &str,
        plan: &[RepairAction],
    ) -> Vec<ActionResult> {
        let lock = self.locks.handle(primary_pipeline_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (disables, others): (Vec<_>, Vec<_>) = plan
            .iter()
            .enumerate()
            .partition(|(_, action)| matches!(action, RepairAction::Disable { .. }));
        let mut results = Vec::with_capacity(plan.len());
        for (idx, action) in others {
            results.push((idx, self.run(ctx, primary_pipeline_id, action)));
        }
        let create_failed = results
            .iter()
            .any(|(_, r)| r.action == "create" && r.outcome.is_failure());
        for (idx, action) in disables {
            let result = if create_failed {
                warn!(
                    primary_pipeline_id,
                    subject = %action.subject(),
                    "keeping record unscoped, a create in this group failed"
                );
                ActionResult {
                    action: action.name(),
                    subject: action.subject(),
                    reason: action.reason().to_string(),
                    outcome: ActionOutcome::Ignored(REASON_CREATE_FAILED.to_string()),
                }
            } else {
                self.run(ctx, primary_pipeline_id, action)
            };
            results.push((idx, result));
        }
        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn run(
        &self,
        ctx: &MigrationContext,
        primary_pipeline_id: &str,
        action: &RepairAction,
    ) -> ActionResult {
        info!(
            primary_pipeline_id,
            action = action.name(),
            subject = %action.subject(),
            "execute {} action",
            action.name()
        );
        let outcome = self.apply(ctx, action);
        info!(
            primary_pipeline_id,
            action = action.name(),
            "{} action completed with status {outcome}",
            action.name()
        );
        ActionResult {
            action: action.name(),
            subject: action.subject(),
            reason: action.reason().to_string(),
            outcome,
        }
    }

    fn apply(&self, ctx: &MigrationContext, action: &RepairAction) -> ActionOutcome {
        let result = match action {
            RepairAction::Skip { .. } | RepairAction::Break { .. } => Ok(ActionOutcome::Success),
            RepairAction::Disable { record, .. } => self.disable(record),
            RepairAction::Create {
                primary_pipeline_id,
                project_id,
                ..
            } => self.create(ctx, primary_pipeline_id, project_id),
        };
        result.unwrap_or_else(|err| ActionOutcome::Failure(err.to_string()))
    }

    fn disable(&self, planned: &CredentialRecord) -> Result<ActionOutcome> {
        let Some(mut current) = self.store.get(&planned.id)? else {
            return Ok(ActionOutcome::Ignored(format!(
                "record {} no longer exists",
                planned.id
            )));
        };
        if current.is_voided() {
            return Ok(ActionOutcome::Success);
        }
        if let Some(project_id) = current.project_id() {
            return Ok(ActionOutcome::Ignored(format!(
                "record {} is now scoped to {project_id}",
                current.id
            )));
        }
        match self.options.disable_mode {
            DisableMode::Void => {
                current.scope.project_id = Some(VOID_PROJECT_ID.to_string());
                self.store.put(&current)?;
            }
            DisableMode::Delete => self.store.delete(&current)?,
        }
        Ok(ActionOutcome::Success)
    }

    fn create(
        &self,
        ctx: &MigrationContext,
        primary_pipeline_id: &str,
        project_id: &str,
    ) -> Result<ActionOutcome> {
        let Some(flow) = ctx.flow_for(primary_pipeline_id, project_id) else {
            return Ok(ActionOutcome::Ignored(format!(
                "{primary_pipeline_id} is not in the project {project_id}"
            )));
        };
        let existing = self.store.find(
            &CredentialSelector::scoped(primary_pipeline_id, project_id),
            1,
            None,
        )?;
        if let Some(record) = existing.docs.first() {
            return Ok(ActionOutcome::Ignored(format!(
                "record {} is already scoped to {project_id}",
                record.id
            )));
        }

        let payload = flow.secret_placeholders();
        info!(
            primary_pipeline_id,
            project_id,
            parameters = payload.len(),
            "attempt to fix {primary_pipeline_id} in project {project_id}"
        );

        let helper_secret = self.ensure_helper_secret()?;
        let now = timestamp_now();
        let new_id = self.store.insert(&NewCredentialDocument {
            created_at: now.clone(),
            creator_id: String::new(),
            name: MIGRATED_RECORD_NAME.to_string(),
            owner: CredentialOwner {
                user_id: self.options.owner_user_id.clone(),
            },
            scope: CredentialScope::for_project(primary_pipeline_id, project_id),
            secret_id: helper_secret,
            credential_type: PARAMETERS_TYPE.to_string(),
            updated_at: now,
        })?;
        info!(
            primary_pipeline_id,
            project_id,
            record_id = %new_id,
            "created project-scoped record"
        );

        if payload.is_empty() {
            return Ok(ActionOutcome::Success);
        }
        let secret: Map<String, Value> = payload
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect();
        if let Err(err) = self
            .api
            .patch(&new_id, &[PatchOp::replace("/secret", Value::Object(secret))])
        {
            warn!(record_id = %new_id, error = %err, "record created but its secret was not set, removing it");
            // an incomplete record would mark the project as satisfied on the next run
            let removed = match self.store.get(&new_id) {
                Ok(Some(record)) => self.store.delete(&record),
                Ok(None) => Ok(()),
                Err(get_err) => Err(get_err),
            };
            if let Err(cleanup) = removed {
                warn!(record_id = %new_id, error = %cleanup, "incomplete record left in place");
                return Ok(ActionOutcome::Failure(format!(
                    "could not patch the record {new_id}: {err}; removing it failed: {cleanup}"
                )));
            }
            return Ok(ActionOutcome::Failure(format!(
                "could not patch the record {new_id}: {err}"
            )));
        }
        Ok(ActionOutcome::Success)
    }

    /// Secret id shared by freshly created records until their payload is patched in.
    /// Found through the helper record, or created once together with that record.
    fn ensure_helper_secret(&self) -> Result<String> {
        let mut cached = self
            .helper_secret
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(secret_id) = cached.as_ref() {
            return Ok(secret_id.clone());
        }

        let found = self
            .store
            .find(&CredentialSelector::asset(HELPER_ASSET_ID), 1, None)?
            .docs
            .into_iter()
            .map(|record| record.secret_id)
            .find(|secret_id| !secret_id.is_empty());
        let secret_id = match found {
            Some(secret_id) => secret_id,
            None => {
                let mut generic = Map::new();
                generic.insert(
                    PLACEHOLDER_SECRET_KEY.to_string(),
                    Value::String(PLACEHOLDER_SECRET_VALUE.to_string()),
                );
                let name = format!("migration-helper-{}", Utc::now().format("%s-%f"));
                let secret_id = self.vault.create_secret(&name, &generic)?;
                let now = timestamp_now();
                self.store.insert(&NewCredentialDocument {
                    created_at: now.clone(),
                    creator_id: String::new(),
                    name: HELPER_ASSET_ID.to_string(),
                    owner: CredentialOwner {
                        user_id: self.options.owner_user_id.clone(),
                    },
                    scope: CredentialScope::for_asset(HELPER_ASSET_ID),
                    secret_id: secret_id.clone(),
                    credential_type: PARAMETERS_TYPE.to_string(),
                    updated_at: now,
                })?;
                info!(secret_id = %secret_id, "created migration helper secret");
                secret_id
            }
        };
        *cached = Some(secret_id.clone());
        Ok(secret_id)
    }
}

fn timestamp_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
