use indexmap::IndexSet;
use serde::Serialize;

use crate::{inventory::AffectedGroup, model::CredentialRecord};

pub const REASON_SECRET_REFS: &str = "contains secret references, cannot auto-fix";
pub const REASON_NOTHING_TO_FIX: &str = "nothing to fix";
pub const REASON_SUPERSEDED: &str = "unscoped record superseded";
pub const REASON_ALREADY_DISABLED: &str = "record already disabled";
pub const REASON_CREATE: &str = "create project-scoped record";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    Skip {
        record: CredentialRecord,
        reason: String,
    },
    Disable {
        record: CredentialRecord,
        reason: String,
    },
    Create {
        primary_pipeline_id: String,
        project_id: String,
        reason: String,
    },
    Break {
        reason: String,
    },
}

impl RepairAction {
    pub fn name(&self) -> &'static str {
        match self {
            RepairAction::Skip { .. } => "skip",
            RepairAction::Disable { .. } => "disable",
            RepairAction::Create { .. } => "create",
            RepairAction::Break { .. } => "break",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            RepairAction::Skip { reason, .. }
            | RepairAction::Disable { reason, .. }
            | RepairAction::Create { reason, .. }
            | RepairAction::Break { reason } => reason,
        }
    }

    /// Short subject for log lines: a record id or a (pipeline, project) pair.
    pub fn subject(&self) -> String {
        match self {
            RepairAction::Skip { record, .. } | RepairAction::Disable { record, .. } => {
                record.id.clone()
            }
            RepairAction::Create {
                primary_pipeline_id,
                project_id,
                ..
            } => format!("{primary_pipeline_id}@{project_id}"),
            RepairAction::Break { .. } => String::new(),
        }
    }
}

/// Compute the repair plan for one primary pipeline. Pure; the same group and records
/// always yield the same sequence.
///
/// Records are visited in the order given: scoped ones are skipped and satisfy their
/// project, unscoped ones are disabled. Every affected project left unsatisfied then
/// gets a create action, in the group's project order.
pub fn plan_repairs(group: &AffectedGroup, records: &[CredentialRecord]) -> Vec<RepairAction> {
    if group.has_secret_ref {
        return vec![RepairAction::Break {
            reason: REASON_SECRET_REFS.to_string(),
        }];
    }
    if !group.has_encrypted_value {
        return vec![RepairAction::Break {
            reason: REASON_NOTHING_TO_FIX.to_string(),
        }];
    }

    let mut actions = Vec::with_capacity(records.len() + group.project_ids.len());
    let mut satisfied: IndexSet<&str> = IndexSet::new();
    for record in records {
        match record.project_id() {
            Some(_) if record.is_voided() => actions.push(RepairAction::Skip {
                record: record.clone(),
                reason: REASON_ALREADY_DISABLED.to_string(),
            }),
            Some(project_id) => {
                satisfied.insert(project_id);
                actions.push(RepairAction::Skip {
                    record: record.clone(),
                    reason: format!("already scoped to {project_id}"),
                });
            }
            None => actions.push(RepairAction::Disable {
                record: record.clone(),
                reason: REASON_SUPERSEDED.to_string(),
            }),
        }
    }

    for project_id in &group.project_ids {
        if satisfied.insert(project_id.as_str()) {
            actions.push(RepairAction::Create {
                primary_pipeline_id: group.primary_pipeline_id.clone(),
                project_id: project_id.clone(),
                reason: REASON_CREATE.to_string(),
            });
        }
    }
    actions
}
