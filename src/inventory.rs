//! Credential inventory: fetching records, grouping them by primary pipeline, and
//! folding flow observations into per-pipeline affected groups.

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{
    error::Result,
    flow::{FlowDocument, Marker},
    model::{CredentialRecord, HELPER_ASSET_ID, PARAMETERS_TYPE},
    store::CredentialStore,
};

/// Page size for store queries; above the largest fan-out seen for one instance.
pub const FIND_LIMIT: usize = 5000;

/// Typed form of the store's document selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSelector {
    pub credential_type: Option<String>,
    pub asset_id: Option<String>,
    pub project_id: Option<String>,
    /// Leave out records bound to a single job run.
    pub exclude_job_scoped: bool,
}

impl CredentialSelector {
    /// All parameter credentials of the instance that are not bound to a job run.
    pub fn instance() -> Self {
        CredentialSelector {
            credential_type: Some(PARAMETERS_TYPE.to_string()),
            exclude_job_scoped: true,
            ..Default::default()
        }
    }

    /// Parameter credentials of one primary pipeline, not bound to a job run.
    pub fn primary_pipeline(primary_pipeline_id: impl Into<String>) -> Self {
        CredentialSelector {
            asset_id: Some(primary_pipeline_id.into()),
            ..Self::instance()
        }
    }

    pub fn asset(asset_id: impl Into<String>) -> Self {
        CredentialSelector {
            asset_id: Some(asset_id.into()),
            ..Default::default()
        }
    }

    pub fn scoped(asset_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        CredentialSelector {
            asset_id: Some(asset_id.into()),
            project_id: Some(project_id.into()),
            exclude_job_scoped: true,
            ..Default::default()
        }
    }

    /// Mango selector understood by the document store's `_find`.
    pub fn to_mango(&self) -> Value {
        let mut clauses = Vec::new();
        if self.exclude_job_scoped {
            clauses.push(json!({ "scope.job_id": { "$exists": false } }));
        }
        if let Some(kind) = &self.credential_type {
            clauses.push(json!({ "type": kind }));
        }
        if let Some(asset_id) = &self.asset_id {
            clauses.push(json!({ "scope.asset_id": asset_id }));
        }
        if let Some(project_id) = &self.project_id {
            clauses.push(json!({ "scope.project_id": project_id }));
        }
        match clauses.len() {
            0 => json!({}),
            1 => clauses.remove(0),
            _ => json!({ "$and": clauses }),
        }
    }

    pub fn matches(&self, record: &CredentialRecord) -> bool {
        if self.exclude_job_scoped && record.scope.job_id.is_some() {
            return false;
        }
        if let Some(kind) = &self.credential_type
            && &record.credential_type != kind
        {
            return false;
        }
        if let Some(asset_id) = &self.asset_id
            && record.asset_id() != Some(asset_id.as_str())
        {
            return false;
        }
        if let Some(project_id) = &self.project_id
            && record.project_id() != Some(project_id.as_str())
        {
            return false;
        }
        true
    }
}

/// Page through the store until the cursor is exhausted. No deduplication.
pub fn fetch_all_credentials(
    store: &dyn CredentialStore,
    selector: &CredentialSelector,
) -> Result<Vec<CredentialRecord>> {
    let mut records = Vec::new();
    let mut bookmark: Option<String> = None;
    loop {
        let page = store.find(selector, FIND_LIMIT, bookmark.as_deref())?;
        let fetched = page.docs.len();
        records.extend(page.docs);
        debug!(fetched, total = records.len(), "fetched credential page");
        match page.bookmark {
            Some(next) if fetched > 0 && bookmark.as_deref() != Some(next.as_str()) => {
                bookmark = Some(next);
            }
            _ => break,
        }
    }
    Ok(records)
}

/// Bucket records by `scope.asset_id` (the primary pipeline id) and keep only buckets
/// holding at least one unscoped record. Buckets and records keep store order; the
/// migration helper record is not a pipeline and never forms a bucket.
pub fn group_by_primary_pipeline(
    records: Vec<CredentialRecord>,
) -> IndexMap<String, Vec<CredentialRecord>> {
    let mut groups: IndexMap<String, Vec<CredentialRecord>> = IndexMap::new();
    let mut with_unscoped: IndexSet<String> = IndexSet::new();
    for record in records {
        let Some(asset_id) = record.asset_id().map(str::to_string) else {
            warn!(record_id = %record.id, "credential record without scope.asset_id");
            continue;
        };
        if asset_id == HELPER_ASSET_ID {
            continue;
        }
        if record.is_unscoped() {
            with_unscoped.insert(asset_id.clone());
        }
        groups.entry(asset_id).or_default().push(record);
    }
    debug!(
        primary_pipelines = groups.len(),
        unscoped = with_unscoped.len(),
        "grouped credential records"
    );
    groups.retain(|asset_id, _| with_unscoped.contains(asset_id));
    groups
}

/// What the flows sharing one primary pipeline id look like across all projects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AffectedGroup {
    pub primary_pipeline_id: String,
    pub has_secret_ref: bool,
    pub has_encrypted_value: bool,
    /// Projects hosting an affected copy of the flow, in discovery order.
    pub project_ids: IndexSet<String>,
}

impl AffectedGroup {
    pub fn unaffected(primary_pipeline_id: impl Into<String>) -> Self {
        AffectedGroup {
            primary_pipeline_id: primary_pipeline_id.into(),
            ..Default::default()
        }
    }

    pub fn is_affected(&self) -> bool {
        self.has_secret_ref || self.has_encrypted_value
    }

    /// Fold one project's copy of the flow into the group. Flags only ever turn on.
    pub fn observe(&mut self, project_id: &str, has_secret_ref: bool, has_encrypted_value: bool) {
        self.has_secret_ref |= has_secret_ref;
        self.has_encrypted_value |= has_encrypted_value;
        if has_secret_ref || has_encrypted_value {
            self.project_ids.insert(project_id.to_string());
        }
    }
}

/// Fold every project's flows into per-primary-pipeline groups.
pub fn classify(
    flows_by_project: &IndexMap<String, IndexMap<String, FlowDocument>>,
) -> IndexMap<String, AffectedGroup> {
    let mut groups: IndexMap<String, AffectedGroup> = IndexMap::new();
    for (project_id, flows) in flows_by_project {
        for (pipeline_id, flow) in flows {
            let secret_ref = flow.contains_marker(Marker::SecretRef);
            let encrypted = flow.contains_marker(Marker::EncryptedValue);
            debug!(
                project_id = %project_id,
                pipeline_id = %pipeline_id,
                primary_pipeline_id = %flow.primary_pipeline_id,
                secret_refs = secret_ref,
                encrypted_values = encrypted,
                "classified flow"
            );
            groups
                .entry(flow.primary_pipeline_id.clone())
                .or_insert_with(|| AffectedGroup::unaffected(flow.primary_pipeline_id.clone()))
                .observe(project_id, secret_ref, encrypted);
        }
    }
    groups
}

/// Parsed `updated_at`, falling back to `created_at`.
pub fn record_time(record: &CredentialRecord) -> Option<DateTime<Utc>> {
    let raw = record.timestamp()?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// The most recently updated unscoped record. Ties and undated records fall back to
/// store order (earliest wins); undated records rank below dated ones.
pub fn select_master(records: &[CredentialRecord]) -> Option<&CredentialRecord> {
    let mut master: Option<(&CredentialRecord, Option<DateTime<Utc>>)> = None;
    for record in records.iter().filter(|r| r.is_unscoped()) {
        let time = record_time(record);
        if time.is_none() {
            warn!(record_id = %record.id, "unscoped record has no usable timestamp");
        }
        match &master {
            Some((_, best)) if time <= *best => {}
            _ => master = Some((record, time)),
        }
    }
    master.map(|(record, _)| record)
}
