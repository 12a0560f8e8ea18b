//! One reconciliation run: discover flows, classify them, inventory credentials, dump
//! everything for audit, plan per primary pipeline and optionally apply the plans.

use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    audit::AuditWriter,
    config::ReconcileOptions,
    context::{DataQualityIssue, MigrationContext},
    error::{RepairError, Result},
    execute::{ActionResult, ExecutorOptions, RepairExecutor},
    flow::FlowDocument,
    graph::{Diagnostic, analyze_pipeline},
    inventory::{CredentialSelector, classify, fetch_all_credentials, group_by_primary_pipeline, select_master},
    model::{PipelineSummary, Project},
    plan::{REASON_SECRET_REFS, RepairAction, plan_repairs},
    store::{CredentialApi, CredentialStore, PlatformApi, SecretVault},
};

/// Final state of one primary pipeline group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Plan computed but not applied.
    Planned,
    /// Plan applied without failures.
    Fixed,
    /// Nothing to do.
    Skipped,
    /// Not safe to repair automatically.
    Broken,
    /// At least one action failed.
    Failed,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Disposition::Planned => "planned",
            Disposition::Fixed => "fixed",
            Disposition::Skipped => "skipped",
            Disposition::Broken => "broken",
            Disposition::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReport {
    pub primary_pipeline_id: String,
    pub disposition: Disposition,
    pub reason: String,
    pub project_ids: Vec<String>,
    pub records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_record_id: Option<String>,
    /// Parameter names held by the master record's secret, when it could be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_secret_keys: Option<Vec<String>>,
    pub plan: Vec<RepairAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ActionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub fix: bool,
    pub projects: usize,
    pub flows: usize,
    pub credentials: usize,
    pub hazards: Vec<Diagnostic>,
    pub issues: Vec<DataQualityIssue>,
    pub groups: Vec<GroupReport>,
}

impl RunReport {
    pub fn count(&self, disposition: Disposition) -> usize {
        self.groups
            .iter()
            .filter(|g| g.disposition == disposition)
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.count(Disposition::Failed) > 0
    }
}

/// Everything fetched for one project.
struct ProjectDiscovery {
    project: Project,
    flows: Vec<(PipelineSummary, Result<Value>)>,
    listing_error: Option<RepairError>,
}

pub struct Reconciler {
    platform: Arc<dyn PlatformApi>,
    store: Arc<dyn CredentialStore>,
    api: Arc<dyn CredentialApi>,
    vault: Arc<dyn SecretVault>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        platform: Arc<dyn PlatformApi>,
        store: Arc<dyn CredentialStore>,
        api: Arc<dyn CredentialApi>,
        vault: Arc<dyn SecretVault>,
        options: ReconcileOptions,
    ) -> Self {
        Reconciler {
            platform,
            store,
            api,
            vault,
            options,
        }
    }

    pub fn run(&self) -> Result<RunReport> {
        let mut ctx = MigrationContext::new();
        let mut audit = match &self.options.dump_dir {
            Some(dir) => Some(AuditWriter::new(dir)?),
            None => None,
        };

        ctx.projects = self.discover_projects()?;
        info!(projects = ctx.projects.len(), "projects discovered");
        for discovery in self.discover_flows(&ctx.projects)? {
            self.absorb(&mut ctx, discovery, audit.as_mut())?;
        }
        info!(flows = ctx.flow_count(), "pipeline flows discovered");

        ctx.groups = classify(&ctx.flows_by_project);
        let affected = ctx.groups.values().filter(|g| g.is_affected()).count();
        info!(
            primary_pipelines = ctx.groups.len(),
            affected, "classified flows"
        );
        ctx.hazards = collect_hazards(&ctx);

        let selector = match &self.options.primary_pipeline_id {
            Some(id) => CredentialSelector::primary_pipeline(id.clone()),
            None => CredentialSelector::instance(),
        };
        let records = fetch_all_credentials(self.store.as_ref(), &selector)?;
        let credentials = records.len();
        info!(records = credentials, "credential records fetched");
        ctx.credentials = group_by_primary_pipeline(records);
        info!(groups = ctx.credentials.len(), "primary pipelines with unscoped records");

        if let Some(audit) = audit.as_mut() {
            let mut undumped = Vec::new();
            for (ppid, records) in &ctx.credentials {
                match audit.write_credentials(ppid, records) {
                    Ok(_) => {}
                    Err(err @ RepairError::DataQuality { .. }) => {
                        warn!(primary_pipeline_id = %ppid, error = %err, "skipping group without audit dump");
                        undumped.push((ppid.clone(), err.to_string()));
                    }
                    Err(err) => return Err(err),
                }
            }
            // a group is never mutated without its dump on disk
            for (ppid, message) in undumped {
                ctx.credentials.shift_remove(&ppid);
                ctx.note_issue(None, Some(&ppid), message);
            }
            let manifest = audit.write_manifest()?;
            info!(manifest = %manifest.display(), "audit dumps written");
        }

        let executor = RepairExecutor::new(
            self.store.as_ref(),
            self.api.as_ref(),
            self.vault.as_ref(),
            ExecutorOptions {
                disable_mode: self.options.disable_mode,
                owner_user_id: self.options.owner_user_id.clone(),
            },
        );
        let total = ctx.credentials.len();
        let mut groups = Vec::with_capacity(total);
        for (idx, ppid) in ctx.credentials.keys().enumerate() {
            info!(
                primary_pipeline_id = %ppid,
                "------- {}/{total} processing {ppid}",
                idx + 1
            );
            groups.push(self.process_group(&ctx, &executor, ppid));
        }

        Ok(RunReport {
            fix: self.options.fix,
            projects: ctx.projects.len(),
            flows: ctx.flow_count(),
            credentials,
            hazards: ctx.hazards,
            issues: ctx.issues,
            groups,
        })
    }

    fn discover_projects(&self) -> Result<Vec<Project>> {
        let listed = match &self.options.project_id {
            Some(id) => vec![self.platform.get_project(id)?],
            None => {
                let mut projects = Vec::new();
                let mut cursor: Option<String> = None;
                loop {
                    let page = self.platform.list_projects(cursor.as_deref())?;
                    let fetched = page.items.len();
                    projects.extend(page.items);
                    match page.next {
                        Some(next) if fetched > 0 && cursor.as_deref() != Some(next.as_str()) => {
                            cursor = Some(next)
                        }
                        _ => break,
                    }
                }
                projects
            }
        };
        Ok(listed
            .into_iter()
            .filter(|project| {
                if project.is_git_based() {
                    info!(project_id = %project.id, "skipping git-based project {}", project.name);
                    return false;
                }
                debug!(project_id = %project.id, "found project {}", project.name);
                true
            })
            .collect())
    }

    /// Fetch every project's flows on a bounded pool of blocking workers. Results come
    /// back in project order regardless of completion order.
    fn discover_flows(&self, projects: &[Project]) -> Result<Vec<ProjectDiscovery>> {
        let runtime = tokio::runtime::Runtime::new().map_err(|e| RepairError::Internal {
            message: format!("cannot start discovery runtime: {e}"),
        })?;
        let workers = self.options.workers.max(1);
        runtime.block_on(async {
            let semaphore = Arc::new(Semaphore::new(workers));
            let mut tasks = JoinSet::new();
            for (idx, project) in projects.iter().cloned().enumerate() {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| RepairError::Internal {
                        message: e.to_string(),
                    })?;
                let platform = Arc::clone(&self.platform);
                tasks.spawn_blocking(move || {
                    let _permit = permit;
                    (idx, discover_project(platform.as_ref(), project))
                });
            }
            let mut done = Vec::with_capacity(projects.len());
            while let Some(joined) = tasks.join_next().await {
                done.push(joined.map_err(|e| RepairError::Internal {
                    message: format!("discovery worker failed: {e}"),
                })?);
            }
            done.sort_by_key(|(idx, _)| *idx);
            Ok::<_, RepairError>(done.into_iter().map(|(_, discovery)| discovery).collect())
        })
    }

    fn absorb(
        &self,
        ctx: &mut MigrationContext,
        discovery: ProjectDiscovery,
        mut audit: Option<&mut AuditWriter>,
    ) -> Result<()> {
        let project_id = discovery.project.id.as_str();
        if let Some(err) = discovery.listing_error {
            warn!(project_id, error = %err, "cannot list pipelines");
            ctx.note_issue(Some(project_id), None, err.to_string());
        }
        for (pipeline, fetched) in discovery.flows {
            let value = match fetched {
                Ok(value) => value,
                Err(err) => {
                    warn!(project_id, pipeline_id = %pipeline.id, error = %err, "cannot fetch flow");
                    ctx.note_issue(Some(project_id), Some(&pipeline.id), err.to_string());
                    continue;
                }
            };
            if let Some(audit) = audit.as_deref_mut() {
                match audit.write_flow(project_id, &pipeline.id, &value) {
                    Ok(_) => {}
                    Err(err @ RepairError::DataQuality { .. }) => {
                        warn!(project_id, pipeline_id = %pipeline.id, error = %err, "skipping flow");
                        ctx.note_issue(Some(project_id), Some(&pipeline.id), err.to_string());
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            let label = format!("{project_id}/{}", pipeline.id);
            match FlowDocument::from_value(value, label) {
                Ok(flow) => ctx.record_flow(project_id, &pipeline.id, flow),
                Err(err) => {
                    warn!(project_id, pipeline_id = %pipeline.id, error = %err, "skipping flow");
                    ctx.note_issue(Some(project_id), Some(&pipeline.id), err.to_string());
                }
            }
        }
        Ok(())
    }

    fn process_group(
        &self,
        ctx: &MigrationContext,
        executor: &RepairExecutor<'_>,
        primary_pipeline_id: &str,
    ) -> GroupReport {
        let records = ctx
            .credentials
            .get(primary_pipeline_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let group = ctx.group(primary_pipeline_id);
        for record in records {
            debug!(
                primary_pipeline_id,
                record_id = %record.id,
                project_id = record.project_id().unwrap_or("-"),
                "credential record"
            );
        }

        let master = select_master(records);
        let mut master_secret_keys = None;
        if let Some(master) = master {
            info!(primary_pipeline_id, record_id = %master.id, "master record");
            match self.vault.read_record_secret(master) {
                Ok(Some(secret)) => {
                    let keys: Vec<String> = secret.keys().cloned().collect();
                    info!(primary_pipeline_id, "values: {keys:?}");
                    master_secret_keys = Some(keys);
                }
                Ok(None) => debug!(primary_pipeline_id, "master secret not readable"),
                Err(err) => warn!(primary_pipeline_id, error = %err, "cannot read master secret"),
            }
        }

        let plan = plan_repairs(&group, records);
        for action in &plan {
            info!(
                primary_pipeline_id,
                action = action.name(),
                subject = %action.subject(),
                "planned {}: {}",
                action.name(),
                action.reason()
            );
        }

        let mut results = Vec::new();
        let (disposition, reason) = match plan.as_slice() {
            [RepairAction::Break { reason }] if reason == REASON_SECRET_REFS => {
                (Disposition::Broken, reason.clone())
            }
            [RepairAction::Break { reason }] => (Disposition::Skipped, reason.clone()),
            _ if !self.options.fix => (
                Disposition::Planned,
                format!("{} action(s) planned", plan.len()),
            ),
            _ => {
                results = executor.execute(ctx, primary_pipeline_id, &plan);
                let failures = results.iter().filter(|r| r.outcome.is_failure()).count();
                if failures > 0 {
                    (
                        Disposition::Failed,
                        format!("{failures} of {} action(s) failed", results.len()),
                    )
                } else {
                    (
                        Disposition::Fixed,
                        format!("{} action(s) applied", results.len()),
                    )
                }
            }
        };
        match disposition {
            Disposition::Failed => {
                error!(primary_pipeline_id, %disposition, "{primary_pipeline_id}: {disposition} ({reason})")
            }
            _ => info!(primary_pipeline_id, %disposition, "{primary_pipeline_id}: {disposition} ({reason})"),
        }

        GroupReport {
            primary_pipeline_id: primary_pipeline_id.to_string(),
            disposition,
            reason,
            project_ids: group.project_ids.iter().cloned().collect(),
            records: records.len(),
            master_record_id: master.map(|m| m.id.clone()),
            master_secret_keys,
            plan,
            results,
        }
    }
}

fn discover_project(platform: &dyn PlatformApi, project: Project) -> ProjectDiscovery {
    let mut discovery = ProjectDiscovery {
        project,
        flows: Vec::new(),
        listing_error: None,
    };
    let project_id = discovery.project.id.clone();
    let mut cursor: Option<String> = None;
    loop {
        let page = match platform.list_pipelines(&project_id, cursor.as_deref()) {
            Ok(page) => page,
            Err(err) => {
                discovery.listing_error = Some(err);
                break;
            }
        };
        let fetched = page.items.len();
        for pipeline in page.items {
            debug!(project_id = %project_id, pipeline_id = %pipeline.id, "get pipeline flow");
            let flow = platform.fetch_flow(&project_id, &pipeline.id);
            discovery.flows.push((pipeline, flow));
        }
        match page.next {
            Some(next) if fetched > 0 && cursor.as_deref() != Some(next.as_str()) => {
                cursor = Some(next)
            }
            _ => break,
        }
    }
    discovery
}

/// Wait-for-any diagnostics for every discovered flow. Advisory only.
fn collect_hazards(ctx: &MigrationContext) -> Vec<Diagnostic> {
    let mut hazards = Vec::new();
    for (project_id, flows) in &ctx.flows_by_project {
        for (pipeline_id, flow) in flows {
            for pipeline in &flow.pipelines {
                for diag in analyze_pipeline(pipeline) {
                    warn!(
                        project_id = %project_id,
                        pipeline_id = %pipeline_id,
                        code = diag.code,
                        "{}",
                        diag.message
                    );
                    hazards.push(Diagnostic {
                        location: Some(format!(
                            "{project_id}/{pipeline_id}:{}",
                            diag.location.unwrap_or_default()
                        )),
                        ..diag
                    });
                }
            }
        }
    }
    hazards
}
