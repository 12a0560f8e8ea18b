use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    flow::FlowDocument,
    graph::Diagnostic,
    inventory::AffectedGroup,
    model::{CredentialRecord, Project},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataQualityIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    pub message: String,
}

/// Everything one migration run has learned. Lives exactly as long as the run.
#[derive(Debug, Clone, Default)]
pub struct MigrationContext {
    pub projects: Vec<Project>,
    /// project id -> pipeline asset id -> flow
    pub flows_by_project: IndexMap<String, IndexMap<String, FlowDocument>>,
    pub groups: IndexMap<String, AffectedGroup>,
    /// primary pipeline id -> records, only for groups holding an unscoped record
    pub credentials: IndexMap<String, Vec<CredentialRecord>>,
    pub issues: Vec<DataQualityIssue>,
    pub hazards: Vec<Diagnostic>,
}

impl MigrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_flow(&mut self, project_id: &str, pipeline_id: &str, flow: FlowDocument) {
        self.flows_by_project
            .entry(project_id.to_string())
            .or_default()
            .insert(pipeline_id.to_string(), flow);
    }

    pub fn note_issue(
        &mut self,
        project_id: Option<&str>,
        pipeline_id: Option<&str>,
        message: impl Into<String>,
    ) {
        self.issues.push(DataQualityIssue {
            project_id: project_id.map(str::to_string),
            pipeline_id: pipeline_id.map(str::to_string),
            message: message.into(),
        });
    }

    /// The project's copy of the flow built on `primary_pipeline_id`.
    pub fn flow_for(&self, primary_pipeline_id: &str, project_id: &str) -> Option<&FlowDocument> {
        self.flows_by_project
            .get(project_id)?
            .values()
            .find(|flow| flow.primary_pipeline_id == primary_pipeline_id)
    }

    pub fn group(&self, primary_pipeline_id: &str) -> AffectedGroup {
        self.groups
            .get(primary_pipeline_id)
            .cloned()
            .unwrap_or_else(|| AffectedGroup::unaffected(primary_pipeline_id))
    }

    pub fn flow_count(&self) -> usize {
        self.flows_by_project.values().map(IndexMap::len).sum()
    }
}
