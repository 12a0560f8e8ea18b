//! Rewrites the sender binding of send-email nodes so that it reads from a parameter
//! instead of a literal address.

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::{
    error::{ErrorLocation, RepairError, Result},
    model::PipelineSummary,
    store::PlatformApi,
};

const SEND_EMAIL_LABEL: &str = "Send email";
const SENDER_INPUT: &str = "sender_addr";

fn declared_names<'a>(value: &'a Value, pointer: &str) -> Vec<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

/// Turn an operator-supplied sender name into a flow expression.
///
/// `set.param` resolves against parameter sets, then plain names are tried as user
/// variables and finally as inputs of the primary pipeline.
pub fn resolve_sender_expression(value: &str, flow: &Value) -> Result<String> {
    let parameter_sets = declared_names(flow, "/app_data/pipeline_data/parameter_sets");
    let variables = declared_names(flow, "/app_data/pipeline_data/variables");
    let primary_id = flow.get("primary_pipeline").and_then(Value::as_str);
    let primary_inputs = flow
        .get("pipelines")
        .and_then(Value::as_array)
        .and_then(|pipelines| {
            pipelines
                .iter()
                .find(|p| primary_id.is_some() && p.get("id").and_then(Value::as_str) == primary_id)
        })
        .map(|p| declared_names(p, "/app_data/pipeline_data/inputs"))
        .unwrap_or_default();

    if let Some((set, param)) = value.split_once('.')
        && parameter_sets.contains(&set)
    {
        return Ok(format!("param_sets.{set}[\"{param}\"]"));
    }
    if variables.contains(&value) {
        return Ok(format!("vars.{value}"));
    }
    if primary_inputs.contains(&value) {
        return Ok(format!("params[\"{value}\"]"));
    }
    Err(RepairError::data_quality(
        format!("{value} not found in pipeline flow"),
        ErrorLocation::default(),
    ))
}

/// Point every send-email node's sender input at `expression`. Returns whether the flow
/// has any send-email node at all.
pub fn rewrite_sender(flow: &mut Value, expression: &str) -> bool {
    let mut found = false;
    let Some(pipelines) = flow.get_mut("pipelines").and_then(Value::as_array_mut) else {
        return false;
    };
    for pipeline in pipelines {
        let Some(nodes) = pipeline.get_mut("nodes").and_then(Value::as_array_mut) else {
            continue;
        };
        for node in nodes {
            let label = node
                .pointer("/app_data/componentLabelRef")
                .and_then(Value::as_str);
            if label != Some(SEND_EMAIL_LABEL) {
                continue;
            }
            found = true;
            let Some(inputs) = node
                .pointer_mut("/app_data/pipeline_data/inputs")
                .and_then(Value::as_array_mut)
            else {
                continue;
            };
            if let Some(input) = inputs
                .iter_mut()
                .find(|input| input.get("name").and_then(Value::as_str) == Some(SENDER_INPUT))
                .and_then(Value::as_object_mut)
            {
                input.remove("value");
                input.remove("ui_data");
                input.insert("value_from".to_string(), json!({ "expression": expression }));
            }
        }
    }
    found
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SenderStatus {
    Updated,
    NoSendEmailNode,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSenderOutcome {
    pub pipeline_id: String,
    pub name: String,
    pub status: SenderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderReport {
    pub project_id: String,
    pub pipelines: Vec<PipelineSenderOutcome>,
}

impl SenderReport {
    pub fn updated(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|p| p.status == SenderStatus::Updated)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|p| matches!(p.status, SenderStatus::Failed(_)))
            .count()
    }
}

/// Update every pipeline of the named project, or only the pipeline named
/// `pipeline_name`. A failing pipeline is reported and the rest still run.
pub fn update_sender(
    platform: &dyn PlatformApi,
    project_name: &str,
    pipeline_name: Option<&str>,
    sender_value: &str,
) -> Result<SenderReport> {
    let project = platform
        .find_project_by_name(project_name)?
        .ok_or_else(|| RepairError::config(format!("project {project_name} not found")))?;

    let mut pipelines: Vec<PipelineSummary> = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = platform.list_pipelines(&project.id, cursor.as_deref())?;
        pipelines.extend(page.items);
        match page.next {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => break,
        }
    }
    if let Some(name) = pipeline_name {
        pipelines.retain(|p| p.name == name);
    }

    let mut report = SenderReport {
        project_id: project.id.clone(),
        pipelines: Vec::with_capacity(pipelines.len()),
    };
    for pipeline in pipelines {
        info!(pipeline_id = %pipeline.id, "processing pipeline {}", pipeline.name);
        let status = match update_one(platform, &project.id, &pipeline, sender_value) {
            Ok(status) => status,
            Err(err) => {
                error!(pipeline_id = %pipeline.id, error = %err, "sender update failed");
                SenderStatus::Failed(err.to_string())
            }
        };
        report.pipelines.push(PipelineSenderOutcome {
            pipeline_id: pipeline.id,
            name: pipeline.name,
            status,
        });
    }
    Ok(report)
}

fn update_one(
    platform: &dyn PlatformApi,
    project_id: &str,
    pipeline: &PipelineSummary,
    sender_value: &str,
) -> Result<SenderStatus> {
    let mut flow = platform.fetch_flow(project_id, &pipeline.id)?;
    let expression = resolve_sender_expression(sender_value, &flow)?;
    if !rewrite_sender(&mut flow, &expression) {
        return Ok(SenderStatus::NoSendEmailNode);
    }
    platform.upload_pipeline_version(project_id, &pipeline.id, &pipeline.name, &flow)?;
    Ok(SenderStatus::Updated)
}
