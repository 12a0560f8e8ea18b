//! Task reference graph of a pipeline and the wait-for-any hazard check.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::Write as _,
    fs,
    path::Path,
};

use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::{
    error::{ErrorLocation, RepairError, Result},
    flow::{PipelineGraph, parse_pipelines},
};

/// Component type of the synchronizer that proceeds once any one predecessor completes.
pub const WAIT_FOR_ANY_COMPONENT: &str = "wait-sequencer-any";

lazy_static! {
    static ref TASK_REF_RE: Regex = Regex::new(r"tasks\.([a-zA-Z0-9_]+)").unwrap();
}

/// Where an input gets its value from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Binding {
    Literal { value: Value },
    Expression { expression: String },
    NodeOutput { node_id_ref: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub display_name: String,
    pub component_type: String,
    /// Predecessors through graph links.
    pub inbound_links: Vec<String>,
    pub input_bindings: IndexMap<String, Binding>,
    /// Task ids referenced by each input, in input order.
    pub task_refs_per_input: IndexMap<String, BTreeSet<String>>,
    /// Union of `task_refs_per_input`.
    pub referenced_task_ids: BTreeSet<String>,
}

impl GraphNode {
    pub fn from_value(node: &Value) -> Option<Self> {
        let id = node.get("id").and_then(Value::as_str)?.to_string();
        let pipeline_data = node.pointer("/app_data/pipeline_data");
        let display_name = pipeline_data
            .and_then(|pd| pd.get("descriptive_name"))
            .and_then(Value::as_str)
            .or_else(|| node.pointer("/app_data/ui_data/label").and_then(Value::as_str))
            .unwrap_or(&id)
            .to_string();
        let component_type = pipeline_data
            .and_then(|pd| pd.pointer("/config/link/component_id_ref"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let inbound_links = node
            .pointer("/inputs/0/links")
            .and_then(Value::as_array)
            .map(|links| {
                links
                    .iter()
                    .filter_map(|link| link.get("node_id_ref").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut input_bindings = IndexMap::new();
        let mut task_refs_per_input = IndexMap::new();
        let mut referenced_task_ids = BTreeSet::new();
        let inputs = pipeline_data
            .and_then(|pd| pd.get("inputs"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for input in inputs {
            let Some(name) = input.get("name").and_then(Value::as_str) else {
                continue;
            };
            let refs = input_task_refs(input);
            referenced_task_ids.extend(refs.iter().cloned());
            input_bindings.insert(name.to_string(), parse_binding(input));
            task_refs_per_input.insert(name.to_string(), refs);
        }

        Some(GraphNode {
            id,
            display_name,
            component_type,
            inbound_links,
            input_bindings,
            task_refs_per_input,
            referenced_task_ids,
        })
    }

    pub fn is_any_gate(&self) -> bool {
        self.component_type == WAIT_FOR_ANY_COMPONENT
    }

    /// First input, in declaration order, that references `task_id`.
    pub fn input_referencing(&self, task_id: &str) -> Option<&str> {
        self.task_refs_per_input
            .iter()
            .find(|(_, refs)| refs.contains(task_id))
            .map(|(name, _)| name.as_str())
    }
}

fn parse_binding(input: &Value) -> Binding {
    if let Some(value_from) = input.get("value_from") {
        if let Some(expression) = value_from.get("expression").and_then(Value::as_str) {
            return Binding::Expression {
                expression: expression.to_string(),
            };
        }
        if let Some(node_id_ref) = value_from
            .pointer("/node_output/node_id_ref")
            .and_then(Value::as_str)
        {
            return Binding::NodeOutput {
                node_id_ref: node_id_ref.to_string(),
            };
        }
    }
    Binding::Literal {
        value: input.get("value").cloned().unwrap_or(Value::Null),
    }
}

fn input_task_refs(input: &Value) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    let Some(value_from) = input.get("value_from") else {
        return refs;
    };
    if let Some(expression) = value_from.get("expression").and_then(Value::as_str) {
        refs.extend(task_ids_in_expression(expression));
    }
    if let Some(node_id_ref) = value_from
        .pointer("/node_output/node_id_ref")
        .and_then(Value::as_str)
    {
        refs.insert(node_id_ref.to_string());
    }
    refs
}

/// Every `tasks.<id>` occurrence in an expression.
pub fn task_ids_in_expression(expression: &str) -> BTreeSet<String> {
    TASK_REF_RE
        .captures_iter(expression)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

pub type ReferenceGraph = IndexMap<String, GraphNode>;

pub fn build_reference_graph(pipeline: &PipelineGraph) -> ReferenceGraph {
    let mut graph = IndexMap::new();
    for (idx, raw) in pipeline.nodes.iter().enumerate() {
        match GraphNode::from_value(raw) {
            Some(node) => {
                graph.insert(node.id.clone(), node);
            }
            None => warn!(
                pipeline_id = %pipeline.id,
                index = idx,
                "skipping node without an id"
            ),
        }
    }
    graph
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateReach {
    pub reachable: bool,
    pub via_any_gate: bool,
}

/// Walk backward over inbound links from `from` looking for `target`.
///
/// `via_any_gate` is set when the target is reached only through wait-for-any
/// synchronizers; one ungated path means the target has certainly completed. Nodes
/// already on the current walk are treated as "not found via this branch", so cyclic
/// link graphs terminate.
pub fn path_uses_any_gate<'g>(
    graph: &'g ReferenceGraph,
    from: &'g GraphNode,
    target: &'g str,
) -> GateReach {
    let mut walk = Walk {
        graph,
        target,
        visiting: HashSet::new(),
        settled: HashMap::new(),
    };
    walk.visiting.insert(from.id.as_str());
    walk.predecessors(from).0
}

struct Walk<'g> {
    graph: &'g ReferenceGraph,
    target: &'g str,
    visiting: HashSet<&'g str>,
    settled: HashMap<&'g str, GateReach>,
}

impl<'g> Walk<'g> {
    /// Returns the reach over `node`'s predecessors and whether a cycle cut it short.
    /// The target counts as gated only when every branch reaching it passes a gate.
    fn predecessors(&mut self, node: &'g GraphNode) -> (GateReach, bool) {
        let graph = self.graph;
        let mut gated = false;
        let mut ungated = false;
        let mut cut = false;
        for prev_id in &node.inbound_links {
            if prev_id == self.target {
                ungated = true;
                continue;
            }
            let Some(prev) = graph.get(prev_id) else {
                continue;
            };
            let (sub, sub_cut) = self.expand(prev);
            cut |= sub_cut;
            if !sub.reachable {
                continue;
            }
            if prev.is_any_gate() || sub.via_any_gate {
                gated = true;
            } else {
                ungated = true;
            }
        }
        let reach = GateReach {
            reachable: gated || ungated,
            via_any_gate: gated && !ungated,
        };
        (reach, cut)
    }

    fn expand(&mut self, node: &'g GraphNode) -> (GateReach, bool) {
        if let Some(reach) = self.settled.get(node.id.as_str()) {
            return (*reach, false);
        }
        if !self.visiting.insert(node.id.as_str()) {
            return (GateReach::default(), true);
        }
        let (reach, cut) = self.predecessors(node);
        self.visiting.remove(node.id.as_str());
        // results truncated by a cycle depend on the walk that produced them
        if !cut {
            self.settled.insert(node.id.as_str(), reach);
        }
        (reach, cut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub code: &'static str,
    pub message: String,
    pub location: Option<String>,
}

pub const WAIT_FOR_ANY_INPUT: &str = "WAIT_FOR_ANY_INPUT";
pub const UNKNOWN_TASK_REF: &str = "UNKNOWN_TASK_REF";

/// Advisory diagnostics for one pipeline: every (node, referenced task) pair whose task is
/// reached only through a wait-for-any gate, plus references to tasks the pipeline lacks.
pub fn analyze_pipeline(pipeline: &PipelineGraph) -> Vec<Diagnostic> {
    let graph = build_reference_graph(pipeline);
    let mut diags = Vec::new();
    for node in graph.values() {
        for task_id in &node.referenced_task_ids {
            let Some(target) = graph.get(task_id) else {
                diags.push(Diagnostic {
                    code: UNKNOWN_TASK_REF,
                    message: format!(
                        "node \"{}\" references task '{}' which is not in the pipeline",
                        node.display_name, task_id
                    ),
                    location: Some(format!("pipelines.{}.nodes.{}", pipeline.id, node.id)),
                });
                continue;
            };
            let reach = path_uses_any_gate(&graph, node, task_id);
            if reach.reachable && reach.via_any_gate {
                let input = node.input_referencing(task_id).unwrap_or_default();
                diags.push(Diagnostic {
                    code: WAIT_FOR_ANY_INPUT,
                    message: format!(
                        "node \"{}\" input \"{}\" consumes output of task \"{}\" through a wait-for-any gate",
                        node.display_name, input, target.display_name
                    ),
                    location: Some(format!(
                        "pipelines.{}.nodes.{}.inputs.{}",
                        pipeline.id, node.id, input
                    )),
                });
            }
        }
    }
    diags
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineAnalysis {
    pub pipeline_id: String,
    pub node_count: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// Per-pipeline analysis of a flow document. Only `pipelines` is required.
pub fn analyze_document(doc: &Value, label: &str) -> Result<Vec<PipelineAnalysis>> {
    let pipelines = parse_pipelines(doc, label)?;
    Ok(pipelines
        .iter()
        .map(|pipeline| PipelineAnalysis {
            pipeline_id: pipeline.id.clone(),
            node_count: pipeline.nodes.len(),
            diagnostics: analyze_pipeline(pipeline),
        })
        .collect())
}

pub fn analyze_flow(doc: &Value, label: &str) -> Result<Vec<Diagnostic>> {
    Ok(analyze_document(doc, label)?
        .into_iter()
        .flat_map(|analysis| analysis.diagnostics)
        .collect())
}

/// Analyze a pipeline flow saved to disk. The file must hold a `pipelines` array.
pub fn analyze_saved_pipeline(path: &Path) -> Result<Vec<PipelineAnalysis>> {
    let label = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|source| RepairError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: Value = serde_json::from_str(&content).map_err(|e| {
        RepairError::data_quality(format!("file is not JSON: {e}"), ErrorLocation::in_document(&label))
    })?;
    if !doc.get("pipelines").is_some_and(Value::is_array) {
        return Err(RepairError::data_quality(
            "file does not contain any pipelines",
            ErrorLocation::in_document(&label),
        ));
    }
    analyze_document(&doc, &label)
}

/// `pipeline <id> : nodes <n>` per pipeline, then one `<CODE> <message>` line per diagnostic.
pub fn render_analyses(analyses: &[PipelineAnalysis]) -> String {
    let mut out = String::new();
    for analysis in analyses {
        let _ = writeln!(
            out,
            "pipeline {} : nodes {}",
            analysis.pipeline_id, analysis.node_count
        );
        for diag in &analysis.diagnostics {
            let _ = writeln!(out, "{} {}", diag.code, diag.message);
        }
    }
    out
}
