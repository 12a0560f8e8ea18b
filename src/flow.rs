//! Pipeline flow documents: the JSON form of a pipeline graph as served by the
//! pipeline template API.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ErrorLocation, RepairError, Result};

const PRIMARY_PIPELINE_KEY: &str = "primary_pipeline";
const PIPELINES_KEY: &str = "pipelines";

/// Literal tokens embedded in stored defaults that point at unresolved protected values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Marker {
    /// Reference to a vault secret.
    SecretRef,
    /// Value encrypted with a key the new installation no longer holds.
    EncryptedValue,
}

impl Marker {
    pub fn token(self) -> &'static str {
        match self {
            Marker::SecretRef => "{secref}",
            Marker::EncryptedValue => "{encval}",
        }
    }
}

/// One pipeline inside a flow document. Nodes are kept as raw JSON; the graph module
/// derives typed nodes from them.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    pub id: String,
    pub nodes: Vec<Value>,
    raw: Value,
}

impl PipelineGraph {
    pub fn from_value(value: &Value, location: ErrorLocation) -> Result<Self> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RepairError::data_quality("pipeline without an id", location.clone()))?
            .to_string();
        let nodes = value
            .get("nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(PipelineGraph {
            id,
            nodes,
            raw: value.clone(),
        })
    }

    /// Inputs declared on the pipeline (`app_data.pipeline_data.inputs`).
    pub fn declared_inputs(&self) -> &[Value] {
        self.raw
            .pointer("/app_data/pipeline_data/inputs")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

/// A fetched pipeline flow. Read-only once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDocument {
    pub primary_pipeline_id: String,
    pub pipelines: Vec<PipelineGraph>,
    raw: Value,
    label: String,
}

impl FlowDocument {
    /// Parse a flow. A missing `primary_pipeline` or `pipelines` field is a data-quality
    /// failure; everything below those is optional.
    pub fn from_value(value: Value, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let primary_pipeline_id = value
            .get(PRIMARY_PIPELINE_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RepairError::data_quality(
                    "flow document has no primary_pipeline",
                    ErrorLocation::in_document(label.clone())
                        .with_json_pointer(format!("/{PRIMARY_PIPELINE_KEY}")),
                )
            })?
            .to_string();
        let pipelines = parse_pipelines(&value, &label)?;
        Ok(FlowDocument {
            primary_pipeline_id,
            pipelines,
            raw: value,
            label,
        })
    }

    pub fn from_json_str(text: &str, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let value: Value = serde_json::from_str(text).map_err(|e| {
            RepairError::data_quality(
                format!("flow is not valid JSON: {e}"),
                ErrorLocation::in_document(label.clone()),
            )
        })?;
        Self::from_value(value, label)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The pipeline whose id equals `primary_pipeline_id`, if the document holds it.
    pub fn primary_pipeline(&self) -> Option<&PipelineGraph> {
        self.pipelines
            .iter()
            .find(|p| p.id == self.primary_pipeline_id)
    }

    pub fn contains_marker(&self, marker: Marker) -> bool {
        contains_marker(&self.raw, marker)
    }

    pub fn secret_placeholders(&self) -> IndexMap<String, String> {
        extract_secret_placeholders(&self.raw)
    }
}

/// Parse only the `pipelines` array of a flow document.
pub fn parse_pipelines(value: &Value, label: &str) -> Result<Vec<PipelineGraph>> {
    let entries = value
        .get(PIPELINES_KEY)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            RepairError::data_quality(
                "flow document has no pipelines",
                ErrorLocation::in_document(label).with_json_pointer(format!("/{PIPELINES_KEY}")),
            )
        })?;
    entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| {
            PipelineGraph::from_value(
                entry,
                ErrorLocation::in_document(label).with_json_pointer(format!("/pipelines/{idx}")),
            )
        })
        .collect()
}

/// Substring search over the serialized document.
pub fn contains_marker(doc: &Value, marker: Marker) -> bool {
    match serde_json::to_string(doc) {
        Ok(text) => text.contains(marker.token()),
        Err(_) => false,
    }
}

/// Inputs of the primary pipeline whose string default carries the encrypted-value marker,
/// mapped to that default.
///
/// The primary pipeline is looked up by id, falling back to the first pipeline when the
/// document does not name one it contains. Any missing substructure yields an empty map.
pub fn extract_secret_placeholders(doc: &Value) -> IndexMap<String, String> {
    let mut payload = IndexMap::new();
    let Some(pipelines) = doc.get(PIPELINES_KEY).and_then(Value::as_array) else {
        return payload;
    };
    let primary_id = doc.get(PRIMARY_PIPELINE_KEY).and_then(Value::as_str);
    let primary = primary_id
        .and_then(|id| {
            pipelines
                .iter()
                .find(|p| p.get("id").and_then(Value::as_str) == Some(id))
        })
        .or_else(|| pipelines.first());
    let Some(inputs) = primary
        .and_then(|p| p.pointer("/app_data/pipeline_data/inputs"))
        .and_then(Value::as_array)
    else {
        return payload;
    };

    let token = Marker::EncryptedValue.token();
    for input in inputs {
        let Some(name) = input.get("name").and_then(Value::as_str) else {
            continue;
        };
        if let Some(default) = input.get("default").and_then(Value::as_str)
            && default.contains(token)
        {
            payload.insert(name.to_string(), default.to_string());
        }
    }
    payload
}
