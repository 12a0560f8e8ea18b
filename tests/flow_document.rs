use flowfix::error::RepairError;
use flowfix::flow::{FlowDocument, Marker, contains_marker, extract_secret_placeholders};
use serde_json::json;

#[test]
fn parses_saved_pipeline_fixture() {
    let text = std::fs::read_to_string("tests/data/wait_any_flow.json").unwrap();
    let flow = FlowDocument::from_json_str(&text, "fixture").unwrap();
    assert_eq!(flow.primary_pipeline_id, "main");
    assert_eq!(flow.pipelines.len(), 1);
    assert_eq!(flow.pipelines[0].nodes.len(), 5);
    assert_eq!(flow.primary_pipeline().unwrap().declared_inputs().len(), 1);
    assert_eq!(flow.label(), "fixture");
}

#[test]
fn missing_primary_pipeline_is_data_quality() {
    let err = FlowDocument::from_value(json!({ "pipelines": [] }), "proj/pipe").unwrap_err();
    match err {
        RepairError::DataQuality { location, .. } => {
            assert_eq!(location.describe().as_deref(), Some("proj/pipe/primary_pipeline"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn missing_pipelines_is_data_quality() {
    let text = std::fs::read_to_string("tests/data/no_pipelines.json").unwrap();
    let err = FlowDocument::from_json_str(&text, "saved").unwrap_err();
    assert!(matches!(err, RepairError::DataQuality { .. }));
    assert!(err.to_string().contains("no pipelines"));
}

#[test]
fn invalid_json_is_data_quality() {
    let err = FlowDocument::from_json_str("{not json", "broken").unwrap_err();
    assert!(matches!(err, RepairError::DataQuality { .. }));
    assert!(!err.is_fatal());
}

#[test]
fn markers_are_found_anywhere_in_the_document() {
    let doc = json!({
        "primary_pipeline": "p",
        "pipelines": [{
            "id": "p",
            "nodes": [{ "id": "n", "app_data": { "pipeline_data": { "inputs": [
                { "name": "token", "value": "{secref}vault-ref" }
            ]}}}]
        }]
    });
    assert!(contains_marker(&doc, Marker::SecretRef));
    assert!(!contains_marker(&doc, Marker::EncryptedValue));

    let flow = FlowDocument::from_value(doc, "x").unwrap();
    assert!(flow.contains_marker(Marker::SecretRef));
}

#[test]
fn placeholders_keep_marked_string_defaults_only() {
    let doc = json!({
        "primary_pipeline": "p",
        "pipelines": [{
            "id": "p",
            "app_data": { "pipeline_data": { "inputs": [
                { "name": "db_password", "default": "{encval}a1b2" },
                { "name": "region", "default": "eu-de" },
                { "name": "retries", "default": 3 },
                { "name": "api_key", "default": "prefix {encval}zz" },
                { "default": "{encval}nameless" }
            ]}}
        }]
    });
    let payload = extract_secret_placeholders(&doc);
    let entries: Vec<(&str, &str)> = payload
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    assert_eq!(
        entries,
        vec![("db_password", "{encval}a1b2"), ("api_key", "prefix {encval}zz")]
    );
}

#[test]
fn placeholders_empty_when_structure_is_missing() {
    assert!(extract_secret_placeholders(&json!({})).is_empty());
    assert!(extract_secret_placeholders(&json!({ "pipelines": [] })).is_empty());
    assert!(extract_secret_placeholders(&json!({ "pipelines": [{ "id": "p" }] })).is_empty());
    assert!(
        extract_secret_placeholders(&json!({
            "pipelines": [{ "id": "p", "app_data": { "pipeline_data": {} } }]
        }))
        .is_empty()
    );
}

#[test]
fn placeholders_read_the_primary_pipeline() {
    let doc = json!({
        "primary_pipeline": "main",
        "pipelines": [
            { "id": "sub", "app_data": { "pipeline_data": { "inputs": [
                { "name": "sub_secret", "default": "{encval}sub" }
            ]}}},
            { "id": "main", "app_data": { "pipeline_data": { "inputs": [
                { "name": "main_secret", "default": "{encval}main" }
            ]}}}
        ]
    });
    let payload = extract_secret_placeholders(&doc);
    assert_eq!(payload.len(), 1);
    assert_eq!(payload["main_secret"], "{encval}main");
}

#[test]
fn placeholders_fall_back_to_first_pipeline() {
    let doc = json!({
        "primary_pipeline": "elsewhere",
        "pipelines": [
            { "id": "only", "app_data": { "pipeline_data": { "inputs": [
                { "name": "secret", "default": "{encval}x" }
            ]}}}
        ]
    });
    let payload = extract_secret_placeholders(&doc);
    assert_eq!(payload["secret"], "{encval}x");
}
