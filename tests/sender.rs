use flowfix::error::RepairError;
use flowfix::memory::MemoryPlatform;
use flowfix::sender::{SenderStatus, resolve_sender_expression, rewrite_sender, update_sender};
use serde_json::{Value, json};

fn saved_flow() -> Value {
    let text = std::fs::read_to_string("tests/data/wait_any_flow.json").unwrap();
    serde_json::from_str(&text).unwrap()
}

fn flow_without_email() -> Value {
    json!({
        "primary_pipeline": "main",
        "app_data": { "pipeline_data": { "variables": [{ "name": "ops_mailbox" }] } },
        "pipelines": [{ "id": "main", "nodes": [] }]
    })
}

#[test]
fn resolves_parameter_set_variable_and_input() {
    let flow = saved_flow();
    assert_eq!(
        resolve_sender_expression("notify.from", &flow).unwrap(),
        "param_sets.notify[\"from\"]"
    );
    assert_eq!(
        resolve_sender_expression("ops_mailbox", &flow).unwrap(),
        "vars.ops_mailbox"
    );
    assert_eq!(
        resolve_sender_expression("sender", &flow).unwrap(),
        "params[\"sender\"]"
    );
}

#[test]
fn unknown_sender_is_data_quality() {
    let err = resolve_sender_expression("nobody", &saved_flow()).unwrap_err();
    assert!(matches!(err, RepairError::DataQuality { .. }));
    assert!(err.to_string().contains("nobody not found in pipeline flow"));

    let err = resolve_sender_expression("other.from", &saved_flow()).unwrap_err();
    assert!(err.to_string().contains("other.from not found"));
}

#[test]
fn rewrite_replaces_literal_sender() {
    let mut flow = saved_flow();
    assert!(rewrite_sender(&mut flow, "vars.ops_mailbox"));
    let inputs = flow
        .pointer("/pipelines/0/nodes/3/app_data/pipeline_data/inputs")
        .unwrap();
    let sender = inputs
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["name"] == "sender_addr")
        .unwrap();
    assert_eq!(
        sender,
        &json!({ "name": "sender_addr", "value_from": { "expression": "vars.ops_mailbox" } })
    );
}

#[test]
fn rewrite_reports_missing_send_email_node() {
    let mut flow = flow_without_email();
    let before = flow.clone();
    assert!(!rewrite_sender(&mut flow, "vars.ops_mailbox"));
    assert_eq!(flow, before);
}

#[test]
fn project_update_uploads_only_changed_pipelines() {
    let platform = MemoryPlatform::new()
        .with_project("P1", "marketing", "assetfiles")
        .with_flow("P1", "pipe-1", "with-email", saved_flow())
        .with_flow("P1", "pipe-2", "no-email", flow_without_email())
        .with_flow("P1", "pipe-3", "bare", json!({ "pipelines": [] }))
        .with_page_size(2);

    let report = update_sender(&platform, "marketing", None, "ops_mailbox").unwrap();
    assert_eq!(report.project_id, "P1");
    assert_eq!(report.pipelines.len(), 3);
    assert_eq!(report.pipelines[0].status, SenderStatus::Updated);
    assert_eq!(report.pipelines[1].status, SenderStatus::NoSendEmailNode);
    assert!(matches!(report.pipelines[2].status, SenderStatus::Failed(_)));
    assert_eq!(report.updated(), 1);
    assert_eq!(report.failed(), 1);

    let uploads = platform.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].pipeline_id, "pipe-1");
    assert_eq!(uploads[0].name, "with-email");
    assert_eq!(
        uploads[0].flow["pipelines"][0]["nodes"][3]["app_data"]["pipeline_data"]["inputs"][1]["value_from"]
            ["expression"],
        "vars.ops_mailbox"
    );
}

#[test]
fn pipeline_update_filters_by_name() {
    let platform = MemoryPlatform::new()
        .with_project("P1", "marketing", "assetfiles")
        .with_flow("P1", "pipe-1", "with-email", saved_flow())
        .with_flow("P1", "pipe-2", "also-email", saved_flow());

    let report = update_sender(&platform, "marketing", Some("also-email"), "sender").unwrap();
    assert_eq!(report.pipelines.len(), 1);
    assert_eq!(report.pipelines[0].pipeline_id, "pipe-2");
    assert_eq!(platform.uploads()[0].pipeline_id, "pipe-2");
}

#[test]
fn unknown_project_is_a_configuration_error() {
    let platform = MemoryPlatform::new();
    let err = update_sender(&platform, "missing", None, "sender").unwrap_err();
    assert!(err.is_fatal());
}
