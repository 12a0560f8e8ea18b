use std::sync::Arc;

use flowfix::config::ReconcileOptions;
use flowfix::execute::{ActionOutcome, DisableMode, MIGRATED_RECORD_NAME, REASON_CREATE_FAILED};
use flowfix::graph::WAIT_FOR_ANY_INPUT;
use flowfix::memory::{MemoryCredentialStore, MemoryPlatform};
use flowfix::model::{CredentialRecord, CredentialScope, GIT_STORAGE_TYPE, PARAMETERS_TYPE, VOID_PROJECT_ID};
use flowfix::{Disposition, Reconciler, RunReport};
use serde_json::{Map, Value, json};

fn record(id: &str, asset: &str, project: Option<&str>, updated: &str) -> CredentialRecord {
    CredentialRecord {
        id: id.to_string(),
        secret_id: format!("1000331001:{id}"),
        scope: CredentialScope {
            asset_id: Some(asset.to_string()),
            project_id: project.map(str::to_string),
            ..Default::default()
        },
        credential_type: PARAMETERS_TYPE.to_string(),
        updated_at: Some(updated.to_string()),
        ..Default::default()
    }
}

fn flow(ppid: &str, default: &str) -> Value {
    json!({
        "doc_type": "pipeline",
        "primary_pipeline": ppid,
        "pipelines": [{
            "id": ppid,
            "nodes": [],
            "app_data": { "pipeline_data": { "inputs": [
                { "name": "db_password", "default": default }
            ]}}
        }]
    })
}

fn platform() -> MemoryPlatform {
    MemoryPlatform::new()
        .with_project("P1", "sales", "assetfiles")
        .with_project("P2", "finance", "assetfiles")
        .with_project("G1", "from-git", GIT_STORAGE_TYPE)
        .with_flow("P1", "pipe-1", "nightly", flow("enc", "{encval}one"))
        .with_flow("P2", "pipe-2", "nightly", flow("enc", "{encval}two"))
        .with_flow("P2", "pipe-3", "vaulted", flow("sec", "{secref}vault"))
        .with_flow("G1", "pipe-g", "nightly", flow("enc", "{encval}git"))
}

fn store() -> MemoryCredentialStore {
    MemoryCredentialStore::with_records(vec![
        record("enc-scoped", "enc", Some("P1"), "2024-01-01T00:00:00Z"),
        record("enc-old", "enc", None, "2024-02-01T00:00:00Z"),
        record("enc-new", "enc", None, "2024-03-01T00:00:00Z"),
        record("sec-unscoped", "sec", None, "2024-01-01T00:00:00Z"),
        record("done", "clean", Some("P1"), "2024-01-01T00:00:00Z"),
    ])
}

fn run(platform: MemoryPlatform, store: Arc<MemoryCredentialStore>, options: ReconcileOptions) -> RunReport {
    let platform = Arc::new(platform);
    Reconciler::new(platform, store.clone(), store.clone(), store, options)
        .run()
        .unwrap()
}

fn group<'a>(report: &'a RunReport, ppid: &str) -> &'a flowfix::reconcile::GroupReport {
    report
        .groups
        .iter()
        .find(|g| g.primary_pipeline_id == ppid)
        .unwrap()
}

#[test]
fn dry_run_plans_without_mutating() {
    let store = Arc::new(store());
    let report = run(platform(), store.clone(), ReconcileOptions::default());

    assert!(!report.fix);
    assert_eq!(report.projects, 2);
    assert_eq!(report.flows, 3);
    assert_eq!(report.credentials, 5);
    assert_eq!(report.groups.len(), 2);

    let enc = group(&report, "enc");
    assert_eq!(enc.disposition, Disposition::Planned);
    assert_eq!(enc.project_ids, vec!["P1", "P2"]);
    assert_eq!(enc.records, 3);
    assert_eq!(enc.master_record_id.as_deref(), Some("enc-new"));
    let actions: Vec<&str> = enc.plan.iter().map(|a| a.name()).collect();
    assert_eq!(actions, vec!["skip", "disable", "disable", "create"]);
    assert!(enc.results.is_empty());

    assert_eq!(group(&report, "sec").disposition, Disposition::Broken);
    assert_eq!(report.count(Disposition::Planned), 1);
    assert!(!report.has_failures());

    assert_eq!(store.records().len(), 5);
    assert!(store.patches().is_empty());
}

#[test]
fn fix_applies_plans() {
    let store = Arc::new(store());
    let options = ReconcileOptions {
        fix: true,
        workers: 2,
        ..Default::default()
    };
    let report = run(platform(), store.clone(), options);

    let enc = group(&report, "enc");
    assert_eq!(enc.disposition, Disposition::Fixed);
    assert_eq!(enc.results.len(), 4);
    assert_eq!(store.record("enc-old").unwrap().project_id(), Some(VOID_PROJECT_ID));
    assert_eq!(store.record("enc-new").unwrap().project_id(), Some(VOID_PROJECT_ID));

    let created: Vec<CredentialRecord> = store
        .records()
        .into_iter()
        .filter(|r| r.name.as_deref() == Some(MIGRATED_RECORD_NAME))
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].project_id(), Some("P2"));
    assert_eq!(store.patches()[0].1[0].value, json!({ "db_password": "{encval}two" }));

    let sec = group(&report, "sec");
    assert_eq!(sec.disposition, Disposition::Broken);
    assert!(sec.results.is_empty());
    assert!(store.record("sec-unscoped").unwrap().is_unscoped());
}

#[test]
fn second_fix_run_finds_nothing_left() {
    let store = Arc::new(store());
    let options = ReconcileOptions {
        fix: true,
        ..Default::default()
    };
    run(platform(), store.clone(), options.clone());
    let report = run(platform(), store.clone(), options);
    let ppids: Vec<&str> = report
        .groups
        .iter()
        .map(|g| g.primary_pipeline_id.as_str())
        .collect();
    assert_eq!(ppids, vec!["sec"]);
    assert!(!report.has_failures());
}

#[test]
fn failed_create_keeps_group_for_next_run() {
    let store = Arc::new(store());
    // mem-0001 is the helper record, mem-0002 the record created for P2
    store.fail_patches_for("mem-0002");
    let options = ReconcileOptions {
        fix: true,
        primary_pipeline_id: Some("enc".to_string()),
        ..Default::default()
    };
    let report = run(platform(), store.clone(), options.clone());

    let enc = group(&report, "enc");
    assert_eq!(enc.disposition, Disposition::Failed);
    let held = ActionOutcome::Ignored(REASON_CREATE_FAILED.to_string());
    let outcomes: Vec<&ActionOutcome> = enc.results.iter().map(|r| &r.outcome).collect();
    assert_eq!(outcomes[0], &ActionOutcome::Success);
    assert_eq!(outcomes[1], &held);
    assert_eq!(outcomes[2], &held);
    assert!(outcomes[3].is_failure());
    assert!(store.record("enc-old").unwrap().is_unscoped());
    assert!(store.record("enc-new").unwrap().is_unscoped());
    assert!(store.record("mem-0002").is_none());
    assert!(store.patches().is_empty());

    let report = run(platform(), store.clone(), options);
    let enc = group(&report, "enc");
    assert_eq!(enc.disposition, Disposition::Fixed);
    assert_eq!(store.record("enc-old").unwrap().project_id(), Some(VOID_PROJECT_ID));
    assert_eq!(store.record("enc-new").unwrap().project_id(), Some(VOID_PROJECT_ID));
    let patches = store.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].0, "mem-0003");
    assert_eq!(store.record("mem-0003").unwrap().project_id(), Some("P2"));
}

#[test]
fn ids_unfit_for_audit_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let platform = platform().with_flow("P1", "bad/id", "odd", flow("other", "{encval}x"));
    let store = MemoryCredentialStore::with_records(vec![
        record("enc-old", "enc", None, "2024-02-01T00:00:00Z"),
        record("weird", "x/y", None, "2024-01-01T00:00:00Z"),
    ]);
    let options = ReconcileOptions {
        dump_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let report = run(platform, Arc::new(store), options);

    assert!(
        report
            .issues
            .iter()
            .any(|i| i.pipeline_id.as_deref() == Some("bad/id"))
    );
    assert!(
        report
            .issues
            .iter()
            .any(|i| i.pipeline_id.as_deref() == Some("x/y"))
    );
    assert!(report.groups.iter().all(|g| g.primary_pipeline_id != "x/y"));
    assert_eq!(group(&report, "enc").disposition, Disposition::Planned);
    assert!(dir.path().join("creds/enc_secrets.json").exists());
    assert!(!dir.path().join("creds/x").exists());
}

#[test]
fn hard_delete_removes_superseded_records() {
    let store = Arc::new(store());
    let options = ReconcileOptions {
        fix: true,
        disable_mode: DisableMode::Delete,
        primary_pipeline_id: Some("enc".to_string()),
        ..Default::default()
    };
    let report = run(platform(), store.clone(), options);
    assert_eq!(report.groups.len(), 1);
    assert!(store.record("enc-old").is_none());
    assert!(store.record("enc-new").is_none());
    assert!(store.record("sec-unscoped").is_some());
}

#[test]
fn single_project_discovery() {
    let options = ReconcileOptions {
        project_id: Some("P1".to_string()),
        ..Default::default()
    };
    let report = run(platform(), Arc::new(store()), options);
    assert_eq!(report.projects, 1);
    assert_eq!(report.flows, 1);
    let enc = group(&report, "enc");
    assert_eq!(enc.project_ids, vec!["P1"]);
    let actions: Vec<&str> = enc.plan.iter().map(|a| a.name()).collect();
    assert_eq!(actions, vec!["skip", "disable", "disable"]);
    assert_eq!(group(&report, "sec").disposition, Disposition::Skipped);
}

#[test]
fn unreadable_and_malformed_flows_become_issues() {
    let platform = platform()
        .with_unreadable_pipeline("P1", "pipe-x", "broken")
        .with_flow("P1", "pipe-y", "no-primary", json!({ "pipelines": [] }));
    let report = run(platform, Arc::new(store()), ReconcileOptions::default());
    assert_eq!(report.flows, 3);
    assert_eq!(report.issues.len(), 2);
    assert_eq!(report.issues[0].pipeline_id.as_deref(), Some("pipe-x"));
    assert!(report.issues[0].message.contains("404"));
    assert!(report.issues[1].message.contains("primary_pipeline"));
}

#[test]
fn dumps_flows_credentials_and_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let options = ReconcileOptions {
        dump_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    run(platform(), Arc::new(store()), options);

    let flow_path = dir.path().join("projects/P2/pipelines/pipe-3.json");
    let dumped: Value = serde_json::from_str(&std::fs::read_to_string(&flow_path).unwrap()).unwrap();
    assert_eq!(dumped["primary_pipeline"], "sec");
    assert!(!dir.path().join("projects/G1").exists());

    let creds_path = dir.path().join("creds/enc_secrets.json");
    let creds: Vec<Value> =
        serde_json::from_str(&std::fs::read_to_string(&creds_path).unwrap()).unwrap();
    assert_eq!(creds.len(), 3);
    assert_eq!(creds[0]["_id"], "enc-scoped");

    let manifest: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("creds/manifest.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(manifest["algorithm"], "blake3");
    let expected = blake3::hash(&std::fs::read(&creds_path).unwrap()).to_hex().to_string();
    assert_eq!(manifest["files"]["creds/enc_secrets.json"], expected);
    assert!(manifest["files"]["projects/P1/pipelines/pipe-1.json"].is_string());
}

#[test]
fn master_secret_keys_are_reported_when_readable() {
    let mut secret = Map::new();
    secret.insert("db_password".to_string(), json!("hunter2"));
    let store = Arc::new(store().with_secret("1000331001:enc-new", secret));
    let report = run(platform(), store, ReconcileOptions::default());
    assert_eq!(
        group(&report, "enc").master_secret_keys,
        Some(vec!["db_password".to_string()])
    );
    assert_eq!(group(&report, "sec").master_secret_keys, None);
}

#[test]
fn wait_for_any_hazards_are_collected() {
    let text = std::fs::read_to_string("tests/data/wait_any_flow.json").unwrap();
    let saved: Value = serde_json::from_str(&text).unwrap();
    let platform = platform().with_flow("P1", "pipe-w", "gated", saved);
    let report = run(platform, Arc::new(store()), ReconcileOptions::default());
    assert_eq!(report.hazards.len(), 1);
    assert_eq!(report.hazards[0].code, WAIT_FOR_ANY_INPUT);
    assert_eq!(
        report.hazards[0].location.as_deref(),
        Some("P1/pipe-w:pipelines.main.nodes.notify.inputs.body")
    );
}

#[test]
fn worker_count_does_not_change_the_report() {
    let paged = || platform().with_page_size(1);
    let one = run(
        paged(),
        Arc::new(store()),
        ReconcileOptions {
            workers: 1,
            ..Default::default()
        },
    );
    let many = run(
        paged(),
        Arc::new(store()),
        ReconcileOptions {
            workers: 8,
            ..Default::default()
        },
    );
    assert_eq!(one, many);
}
