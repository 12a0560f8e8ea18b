use flowfix::inventory::AffectedGroup;
use flowfix::model::{CredentialRecord, CredentialScope, PARAMETERS_TYPE, VOID_PROJECT_ID};
use flowfix::plan::{
    REASON_ALREADY_DISABLED, REASON_NOTHING_TO_FIX, REASON_SECRET_REFS, REASON_SUPERSEDED,
    RepairAction,
};
use flowfix::plan_repairs;

fn record(id: &str, project: Option<&str>) -> CredentialRecord {
    CredentialRecord {
        id: id.to_string(),
        scope: CredentialScope {
            asset_id: Some("pp".to_string()),
            project_id: project.map(str::to_string),
            ..Default::default()
        },
        credential_type: PARAMETERS_TYPE.to_string(),
        ..Default::default()
    }
}

fn group(secret_ref: bool, encrypted: bool, projects: &[&str]) -> AffectedGroup {
    let mut group = AffectedGroup::unaffected("pp");
    for project in projects {
        group.observe(project, secret_ref, encrypted);
    }
    group
}

fn shape(plan: &[RepairAction]) -> Vec<String> {
    plan.iter()
        .map(|action| match action {
            RepairAction::Skip { record, .. } => format!("skip {}", record.id),
            RepairAction::Disable { record, .. } => format!("disable {}", record.id),
            RepairAction::Create { project_id, .. } => format!("create {project_id}"),
            RepairAction::Break { reason } => format!("break {reason}"),
        })
        .collect()
}

#[test]
fn scoped_record_satisfies_its_project() {
    let plan = plan_repairs(
        &group(false, true, &["P1", "P2"]),
        &[record("r1", Some("P1")), record("r2", None)],
    );
    assert_eq!(shape(&plan), vec!["skip r1", "disable r2", "create P2"]);
    match &plan[2] {
        RepairAction::Create {
            primary_pipeline_id,
            project_id,
            ..
        } => {
            assert_eq!(primary_pipeline_id, "pp");
            assert_eq!(project_id, "P2");
        }
        other => panic!("unexpected action {other:?}"),
    }
    assert_eq!(plan[1].reason(), REASON_SUPERSEDED);
    assert_eq!(plan[0].reason(), "already scoped to P1");
}

#[test]
fn secret_refs_break_the_group_regardless_of_records() {
    let records: Vec<CredentialRecord> = (0..10).map(|n| record(&format!("r{n}"), None)).collect();
    let plan = plan_repairs(&group(true, true, &["P1"]), &records);
    assert_eq!(shape(&plan), vec![format!("break {REASON_SECRET_REFS}")]);
}

#[test]
fn unaffected_group_has_nothing_to_fix() {
    let plan = plan_repairs(&AffectedGroup::unaffected("pp"), &[record("r1", None)]);
    assert_eq!(shape(&plan), vec![format!("break {REASON_NOTHING_TO_FIX}")]);
}

#[test]
fn every_record_gets_exactly_one_action() {
    let records = vec![
        record("a", None),
        record("b", Some("P3")),
        record("c", None),
        record("d", Some("P1")),
    ];
    let plan = plan_repairs(&group(false, true, &["P1", "P2"]), &records);
    let disables = plan.iter().filter(|a| matches!(a, RepairAction::Disable { .. })).count();
    let skips = plan.iter().filter(|a| matches!(a, RepairAction::Skip { .. })).count();
    assert_eq!(disables, 2);
    assert_eq!(skips, 2);
    assert_eq!(
        shape(&plan),
        vec!["disable a", "skip b", "disable c", "skip d", "create P2"]
    );
}

#[test]
fn at_most_one_create_per_project() {
    let plan = plan_repairs(
        &group(false, true, &["P1", "P2", "P3"]),
        &[record("r", None), record("s", Some("P2"))],
    );
    assert_eq!(
        shape(&plan),
        vec!["disable r", "skip s", "create P1", "create P3"]
    );
}

#[test]
fn voided_records_are_skipped_and_do_not_satisfy() {
    let plan = plan_repairs(
        &group(false, true, &["P1"]),
        &[record("v", Some(VOID_PROJECT_ID)), record("u", None)],
    );
    assert_eq!(shape(&plan), vec!["skip v", "disable u", "create P1"]);
    assert_eq!(plan[0].reason(), REASON_ALREADY_DISABLED);
}

#[test]
fn planning_is_deterministic() {
    let g = group(false, true, &["P2", "P1"]);
    let records = vec![record("r1", None), record("r2", Some("P2"))];
    assert_eq!(plan_repairs(&g, &records), plan_repairs(&g, &records));
    assert_eq!(shape(&plan_repairs(&g, &records)), vec!["disable r1", "skip r2", "create P1"]);
}

#[test]
fn subjects_name_records_and_targets() {
    let plan = plan_repairs(&group(false, true, &["P9"]), &[record("r1", None)]);
    assert_eq!(plan[0].subject(), "r1");
    assert_eq!(plan[1].subject(), "pp@P9");
    assert_eq!(plan[1].name(), "create");
    let json = serde_json::to_value(&plan[1]).unwrap();
    assert_eq!(json["action"], "create");
}
