use skillpilot::bundle::BundleIndex;
use skillpilot::config::JobConfig;
use skillpilot::orchestrator::{JobOutcome, Orchestrator, OrchestratorError};
use skillpilot::protocol::timeline::read_events;
use skillpilot::protocol::{ErrorType, EventKind, JobStatus, Manifest};
use skillpilot::session::{InjectConfig, PseudoLauncher};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn test_config() -> JobConfig {
    JobConfig {
        launcher: "pseudo".to_string(),
        ready_timeout_s: 10,
        ack_timeout_s: 10,
        restore_timeout_s: 10,
        ack_poll_interval_ms: 20,
        health_poll_interval_ms: 50,
        session_grace_period_s: 1,
        ..JobConfig::default()
    }
}

fn write_design(dir: &Path, name: &str) {
    fs::create_dir_all(dir).expect("design dir");
    fs::write(dir.join(format!("{name}.enc")), "restoreDesign\n").expect("enc");
    fs::write(dir.join(format!("{name}.enc.dat")), "blob\n").expect("enc.dat");
}

fn write_health_skill(skill_root: &Path) {
    let dir = skill_root.join("summary_health_mock");
    fs::create_dir_all(&dir).expect("skill dir");
    fs::write(
        dir.join("contract.yaml"),
        r#"
schema_version: "1.0"
name: summary_health_mock
version: "1.0"
scripts:
  - name: main
    entry: run.tcl
outputs:
  required:
    - path: reports/summary_health.txt
    - path: reports/timing_health.txt
debug_hints:
  - Check the innovus stdout tail for report errors
"#,
    )
    .expect("contract");
    fs::write(dir.join("run.tcl"), "report_health\n").expect("entry");
}

fn orchestrator(cwd: &Path) -> Orchestrator {
    Orchestrator::with_launcher(
        cwd,
        cwd.join("skills"),
        test_config(),
        Box::new(PseudoLauncher::new(InjectConfig::default())),
    )
}

#[test]
fn multi_candidate_pauses_then_resumes_with_user_selection() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(&cwd.join("b1"), "a");
    write_design(&cwd.join("b2"), "a");
    write_health_skill(&cwd.join("skills"));
    let orchestrator = orchestrator(cwd);

    let outcome = orchestrator.run_job("a", "summary_health_mock").expect("run_job");
    let (job_id, candidates) = match outcome {
        JobOutcome::AwaitingSelection {
            job_id, candidates, ..
        } => (job_id, candidates),
        other => panic!("expected selection pause, got {other:?}"),
    };
    assert_eq!(candidates.len(), 2);
    assert!(candidates[0].path < candidates[1].path, "candidates sorted by path");
    assert!(candidates[0].path.contains("b1"));
    assert!(candidates[1].path.contains("b2"));

    // While paused: manifest holds the candidate list with no selection.
    let paused = Manifest::load(&cwd.join(".skillpilot/runs").join(&job_id)).expect("manifest");
    assert_eq!(paused.status, JobStatus::Running);
    let design = paused.design.expect("design");
    assert_eq!(design.candidates.len(), 2);
    assert!(design.selected.is_none());

    // Resume with the second candidate.
    let outcome = orchestrator.resume_job(&job_id, 1).expect("resume");
    let JobOutcome::Terminated(report) = outcome else {
        panic!("expected terminated job");
    };
    assert_eq!(report.status, JobStatus::Pass);

    let manifest = Manifest::load(&report.run_dir).expect("manifest");
    let design = manifest.design.expect("design");
    assert_eq!(design.selection_reason, "user_selected");
    assert!(design.selected.expect("selected").enc_path.contains("b2"));

    // Re-resuming the terminal job is idempotent.
    let again = orchestrator.resume_job(&job_id, 1).expect("resume again");
    let JobOutcome::Terminated(second) = again else {
        panic!("expected terminated job");
    };
    assert_eq!(second.status, report.status);
    assert_eq!(second.error_type, report.error_type);
    assert_eq!(second.run_dir, report.run_dir);
}

#[test]
fn selection_index_out_of_range_is_rejected() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(&cwd.join("b1"), "a");
    write_design(&cwd.join("b2"), "a");
    write_health_skill(&cwd.join("skills"));
    let orchestrator = orchestrator(cwd);

    let outcome = orchestrator.run_job("a", "summary_health_mock").expect("run_job");
    let JobOutcome::AwaitingSelection { job_id, .. } = outcome else {
        panic!("expected selection pause");
    };
    let err = orchestrator.resume_job(&job_id, 5).expect_err("bad index");
    assert!(matches!(err, OrchestratorError::InvalidSelection { count: 2, .. }));
}

#[test]
fn missing_companion_fails_before_any_session() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    fs::write(cwd.join("c.enc"), "restoreDesign\n").expect("enc without dat");
    write_health_skill(&cwd.join("skills"));

    let outcome = orchestrator(cwd)
        .run_job("c.enc", "summary_health_mock")
        .expect("run_job");
    let JobOutcome::Terminated(report) = outcome else {
        panic!("expected terminated job");
    };
    assert_eq!(report.status, JobStatus::Fail);
    assert_eq!(report.error_type, ErrorType::LocatorFail);

    // The session never started.
    assert!(!report.run_dir.join("session/state.json").exists());

    // Evidence trail: FAIL event, bundle with resolvable index, FAIL summary.
    let events = read_events(&report.run_dir.join("job_timeline.jsonl")).expect("events");
    let terminal: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.event, EventKind::Done | EventKind::Fail))
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].event, EventKind::Fail);

    let index: BundleIndex = skillpilot::protocol::load_record(
        &report.run_dir.join("debug_bundle/index.json"),
    )
    .expect("bundle index");
    assert_eq!(index.error_type, ErrorType::LocatorFail);
    for pointer in index.pointers.values() {
        assert!(
            report
                .run_dir
                .join("debug_bundle")
                .join(pointer.trim_end_matches('/'))
                .exists(),
            "dangling bundle pointer {pointer}"
        );
    }

    let md = fs::read_to_string(report.run_dir.join("summary.md")).expect("summary");
    assert!(md.contains("**Status**: FAIL"));
    assert!(md.contains("LOCATOR_FAIL"));
    assert!(md.contains("debug_bundle"));
}

#[test]
fn scan_ignores_designs_beyond_depth_limit() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(&cwd.join("near"), "a");
    write_design(&cwd.join("d1/d2/d3/d4"), "a");
    write_health_skill(&cwd.join("skills"));

    let mut config = test_config();
    config.scan_depth = 1;
    let orchestrator = Orchestrator::with_launcher(
        cwd,
        cwd.join("skills"),
        config,
        Box::new(PseudoLauncher::new(InjectConfig::default())),
    );

    // Only the shallow candidate is visible, so the job proceeds without
    // pausing for selection.
    let outcome = orchestrator.run_job("a", "summary_health_mock").expect("run_job");
    let JobOutcome::Terminated(report) = outcome else {
        panic!("expected terminated job, deep candidate should be invisible");
    };
    assert_eq!(report.status, JobStatus::Pass);
    let manifest = Manifest::load(&report.run_dir).expect("manifest");
    assert!(manifest
        .design
        .expect("design")
        .selected
        .expect("selected")
        .enc_path
        .contains("near"));
}
