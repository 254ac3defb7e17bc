use skillpilot::bundle::BundleIndex;
use skillpilot::config::JobConfig;
use skillpilot::orchestrator::{JobOutcome, JobReport, Orchestrator};
use skillpilot::protocol::timeline::read_events;
use skillpilot::protocol::{ErrorType, EventKind, JobStatus};
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

fn write_health_skill(skill_root: &Path, required: &[&str]) {
    let dir = skill_root.join("summary_health_mock");
    fs::create_dir_all(&dir).expect("skill dir");
    let mut contract = String::from(
        "schema_version: \"1.0\"\nname: summary_health_mock\nversion: \"1.0\"\nscripts:\n  - name: main\n    entry: run.tcl\noutputs:\n  required:\n",
    );
    for path in required {
        contract.push_str(&format!("    - path: {path}\n"));
    }
    contract.push_str("debug_hints:\n  - Check the innovus stdout tail\n");
    fs::write(dir.join("contract.yaml"), contract).expect("contract");
    fs::write(dir.join("run.tcl"), "report_health\n").expect("entry");
}

fn run_to_report(cwd: &Path, inject: InjectConfig, config: JobConfig) -> JobReport {
    let orchestrator = Orchestrator::with_launcher(
        cwd,
        cwd.join("skills"),
        config,
        Box::new(PseudoLauncher::new(inject)),
    );
    match orchestrator
        .run_job("a", "summary_health_mock")
        .expect("run_job")
    {
        JobOutcome::Terminated(report) => report,
        other => panic!("expected terminated job, got {other:?}"),
    }
}

fn bundle_index(report: &JobReport) -> BundleIndex {
    skillpilot::protocol::load_record(&report.run_dir.join("debug_bundle/index.json"))
        .expect("bundle index")
}

#[test]
fn restore_failure_classifies_and_bundles_the_failing_ack() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(cwd, "a");
    write_health_skill(
        &cwd.join("skills"),
        &["reports/summary_health.txt", "reports/timing_health.txt"],
    );

    let report = run_to_report(
        cwd,
        InjectConfig {
            restore_fail: true,
            ..InjectConfig::default()
        },
        test_config(),
    );
    assert_eq!(report.status, JobStatus::Fail);
    assert_eq!(report.error_type, ErrorType::RestoreFail);

    let index = bundle_index(&report);
    assert_eq!(index.error_type, ErrorType::RestoreFail);
    let ack_pointer = index.pointers.get("last_fail_ack").expect("failing ack in bundle");
    assert!(report.run_dir.join("debug_bundle").join(ack_pointer).exists());
    let session_pointer = index.pointers.get("session_logs").expect("session tails");
    assert!(report
        .run_dir
        .join("debug_bundle")
        .join(session_pointer.trim_end_matches('/'))
        .join("innovus.stdout.log.tail")
        .exists());
}

#[test]
fn skill_without_reports_classifies_output_missing() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(cwd, "a");
    write_health_skill(
        &cwd.join("skills"),
        &["reports/summary_health.txt", "reports/timing_health.txt"],
    );

    let report = run_to_report(
        cwd,
        InjectConfig {
            suppress_reports: true,
            ..InjectConfig::default()
        },
        test_config(),
    );
    assert_eq!(report.status, JobStatus::Fail);
    assert_eq!(report.error_type, ErrorType::OutputMissing);

    let index = bundle_index(&report);
    let inventory_pointer = index
        .pointers
        .get("reports_inventory")
        .expect("inventory in bundle");
    let inventory: Vec<serde_json::Value> = serde_json::from_str(
        &fs::read_to_string(report.run_dir.join("debug_bundle").join(inventory_pointer))
            .expect("read inventory"),
    )
    .expect("parse inventory");
    assert!(inventory.is_empty(), "no reports were produced");

    let checks_pointer = index
        .pointers
        .get("validation_results")
        .expect("validation results in bundle");
    let checks: Vec<serde_json::Value> = serde_json::from_str(
        &fs::read_to_string(report.run_dir.join("debug_bundle").join(checks_pointer))
            .expect("read checks"),
    )
    .expect("parse checks");
    assert_eq!(checks.len(), 2);
    assert!(checks.iter().all(|c| c["status"] == "MISSING"));
}

#[test]
fn hung_session_is_classified_heartbeat_lost_not_timeout() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(cwd, "a");
    write_health_skill(
        &cwd.join("skills"),
        &["reports/summary_health.txt", "reports/timing_health.txt"],
    );

    // The session hangs after acknowledging the restore; the heartbeat goes
    // stale long before the 30s ack timeout, so the watcher interrupts the
    // waiter.
    let mut config = test_config();
    config.heartbeat_timeout_s = 1;
    config.ack_timeout_s = 30;
    let report = run_to_report(
        cwd,
        InjectConfig {
            hang_after_acks: Some(1),
            ..InjectConfig::default()
        },
        config,
    );
    assert_eq!(report.status, JobStatus::Fail);
    assert_eq!(report.error_type, ErrorType::HeartbeatLost);

    // The failure happened while RUN_SKILL was in flight.
    let events = read_events(&report.run_dir.join("job_timeline.jsonl")).expect("events");
    assert!(events
        .iter()
        .any(|e| e.event == EventKind::StateEnter && e.state.as_deref() == Some("RUN_SKILL")));
    assert!(!events
        .iter()
        .any(|e| e.event == EventKind::StateExit && e.state.as_deref() == Some("RUN_SKILL")));
}

#[test]
fn session_that_never_heartbeats_fails_session_start() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(cwd, "a");
    write_health_skill(
        &cwd.join("skills"),
        &["reports/summary_health.txt", "reports/timing_health.txt"],
    );

    let mut config = test_config();
    config.ready_timeout_s = 1;
    let report = run_to_report(
        cwd,
        InjectConfig {
            never_ready: true,
            ..InjectConfig::default()
        },
        config,
    );
    assert_eq!(report.error_type, ErrorType::SessionStartFail);
    assert!(bundle_index(&report)
        .pointers
        .contains_key("session_logs"));
}

#[test]
fn crash_during_skill_is_classified_innovus_crash() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(cwd, "a");
    write_health_skill(
        &cwd.join("skills"),
        &["reports/summary_health.txt", "reports/timing_health.txt"],
    );

    // Restore is acknowledged, then the tool dies with a non-zero exit while
    // the skill request waits.
    let mut config = test_config();
    config.ack_timeout_s = 30;
    let report = run_to_report(
        cwd,
        InjectConfig {
            crash_after_acks: Some(1),
            suppress_reports: true,
            ..InjectConfig::default()
        },
        config,
    );
    assert_eq!(report.status, JobStatus::Fail);
    assert_eq!(report.error_type, ErrorType::InnovusCrash);
}

#[test]
fn contract_without_required_outputs_is_invalid_before_locating() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(cwd, "a");
    write_health_skill(&cwd.join("skills"), &[]);

    let report = run_to_report(cwd, InjectConfig::default(), test_config());
    assert_eq!(report.error_type, ErrorType::ContractInvalid);

    // No locate action was ever recorded.
    let events = read_events(&report.run_dir.join("job_timeline.jsonl")).expect("events");
    assert!(!events.iter().any(|e| {
        e.data
            .as_ref()
            .and_then(|d| d.get("action"))
            .and_then(|v| v.as_str())
            == Some("locate_db")
    }));
}

#[test]
fn injected_command_failure_classifies_cmd_fail() {
    let tmp = tempdir().expect("tempdir");
    let cwd = tmp.path();
    write_design(cwd, "a");
    write_health_skill(
        &cwd.join("skills"),
        &["reports/summary_health.txt", "reports/timing_health.txt"],
    );

    let report = run_to_report(
        cwd,
        InjectConfig {
            fail_on_script: Some("run_summary_health_mock".to_string()),
            ..InjectConfig::default()
        },
        test_config(),
    );
    assert_eq!(report.error_type, ErrorType::CmdFail);
    let index = bundle_index(&report);
    assert!(index.pointers.contains_key("last_fail_ack"));
}
