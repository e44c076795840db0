//! End-to-end tests of the decision loop over file partitions.

mod common;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use cluster_warden::core::config::Config;
use cluster_warden::daemon::loop_main::RemediationDaemon;
use cluster_warden::daemon::signals::SignalHandler;
use cluster_warden::logger::audit::AuditView;
use cluster_warden::logger::jsonl::{EventType, LogEntry};
use cluster_warden::store::offsets::SqliteOffsetStore;

use common::{Harness, HarnessOptions, payload};

fn config_for(dir: &Path, partition: &Path) -> Config {
    let mut config = Config::default();
    config.engine.safe_mode = true;
    config.notifications.enabled = false;
    config.ingest.partitions = vec![partition.to_path_buf()];
    config.ingest.follow = false;
    config.paths.config_file = dir.join("config.toml");
    config.paths.state_db = dir.join("state.sqlite3");
    config.paths.activity_log = dir.join("activity.jsonl");
    config
}

fn write_lines(path: &Path, lines: &[String]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

fn activity_events(path: &Path) -> Vec<EventType> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
        .map(|entry| entry.event)
        .collect()
}

#[test]
fn processes_a_partition_and_commits_its_offset() {
    let dir = tempfile::tempdir().unwrap();
    let partition = dir.path().join("observations.jsonl");
    write_lines(
        &partition,
        &[
            payload("Pod", "api-0", "payments", &[("PRIVILEGED", "app")]),
            "{not json".to_string(),
            payload("Deployment", "web", "shop", &[("SINGLE_REPLICA", "web")]),
        ],
    );
    let config = config_for(dir.path(), &partition);

    let stats = RemediationDaemon::init(config.clone()).unwrap().run().unwrap();
    assert_eq!(stats.observations, 3);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.failed, 0);

    let offsets = SqliteOffsetStore::open(&config.paths.state_db).unwrap();
    assert_eq!(
        offsets
            .committed(&partition.display().to_string())
            .unwrap(),
        3
    );

    let events = activity_events(&config.paths.activity_log);
    assert_eq!(events.first(), Some(&EventType::DaemonStart));
    assert_eq!(events.last(), Some(&EventType::DaemonStop));
    assert!(events.contains(&EventType::ObservationRejected));
    assert_eq!(
        events
            .iter()
            .filter(|event| **event == EventType::Decision)
            .count(),
        2
    );
}

#[test]
fn restart_resumes_after_the_committed_offset() {
    let dir = tempfile::tempdir().unwrap();
    let partition = dir.path().join("observations.jsonl");
    write_lines(
        &partition,
        &[payload("Pod", "api-0", "payments", &[("PRIVILEGED", "app")])],
    );
    let config = config_for(dir.path(), &partition);

    let first = RemediationDaemon::init(config.clone()).unwrap().run().unwrap();
    assert_eq!(first.processed, 1);

    let second = RemediationDaemon::init(config.clone()).unwrap().run().unwrap();
    assert_eq!(second.observations, 0);

    write_lines(
        &partition,
        &[payload("CronJob", "nightly", "batch", &[("NO_OWNER", "")])],
    );
    let third = RemediationDaemon::init(config).unwrap().run().unwrap();
    assert_eq!(third.observations, 1);
    assert_eq!(third.processed, 1);
}

#[test]
fn loop_drives_the_escalation_ladder() {
    let dir = tempfile::tempdir().unwrap();
    let partition = dir.path().join("observations.jsonl");
    let line = payload("Pod", "api-0", "payments", &[("PRIVILEGED", "app")]);
    write_lines(&partition, &[line.clone(), line.clone(), line]);

    let mut config = config_for(dir.path(), &partition);
    config.engine.safe_mode = false;
    let Harness {
        engine,
        notifier,
        executor,
        ..
    } = Harness::new(HarnessOptions::default());

    let mut daemon = RemediationDaemon::from_parts(
        config,
        engine,
        SqliteOffsetStore::open_in_memory().unwrap(),
        SignalHandler::detached(),
    );
    let stats = daemon.run().unwrap();
    assert_eq!(stats.processed, 3);

    // Wall-clock timestamps fall inside one renotify interval: one warning only.
    let sent = notifier.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].warning_count, 1);
    assert!(executor.acted.lock().is_empty());
}

#[test]
fn missing_partition_fails_before_reading() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(dir.path(), &dir.path().join("absent.jsonl"));

    let error = RemediationDaemon::init(config).unwrap().run().unwrap_err();
    assert_eq!(error.code(), "CW-3002");
}

#[test]
fn retried_observation_does_not_repeat_completed_violations() {
    let dir = tempfile::tempdir().unwrap();
    let partition = dir.path().join("observations.jsonl");
    write_lines(
        &partition,
        &[payload(
            "Ingress",
            "edge",
            "shop",
            &[("INGRESS_HOST_INVALID", "a"), ("INGRESS_HOST_INVALID", "b")],
        )],
    );

    let config = config_for(dir.path(), &partition);
    let h = Harness::new(HarnessOptions {
        fail_write: Some(2),
        ..HarnessOptions::default()
    });
    let Harness {
        engine,
        notifier,
        executor,
        audit,
        ..
    } = h;

    let mut daemon = RemediationDaemon::from_parts(
        config,
        engine,
        SqliteOffsetStore::open_in_memory().unwrap(),
        SignalHandler::detached(),
    );
    let stats = daemon.run().unwrap();
    assert_eq!(stats.observations, 1);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.processed, 1);

    assert_eq!(executor.acted.lock().len(), 2);
    assert_eq!(notifier.sent.lock().len(), 2);
    assert_eq!(
        audit
            .lock()
            .action_count(AuditView::ByOutcome, Some("entity_action"))
            .unwrap(),
        2
    );
}
