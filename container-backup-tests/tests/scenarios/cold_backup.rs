//! Home Assistant: a SQLite database that must be stopped for a copy

use container_backup::managers::discovery::HOT_LABEL;
use test_utils::{fixtures, BackupMethod, ServiceOutcome, TestContext};

const IMAGE: &str = "ghcr.io/home-assistant/home-assistant:stable";

fn homeassistant(hot: bool) -> TestContext {
    let ctx = TestContext::new();
    let config_dir = ctx.data_dir("homeassistant").join("config");
    fixtures::write_file(&config_dir.join("home-assistant_v2.db"), "SQLite format 3");
    fixtures::write_file(&config_dir.join("home-assistant_v2.db-wal"), "wal");
    fixtures::write_file(&config_dir.join("configuration.yaml"), "homeassistant:");

    let mut container = fixtures::with_mount(
        fixtures::container("homeassistant", "homeassistant", IMAGE),
        &config_dir,
        "/config",
    );
    if hot {
        container = fixtures::labelled(container, HOT_LABEL, "true");
    }
    ctx.with_container(container)
}

#[test]
fn test_cold_sqlite_copy() {
    let ctx = homeassistant(false);

    let report = ctx.manager().run_backup(None).unwrap();

    let service = &report.services["homeassistant"];
    assert_eq!(service.outcome, ServiceOutcome::Done);
    assert_eq!(service.method, BackupMethod::Cold);
    assert_eq!(ctx.runtime.stopped(), vec!["id-homeassistant"]);
    assert_eq!(ctx.runtime.started(), vec!["id-homeassistant"]);
    assert!(ctx.runtime.is_running("homeassistant"));
}

#[test]
fn test_cold_archive_contents() {
    let ctx = homeassistant(false);

    let report = ctx.manager().run_backup(None).unwrap();
    let archive = report.services["homeassistant"].archive.clone().unwrap();
    let stem = archive
        .file_name()
        .unwrap()
        .to_string_lossy()
        .trim_end_matches(".tar.gz")
        .to_string();

    let copy = fixtures::archive_file(&archive, &format!("{}/databases/homeassistant.sqlite.tar.gz", stem)).unwrap();
    let copy_path = ctx.temp_dir().join("copy.tar.gz");
    std::fs::write(&copy_path, copy).unwrap();
    assert_eq!(fixtures::archive_entries(&copy_path), vec!["config/home-assistant_v2.db"]);

    let files = fixtures::archive_file(&archive, &format!("{}/files/homeassistant_files.tar.gz", stem)).unwrap();
    let files_path = ctx.temp_dir().join("files.tar.gz");
    std::fs::write(&files_path, files).unwrap();
    let entries = fixtures::archive_entries(&files_path);
    assert!(entries.contains(&"config/configuration.yaml".to_string()));
    assert!(!entries.iter().any(|e| e.ends_with("-wal")));
}

#[test]
fn test_hot_label_skips_stop() {
    let ctx = homeassistant(true);

    let report = ctx.manager().run_backup(None).unwrap();

    assert_eq!(report.services["homeassistant"].method, BackupMethod::Hot);
    assert!(ctx.runtime.stopped().is_empty());
    assert_eq!(report.services["homeassistant"].outcome, ServiceOutcome::Done);
}

#[test]
fn test_hot_sqlite_copy_keeps_wal() {
    let ctx = homeassistant(true);

    let report = ctx.manager().run_backup(None).unwrap();
    let archive = report.services["homeassistant"].archive.clone().unwrap();
    let stem = archive
        .file_name()
        .unwrap()
        .to_string_lossy()
        .trim_end_matches(".tar.gz")
        .to_string();

    let copy = fixtures::archive_file(&archive, &format!("{}/databases/homeassistant.sqlite.tar.gz", stem)).unwrap();
    let copy_path = ctx.temp_dir().join("copy.tar.gz");
    std::fs::write(&copy_path, copy).unwrap();
    assert_eq!(
        fixtures::archive_entries(&copy_path),
        vec!["config/home-assistant_v2.db", "config/home-assistant_v2.db-wal"]
    );
}

#[test]
fn test_restart_failure_is_partial() {
    let mut ctx = homeassistant(false);
    ctx.runtime = ctx.runtime.clone().with_failing_start("homeassistant");

    let report = ctx.manager().run_backup(None).unwrap();

    match &report.services["homeassistant"].outcome {
        ServiceOutcome::PartialFailure(errors) => {
            assert!(errors.iter().any(|e| e.starts_with("restart homeassistant")), "{:?}", errors)
        }
        other => panic!("expected partial failure, got {:?}", other),
    }
    assert!(report.services["homeassistant"].archive.is_some());
}
