//! Run lock left behind by a crashed or foreign run

use chrono::{Duration, Utc};
use container_backup::utils::locker::{local_hostname, LockRecord};
use std::fs;
use std::path::PathBuf;
use test_utils::{fixtures, ConfigBuilder, RunError, ServiceConfigBuilder, TestContext};

fn blog() -> TestContext {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new().service("blog", ServiceConfigBuilder::new().data_paths(&["html"])),
    )
    .with_container(fixtures::container("blog", "blog-web", "nginx"));
    ctx.create_data_file("blog", "html/index.html", "hi");
    ctx
}

fn plant_lock(ctx: &TestContext, record: &LockRecord) -> PathBuf {
    let dir = ctx.config().lock_dir();
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("run.lock");
    fs::write(&path, serde_json::to_vec(record).unwrap()).unwrap();
    path
}

#[test]
fn test_dead_holder_is_reclaimed() {
    let ctx = blog();
    let lock = plant_lock(
        &ctx,
        &LockRecord {
            pid: 999_999_999,
            hostname: local_hostname(),
            acquired_at: Utc::now(),
        },
    );

    let report = ctx.manager().run_backup(None).unwrap();

    assert_eq!(report.counts(), (1, 0, 0, 0));
    assert!(!lock.exists());
}

#[test]
fn test_expired_foreign_lock_is_reclaimed() {
    let ctx = blog();
    plant_lock(
        &ctx,
        &LockRecord {
            pid: 1,
            hostname: "some-other-host".to_string(),
            acquired_at: Utc::now() - Duration::hours(5),
        },
    );

    let report = ctx.manager().run_backup(None).unwrap();
    assert_eq!(report.services.len(), 1);
}

#[test]
fn test_fresh_foreign_lock_blocks_run() {
    let ctx = blog();
    let lock = plant_lock(
        &ctx,
        &LockRecord {
            pid: 4242,
            hostname: "some-other-host".to_string(),
            acquired_at: Utc::now(),
        },
    );

    let err = ctx.manager().run_backup(None).unwrap_err();

    assert!(err.is_lock_held());
    match err {
        RunError::AlreadyRunning(record) => assert_eq!(record.hostname, "some-other-host"),
        other => panic!("expected AlreadyRunning, got {}", other),
    }
    assert!(lock.exists());
    assert!(ctx.archives().is_empty());
    assert!(ctx.runtime.get_calls().is_empty());
}
