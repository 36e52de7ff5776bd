//! Tests for the 'status' command
//!
//! The status command summarises the archives in the backup root, the run
//! lock and the last run.

use chrono::{Duration, Local};
use container_backup::managers::status::{collect_status, collect_status_at, render_text, Health};
use container_backup::utils::locker::RunLock;
use test_utils::{fixtures, ConfigBuilder, ServiceConfigBuilder, TestContext};

#[test]
fn test_status_empty_backup_root() {
    let ctx = TestContext::new();

    let report = collect_status(ctx.config()).unwrap();
    let text = render_text(&report);

    assert!(report.services.is_empty());
    assert!(text.contains("Run lock: free"));
    assert!(text.contains("Last run: never"));
    assert!(text.contains("(no archives)"));
}

#[test]
fn test_status_after_backup() {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new().service("blog", ServiceConfigBuilder::new().data_paths(&["html"])),
    )
    .with_container(fixtures::container("blog", "blog-web", "nginx"));
    ctx.create_data_file("blog", "html/index.html", "hello");
    ctx.manager().run_backup(None).unwrap();

    let report = collect_status(ctx.config()).unwrap();

    let blog = &report.services["blog"];
    assert_eq!(blog.count, 1);
    assert!(blog.total_bytes > 0);
    assert_eq!(blog.health, Health::Healthy);
    assert!(report.last_run.is_some());

    let text = render_text(&report);
    assert!(text.contains("blog - 1 archives"));
    assert!(text.contains("Last outcome: done"));
    assert!(text.contains("1 done, 0 partial, 0 failed, 0 skipped"));
}

#[test]
fn test_status_lists_failed_service_components() {
    let ctx = TestContext::new().with_container(fixtures::container("crm", "crm-db", "postgres:16"));
    let run = ctx.manager().run_backup(None).unwrap();
    assert!(run.services["crm"].outcome.is_failed());

    let report = collect_status(ctx.config()).unwrap();
    let text = render_text(&report);

    assert!(report.services.is_empty());
    assert!(!text.contains("(no archives)"));
    assert!(text.contains("crm - no archives"));
    assert!(text.contains("Last outcome: failed"));
    assert!(text.contains("crm-db (database): failed: no-credentials"));
}

#[test]
fn test_status_health_by_age() {
    let ctx = TestContext::new();
    let now = Local::now().naive_local();
    for (service, hours) in [("fresh", 2), ("aging", 30), ("stale", 72)] {
        let stamp = (now - Duration::hours(hours)).format("%Y%m%d_%H%M%S");
        fixtures::write_file(&ctx.backup_dir().join(format!("{}_{}.tar.gz", service, stamp)), "x");
    }

    let report = collect_status_at(ctx.config(), now).unwrap();

    assert_eq!(report.services["fresh"].health, Health::Healthy);
    assert_eq!(report.services["aging"].health, Health::Warning);
    assert_eq!(report.services["stale"].health, Health::Critical);
}

#[test]
fn test_status_json_output() {
    let ctx = TestContext::new();
    fixtures::write_file(&ctx.backup_dir().join("app_20240101_020000.tar.gz"), "archive");

    let report = collect_status(ctx.config()).unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["services"]["app"]["count"], 1);
    assert_eq!(json["services"]["app"]["total_bytes"], 7);
    assert_eq!(json["services"]["app"]["health"], "critical");
    assert!(json["lock"].is_null());
}

#[test]
fn test_status_shows_held_lock() {
    let ctx = TestContext::new();
    let lock = RunLock::acquire(&ctx.config().lock_dir(), ctx.config().lock_timeout).unwrap();

    let report = collect_status(ctx.config()).unwrap();
    let summary = report.lock.clone().unwrap();
    assert_eq!(summary.pid, Some(std::process::id()));
    assert!(!summary.stale);
    assert!(render_text(&report).contains("Run lock: held by pid"));

    drop(lock);
    assert!(collect_status(ctx.config()).unwrap().lock.is_none());
}
