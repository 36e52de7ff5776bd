//! Tests for the 'retention' command
//!
//! The retention command deletes archives that fell out of their service's
//! retention policy.

use chrono::{Duration, Local};
use test_utils::{fixtures, ConfigBuilder, ServiceConfigBuilder, TestContext};

fn archive(ctx: &TestContext, service: &str, days_ago: i64) -> std::path::PathBuf {
    let stamp = (Local::now().naive_local() - Duration::days(days_ago)).format("%Y%m%d_%H%M%S");
    let path = ctx.backup_dir().join(format!("{}_{}.tar.gz", service, stamp));
    fixtures::write_file(&path, "archive");
    path
}

#[test]
fn test_retention_uses_each_service_policy() {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new()
            .retention_days(10)
            .service("crm", ServiceConfigBuilder::new().keep_last(1)),
    );
    let crm_new = archive(&ctx, "crm", 1);
    let crm_old = archive(&ctx, "crm", 2);
    let blog_recent = archive(&ctx, "blog", 5);
    let blog_expired = archive(&ctx, "blog", 20);

    let report = ctx.retention().apply_retention(None).unwrap();

    assert_eq!(report.deleted.len(), 2);
    assert_eq!(report.kept, 2);
    assert!(!report.has_failures());
    assert!(crm_new.exists() && blog_recent.exists());
    assert!(!crm_old.exists() && !blog_expired.exists());
}

#[test]
fn test_retention_after_backup_keeps_fresh_archive() {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new()
            .retention_days(1)
            .service("blog", ServiceConfigBuilder::new().data_paths(&["html"])),
    )
    .with_container(fixtures::container("blog", "blog-web", "nginx"));
    ctx.create_data_file("blog", "html/index.html", "hi");
    archive(&ctx, "blog", 3);

    ctx.manager().run_backup(None).unwrap();
    assert_eq!(ctx.archives().len(), 2);

    let report = ctx.retention().apply_retention(None).unwrap();

    assert_eq!(report.deleted.len(), 1);
    assert_eq!(ctx.archives().len(), 1);
}

#[test]
fn test_retention_on_missing_root() {
    let ctx = TestContext::new();
    assert!(!ctx.backup_dir().exists());

    let report = ctx.retention().apply_retention(Some("anything")).unwrap();
    assert!(report.deleted.is_empty());
    assert_eq!(report.kept, 0);
}
