//! Tests for the 'backup' command
//!
//! The backup command discovers services, backs up each one and writes a
//! report of the run.

use test_utils::{fixtures, ConfigBuilder, RunReport, ServiceConfigBuilder, ServiceOutcome, TestContext, TestResult};

fn blog_and_shop() -> TestContext {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new()
            .service("blog", ServiceConfigBuilder::new().data_paths(&["html"]))
            .service("shop", ServiceConfigBuilder::new().data_paths(&["media"])),
    )
    .with_container(fixtures::container("blog", "blog-web", "nginx:1.25"))
    .with_container(fixtures::container("shop", "shop-web", "php:8.3-apache"));
    ctx.create_data_file("blog", "html/index.html", "<h1>blog</h1>");
    ctx.create_data_file("shop", "media/logo.png", "png");
    ctx
}

#[test]
fn test_backup_all_services() {
    let ctx = blog_and_shop();

    let report = ctx.manager().run_backup(None).unwrap();

    assert_eq!(report.services.len(), 2);
    assert!(report.services.values().all(|s| s.outcome == ServiceOutcome::Done));
    assert_eq!(report.counts(), (2, 0, 0, 0));
    assert!(!report.has_failures());
    assert_eq!(ctx.archives().len(), 2);
}

#[test]
fn test_backup_named_services_only() {
    let ctx = blog_and_shop();
    let filter = vec!["Shop".to_string(), "unknown".to_string()];

    let report = ctx.manager().run_backup(Some(&filter)).unwrap();

    let names: Vec<&str> = report.services.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["shop"]);
    let archives = ctx.archives();
    assert_eq!(archives.len(), 1);
    assert!(archives[0].file_name().unwrap().to_string_lossy().starts_with("shop_"));
}

#[test]
fn test_backup_writes_last_run_report() -> TestResult {
    let ctx = blog_and_shop();

    let report = ctx.manager().run_backup(None)?;
    let loaded = RunReport::load(&ctx.config().last_run_path())?.expect("last_run.json written");

    assert_eq!(loaded.services.len(), report.services.len());
    assert_eq!(loaded.services["blog"].outcome, ServiceOutcome::Done);
    assert_eq!(loaded.services["blog"].archive, report.services["blog"].archive);
    Ok(())
}

#[test]
fn test_backup_archive_contains_manifest() {
    let ctx = blog_and_shop();

    let report = ctx.manager().run_backup(None).unwrap();
    let archive = report.services["blog"].archive.clone().unwrap();
    let stem = archive
        .file_name()
        .unwrap()
        .to_string_lossy()
        .trim_end_matches(".tar.gz")
        .to_string();

    let manifest = fixtures::archive_file(&archive, &format!("{}/metadata.json", stem)).unwrap();
    let manifest: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
    assert_eq!(manifest["service"], "blog");
    assert_eq!(manifest["method"], "hot");
    assert_eq!(manifest["components"][0]["name"], "files");
}

#[test]
fn test_backup_with_nothing_running() {
    let ctx = TestContext::new();

    let report = ctx.manager().run_backup(None).unwrap();

    assert!(report.services.is_empty());
    assert!(ctx.archives().is_empty());
    assert!(ctx.config().last_run_path().exists());
}

#[test]
fn test_backup_failure_marks_run_failed() {
    let ctx = TestContext::new().with_container(fixtures::container("crm", "crm-db", "postgres:16"));

    let report = ctx.manager().run_backup(None).unwrap();

    assert!(report.has_failures());
    assert!(report.services["crm"].outcome.is_failed());
    assert!(ctx.archives().is_empty());
}
