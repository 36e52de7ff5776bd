//! Unit tests for archive retention against a real backup root

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rstest::rstest;
use std::path::PathBuf;
use test_utils::{fixtures, ConfigBuilder, ServiceConfigBuilder, TestContext};

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 30).unwrap().and_hms_opt(12, 0, 0).unwrap()
}

/// One archive per day, newest first, starting yesterday
fn daily_archives(ctx: &TestContext, service: &str, count: i64) -> Vec<PathBuf> {
    (1..=count)
        .map(|days| {
            let stamp = (now() - Duration::days(days)).format("%Y%m%d_%H%M%S");
            let path = ctx.backup_dir().join(format!("{}_{}.tar.gz", service, stamp));
            fixtures::write_file(&path, "archive");
            path
        })
        .collect()
}

#[rstest]
#[case(3, 5)]
#[case(5, 5)]
#[case(8, 5)]
#[case(1, 1)]
fn test_count_based_keeps_newest(#[case] keep: u32, #[case] existing: i64) {
    let ctx = TestContext::from_builder(ConfigBuilder::new().service("app", ServiceConfigBuilder::new().keep_last(keep)));
    let archives = daily_archives(&ctx, "app", existing);

    let report = ctx.retention().apply_at(None, now()).unwrap();

    let kept = (keep as usize).min(existing as usize);
    assert_eq!(report.kept, kept);
    assert_eq!(ctx.archives().len(), kept);
    for (i, path) in archives.iter().enumerate() {
        assert_eq!(path.exists(), i < kept, "{}", path.display());
    }
}

#[test]
fn test_default_days_apply_to_unconfigured_services() {
    let ctx = TestContext::from_builder(ConfigBuilder::new().retention_days(3));
    daily_archives(&ctx, "blog", 6);

    let report = ctx.retention().apply_at(None, now()).unwrap();

    // exactly 3 days old is still kept
    assert_eq!(report.kept, 3);
    assert_eq!(report.deleted.len(), 3);
}

#[test]
fn test_single_service_leaves_others() {
    let ctx = TestContext::from_builder(ConfigBuilder::new().retention_days(1));
    daily_archives(&ctx, "blog", 4);
    daily_archives(&ctx, "shop", 4);

    let report = ctx.retention().apply_at(Some("SHOP"), now()).unwrap();

    assert!(!report.deleted.is_empty());
    assert!(report.deleted.iter().all(|p| p.to_string_lossy().contains("shop_")));
    let blog_left = ctx
        .archives()
        .iter()
        .filter(|p| p.to_string_lossy().contains("blog_"))
        .count();
    assert_eq!(blog_left, 4);
}

#[test]
fn test_foreign_files_untouched() {
    let ctx = TestContext::from_builder(ConfigBuilder::new().retention_days(1));
    let stray = ctx.backup_dir().join("notes.tar.gz");
    fixtures::write_file(&stray, "keep me");
    fixtures::write_file(&ctx.backup_dir().join("last_run.json"), "{}");

    let report = ctx.retention().apply_at(None, now()).unwrap();

    assert!(report.deleted.is_empty());
    assert!(stray.exists());
}
