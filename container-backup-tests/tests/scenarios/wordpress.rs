//! WordPress with MySQL, configured only by the built-in preset

use std::path::{Path, PathBuf};
use test_utils::{fixtures, BackupMethod, RuntimeCall, ServiceOutcome, TestContext};

const DUMP: &str = "-- MySQL dump\nCREATE TABLE wp_posts (ID bigint);\n";

fn wordpress() -> TestContext {
    let ctx = TestContext::new()
        .with_containers(fixtures::wordpress_stack())
        .with_stack("wordpress", &fixtures::wordpress_env())
        .with_exec("wordpress-db", "mysqldump", DUMP);
    fixtures::wordpress_data(&ctx.config().data_root);
    ctx
}

fn stem_of(archive: &Path) -> String {
    archive
        .file_name()
        .unwrap()
        .to_string_lossy()
        .trim_end_matches(".tar.gz")
        .to_string()
}

/// Extract one inner archive so its entries can be listed
fn extract(ctx: &TestContext, outer: &Path, name: &str) -> PathBuf {
    let bytes = fixtures::archive_file(outer, name).unwrap_or_else(|| panic!("{} missing", name));
    let path = ctx.temp_dir().join("inner.tar.gz");
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn test_wordpress_full_backup() {
    let ctx = wordpress();

    let report = ctx.manager().run_backup(None).unwrap();

    let service = &report.services["wordpress"];
    assert_eq!(service.outcome, ServiceOutcome::Done);
    assert_eq!(service.method, BackupMethod::Hot);
    assert!(ctx.runtime.stopped().is_empty());

    let archive = service.archive.clone().unwrap();
    assert_eq!(ctx.archives(), vec![archive.clone()]);
    let stem = stem_of(&archive);
    assert!(stem.starts_with("wordpress_"));

    let entries = fixtures::archive_entries(&archive);
    for expected in [
        format!("{}/metadata.json", stem),
        format!("{}/databases/wordpress-db.sql.gz", stem),
        format!("{}/files/wordpress_files.tar.gz", stem),
    ] {
        assert!(entries.contains(&expected), "{} not in {:?}", expected, entries);
    }
}

#[test]
fn test_wordpress_dump_uses_stack_root_credentials() {
    let ctx = wordpress();

    let report = ctx.manager().run_backup(None).unwrap();
    let archive = report.services["wordpress"].archive.clone().unwrap();
    let stem = stem_of(&archive);

    let dump = fixtures::archive_file(&archive, &format!("{}/databases/wordpress-db.sql.gz", stem)).unwrap();
    assert_eq!(fixtures::gunzip(&dump), DUMP.as_bytes());

    let exec = ctx
        .runtime
        .get_calls()
        .into_iter()
        .find_map(|call| match call {
            RuntimeCall::Exec { command, env_keys, .. } => Some((command, env_keys)),
            _ => None,
        })
        .unwrap();
    let (command, env_keys) = exec;
    assert_eq!(&command[..3], ["mysqldump", "-u", "root"]);
    assert!(command.windows(2).any(|w| w == ["--databases", "wordpress"]));
    assert!(command.windows(2).any(|w| w == ["-h", "wordpress-db"]));
    assert_eq!(env_keys, vec!["MYSQL_PWD"]);
    // The password travels in the environment only
    assert!(!command.iter().any(|arg| arg.contains("root-secret")));
}

#[test]
fn test_wordpress_exclusions_applied() {
    let ctx = wordpress();

    let report = ctx.manager().run_backup(None).unwrap();
    let archive = report.services["wordpress"].archive.clone().unwrap();
    let stem = stem_of(&archive);

    let files = extract(&ctx, &archive, &format!("{}/files/wordpress_files.tar.gz", stem));
    let entries = fixtures::archive_entries(&files);

    assert!(entries.contains(&"wp-content/uploads/2024/01/photo.jpg".to_string()));
    assert!(entries.contains(&"wp-content/themes/site/style.css".to_string()));
    assert!(!entries.iter().any(|e| e.contains("cache")), "{:?}", entries);
    assert!(!entries.iter().any(|e| e.ends_with("debug.log")), "{:?}", entries);
}

#[test]
fn test_wordpress_manifest_lists_components() {
    let ctx = wordpress();

    let report = ctx.manager().run_backup(None).unwrap();
    let archive = report.services["wordpress"].archive.clone().unwrap();
    let stem = stem_of(&archive);

    let manifest = fixtures::archive_file(&archive, &format!("{}/metadata.json", stem)).unwrap();
    let manifest: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
    let names: Vec<&str> = manifest["components"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();

    assert_eq!(names, vec!["wordpress-db", "files"]);
    assert!(manifest["components"]
        .as_array()
        .unwrap()
        .iter()
        .all(|c| c["status"] == "done"));
}
