//! A service without data paths falls back to its containers' bind mounts

use std::path::Path;
use tempfile::TempDir;
use test_utils::{fixtures, ServiceOutcome, TestContext};

/// Host directories for the mounts. The system temp directory is itself
/// never archived from a mount, so these live beside the test crate.
fn host_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix(".mounts-")
        .tempdir_in(env!("CARGO_MANIFEST_DIR"))
        .unwrap()
}

fn notes(host: &Path) -> TestContext {
    fixtures::write_file(&host.join("data/notes/todo.md"), "- backups");
    fixtures::write_file(&host.join("data/cache/thumb.png"), "png");
    fixtures::write_file(&host.join("config/app.yml"), "port: 80");

    let app = fixtures::with_mount(
        fixtures::with_mount(
            fixtures::container("notes", "notes-app", "ghcr.io/acme/notes:1"),
            &host.join("data"),
            "/data",
        ),
        &host.join("config"),
        "/config",
    );
    let app = fixtures::with_mount(app, Path::new("/var/run/docker.sock"), "/var/run/docker.sock");
    let worker = fixtures::with_mount(
        fixtures::container("notes", "notes-worker", "ghcr.io/acme/notes:1"),
        &host.join("data"),
        "/data",
    );

    TestContext::new().with_container(app).with_container(worker)
}

#[test]
fn test_mounts_backed_up_without_data_paths() {
    let host = host_dir();
    let ctx = notes(host.path());

    let report = ctx.manager().run_backup(None).unwrap();

    let service = &report.services["notes"];
    assert_eq!(service.outcome, ServiceOutcome::Done);
    let archive = service.archive.clone().unwrap();
    let stem = archive
        .file_name()
        .unwrap()
        .to_string_lossy()
        .trim_end_matches(".tar.gz")
        .to_string();

    let files = fixtures::archive_file(&archive, &format!("{}/files/notes_files.tar.gz", stem)).unwrap();
    let files_path = ctx.temp_dir().join("files.tar.gz");
    std::fs::write(&files_path, files).unwrap();
    let entries = fixtures::archive_entries(&files_path);

    assert!(entries.contains(&"data/notes/todo.md".to_string()), "{:?}", entries);
    assert!(entries.contains(&"config/app.yml".to_string()));
    // Global exclusions still apply
    assert!(!entries.iter().any(|e| e.contains("thumb.png")));
    // The shared mount is archived once
    assert!(!entries.iter().any(|e| e.starts_with("data_2")));
    assert!(!entries.iter().any(|e| e.contains("docker.sock")));
}

#[test]
fn test_system_mounts_alone_give_nothing_to_back_up() {
    let ctx = TestContext::new().with_container(fixtures::with_mount(
        fixtures::container("proxy", "proxy", "traefik:3"),
        Path::new("/var/run/docker.sock"),
        "/var/run/docker.sock",
    ));

    let services = ctx.manager().discover().unwrap();

    assert!(services.is_empty());
}
