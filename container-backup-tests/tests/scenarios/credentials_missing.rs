//! A database without any discoverable credentials must not sink the rest
//! of its service

use test_utils::{fixtures, ComponentStatus, ConfigBuilder, ServiceConfigBuilder, ServiceOutcome, TestContext};

fn crm() -> TestContext {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new().service("crm", ServiceConfigBuilder::new().data_paths(&["uploads"])),
    )
    .with_container(fixtures::container("crm", "crm-app", "ghcr.io/acme/crm:2"))
    .with_container(fixtures::container("crm", "crm-db", "postgres:16-alpine"))
    .with_stack("crm", &[("APP_URL", "https://crm.example.com")]);
    ctx.create_data_file("crm", "uploads/invoice.pdf", "%PDF");
    ctx
}

#[test]
fn test_missing_credentials_partial_failure() {
    let ctx = crm();

    let report = ctx.manager().run_backup(None).unwrap();
    let service = &report.services["crm"];

    match &service.outcome {
        ServiceOutcome::PartialFailure(errors) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].starts_with("crm-db: no-credentials"), "{}", errors[0]);
        }
        other => panic!("expected partial failure, got {:?}", other),
    }

    let db = service.components.iter().find(|c| c.name == "crm-db").unwrap();
    assert_eq!(db.status, ComponentStatus::Failed);
    assert!(db.error.as_deref().unwrap().starts_with("no-credentials"));

    let files = service.components.iter().find(|c| c.name == "files").unwrap();
    assert_eq!(files.status, ComponentStatus::Done);
    assert!(service.archive.as_ref().unwrap().exists());
    assert!(report.has_failures());
}

#[test]
fn test_missing_credentials_never_execs() {
    let ctx = crm();

    ctx.manager().run_backup(None).unwrap();

    assert_eq!(ctx.runtime.exec_count(), 0);
}

#[test]
fn test_container_environment_rescues_dump() {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new().service("crm", ServiceConfigBuilder::new().data_paths(&["uploads"])),
    )
    .with_container(fixtures::container("crm", "crm-app", "ghcr.io/acme/crm:2"))
    .with_container(fixtures::with_env(
        fixtures::container("crm", "crm-db", "postgres:16-alpine"),
        &fixtures::postgres_env(),
    ))
    .with_exec("crm-db", "pg_dump", "-- PostgreSQL database dump");
    ctx.create_data_file("crm", "uploads/invoice.pdf", "%PDF");

    let report = ctx.manager().run_backup(None).unwrap();

    assert_eq!(report.services["crm"].outcome, ServiceOutcome::Done);
    assert_eq!(ctx.runtime.exec_count(), 1);
}
