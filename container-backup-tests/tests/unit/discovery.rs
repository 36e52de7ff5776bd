//! Unit tests for service discovery through the backup manager

use container_backup::managers::discovery::{ComponentRole, HOT_LABEL, SELF_LABEL};
use test_utils::{fixtures, ConfigBuilder, DatabaseType, ServiceConfigBuilder, TestContext};

#[test]
fn test_wordpress_preset_classification() {
    let ctx = TestContext::new().with_containers(fixtures::wordpress_stack());

    let services = ctx.manager().discover().unwrap();
    assert_eq!(services.len(), 1);

    let wordpress = &services[0];
    assert_eq!(wordpress.name, "wordpress");
    let roles: Vec<(String, ComponentRole)> = wordpress
        .components
        .iter()
        .map(|c| (c.name.clone(), c.role))
        .collect();
    assert_eq!(
        roles,
        vec![
            ("wordpress-app".to_string(), ComponentRole::FileSource),
            (
                "wordpress-db".to_string(),
                ComponentRole::Database {
                    db_type: Some(DatabaseType::Mysql)
                }
            ),
        ]
    );
}

#[test]
fn test_image_detection_without_configuration() {
    let ctx = TestContext::new()
        .with_container(fixtures::container("gitea", "gitea-server", "gitea/gitea:1.21"))
        .with_container(fixtures::container("gitea", "gitea-pg", "postgres:16"));

    let services = ctx.manager().discover().unwrap();
    let gitea = &services[0];

    assert_eq!(gitea.components.len(), 1);
    assert_eq!(gitea.components[0].name, "gitea-pg");
    assert!(gitea.components[0].is_database());
}

#[test]
fn test_own_service_and_labelled_containers_skipped() {
    let helper = fixtures::labelled(fixtures::container("tools", "tools-agent", "busybox"), SELF_LABEL, "true");
    let ctx = TestContext::from_builder(
        ConfigBuilder::new()
            .self_names(&["backupd"])
            .service("tools", ServiceConfigBuilder::new().data_paths(&["state"])),
    )
    .with_container(fixtures::container("backupd", "backupd-main", "backupd:latest"))
    .with_container(helper)
    .with_container(fixtures::container("tools", "tools-web", "nginx"));

    let services = ctx.manager().discover().unwrap();
    let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["tools"]);

    let tools = &services[0];
    assert!(tools.contains_backup_tool);
    assert_eq!(tools.components.len(), 1);
    assert_eq!(tools.components[0].name, "tools-web");
}

#[test]
fn test_hot_label_carried_to_component() {
    let db = fixtures::labelled(fixtures::container("shop", "shop-db", "postgres:15"), HOT_LABEL, "true");
    let ctx = TestContext::new().with_container(db);

    let services = ctx.manager().discover().unwrap();
    assert!(services[0].components[0].is_hot());
}

#[test]
fn test_excluded_services_not_returned() {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new()
            .exclude_service("Scratch")
            .service("legacy", ServiceConfigBuilder::new().data_paths(&["x"]).excluded()),
    )
    .with_container(fixtures::container("scratch", "scratch-db", "redis:7"))
    .with_container(fixtures::container("legacy", "legacy-app", "php:8"))
    .with_container(fixtures::container("shop", "shop-db", "mariadb:11"));

    let services = ctx.manager().discover().unwrap();
    let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["shop"]);
}

#[test]
fn test_no_containers_means_no_services() {
    let ctx = TestContext::new();
    assert!(ctx.manager().discover().unwrap().is_empty());
}
