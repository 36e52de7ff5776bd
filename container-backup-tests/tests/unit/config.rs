//! Unit tests for configuration loading and resolution

use container_backup::config::{ConfigResolver, EngineConfig, RetentionPolicy};
use rstest::rstest;
use serial_test::serial;
use std::path::PathBuf;
use std::time::Duration;
use test_utils::{ConfigBuilder, ServiceConfigBuilder};

#[test]
#[serial]
fn test_from_env_reads_process_environment() {
    std::env::set_var("BACKUP_DIR", "/tmp/cb-test-backups");
    std::env::set_var("STOP_TIMEOUT", "2m");
    std::env::set_var("SERVICE_CONFIG_GITEA", r#"{"files": {"data_paths": ["repos"]}}"#);

    let config = EngineConfig::from_env();

    std::env::remove_var("BACKUP_DIR");
    std::env::remove_var("STOP_TIMEOUT");
    std::env::remove_var("SERVICE_CONFIG_GITEA");

    let config = config.unwrap();
    assert_eq!(config.backup_dir, PathBuf::from("/tmp/cb-test-backups"));
    assert_eq!(config.stop_timeout, Duration::from_secs(120));
    let gitea = ConfigResolver::from_engine(&config).resolve("gitea");
    assert_eq!(gitea.files.data_paths, vec!["repos"]);
}

#[test]
#[serial]
fn test_from_env_rejects_bad_concurrency() {
    std::env::set_var("MAX_CONCURRENT_BACKUPS", "0");
    let result = EngineConfig::from_env();
    std::env::remove_var("MAX_CONCURRENT_BACKUPS");

    let err = result.unwrap_err();
    assert!(err.to_string().contains("MAX_CONCURRENT_BACKUPS"));
}

#[test]
fn test_environment_overrides_file_per_field() {
    let (config, _dir) = ConfigBuilder::new()
        .config_file(
            "services.toml",
            r#"
[services.blog.files]
data_paths = ["html", "uploads"]
exclusions = ["*.tmp"]

[services.blog.global]
priority = 10
"#,
        )
        .service("blog", ServiceConfigBuilder::new().data_paths(&["html"]).stop_files())
        .build();

    let blog = ConfigResolver::from_engine(&config).resolve("blog");

    assert_eq!(blog.files.data_paths, vec!["html"]);
    assert!(blog.files.requires_stopping);
    // Untouched by the environment block
    assert_eq!(blog.files.exclusions, vec!["*.tmp"]);
    assert_eq!(blog.global.priority, 10);
}

#[test]
fn test_preset_applies_without_configuration() {
    let (config, _dir) = ConfigBuilder::new().build();
    let wordpress = ConfigResolver::from_engine(&config).resolve("WordPress");

    assert_eq!(wordpress.files.data_paths, vec!["wp-content"]);
    assert!(wordpress.files.exclusions.contains(&"wp-content/cache/*".to_string()));
    assert!(!wordpress.database.requires_stopping);
}

#[rstest]
#[case(ServiceConfigBuilder::new().keep_last(4), RetentionPolicy::CountBased { keep: 4 })]
#[case(ServiceConfigBuilder::new().mixed_retention(7, 4, 6), RetentionPolicy::Mixed { daily: 7, weekly: 4, monthly: 6 })]
#[case(ServiceConfigBuilder::new().priority(1), RetentionPolicy::TimeBased { days: 9 })]
fn test_retention_forms(#[case] service: ServiceConfigBuilder, #[case] expected: RetentionPolicy) {
    let (config, _dir) = ConfigBuilder::new().retention_days(9).service("app", service).build();
    let app = ConfigResolver::from_engine(&config).resolve("app");
    assert_eq!(app.global.retention_policy, expected);
}

#[test]
fn test_resolve_is_idempotent() {
    let (config, _dir) = ConfigBuilder::new()
        .service("app", ServiceConfigBuilder::new().database_type("postgres").credentials("u", "p"))
        .build();
    let resolver = ConfigResolver::from_engine(&config);

    assert_eq!(resolver.resolve("app"), resolver.resolve("app"));
    assert_eq!(resolver.resolve("app"), resolver.resolve("APP"));
}

#[test]
fn test_credentials_are_masked_in_debug() {
    let (config, _dir) = ConfigBuilder::new()
        .service("app", ServiceConfigBuilder::new().credentials("admin", "hunter2-very-secret"))
        .build();
    let app = ConfigResolver::from_engine(&config).resolve("app");

    let debug = format!("{:?}", app);
    assert!(debug.contains("admin"));
    assert!(!debug.contains("hunter2-very-secret"));
}
