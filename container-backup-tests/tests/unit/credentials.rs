//! Unit tests for credential discovery

use container_backup::config::{Credentials, DatabaseType};
use container_backup::managers::credentials::{extract_credentials, CredentialClient, CredentialError};
use rstest::rstest;
use std::collections::HashMap;
use std::sync::Arc;
use test_utils::{MockStackApi, StackApi};

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[rstest]
#[case(DatabaseType::Postgres, &[("POSTGRES_USER", "pg"), ("POSTGRES_PASSWORD", "x")], "pg")]
#[case(DatabaseType::Mysql, &[("MYSQL_USER", "wp"), ("MYSQL_PASSWORD", "x")], "wp")]
#[case(DatabaseType::Mariadb, &[("MARIADB_ROOT_PASSWORD", "x"), ("MARIADB_USER", "app")], "root")]
#[case(DatabaseType::Mongodb, &[("MONGO_INITDB_ROOT_USERNAME", "admin"), ("MONGO_INITDB_ROOT_PASSWORD", "x")], "admin")]
fn test_user_conventions(#[case] db_type: DatabaseType, #[case] vars: &[(&str, &str)], #[case] user: &str) {
    let creds = extract_credentials(&env(vars), "stack", db_type).unwrap();
    assert_eq!(creds.user.as_deref(), Some(user));
    assert_eq!(creds.password.as_deref(), Some("x"));
}

#[test]
fn test_redis_password_only() {
    let creds = extract_credentials(&env(&[("REDIS_PASSWORD", "r")]), "cache", DatabaseType::Redis).unwrap();
    assert!(creds.user.is_none());
    assert_eq!(creds.password.as_deref(), Some("r"));
}

#[test]
fn test_stack_prefixed_keys() {
    let vars = env(&[("MY_APP_DB_USER", "svc"), ("MY_APP_DB_PASSWORD", "pw"), ("MY_APP_DB_NAME", "main")]);
    let creds = extract_credentials(&vars, "my-app", DatabaseType::Postgres).unwrap();

    assert_eq!(creds.user.as_deref(), Some("svc"));
    assert_eq!(creds.database.as_deref(), Some("main"));
}

#[test]
fn test_prefetched_stack_wins_over_container() {
    let api = MockStackApi::new().with_stack("shop", &[("MYSQL_ROOT_PASSWORD", "stack-pw")]);
    let client = CredentialClient::new(Some(Arc::new(api) as Arc<dyn StackApi>));
    let environments = client.prefetch(["shop"]);

    let container = env(&[("MYSQL_ROOT_PASSWORD", "container-pw")]);
    let creds = environments
        .resolve("shop", DatabaseType::Mysql, None, &container)
        .unwrap();

    assert_eq!(creds.password.as_deref(), Some("stack-pw"));
}

#[test]
fn test_failed_prefetch_falls_back() {
    let api = MockStackApi::new().failing();
    let client = CredentialClient::new(Some(Arc::new(api) as Arc<dyn StackApi>));
    let environments = client.prefetch(["shop"]);
    assert!(environments.is_unavailable("shop"));

    let container = env(&[("POSTGRES_USER", "c"), ("POSTGRES_PASSWORD", "p")]);
    let creds = environments
        .resolve("shop", DatabaseType::Postgres, None, &container)
        .unwrap();
    assert_eq!(creds.user.as_deref(), Some("c"));
}

#[test]
fn test_explicit_configuration_completes_discovered() {
    let environments = CredentialClient::new(None)
        .prefetch(["x"])
        .with_stack("app", env(&[("POSTGRES_USER", "found"), ("POSTGRES_PASSWORD", "pw")]));
    let explicit = Credentials {
        database: Some("reporting".into()),
        ..Default::default()
    };

    let creds = environments
        .resolve("app", DatabaseType::Postgres, Some(&explicit), &HashMap::new())
        .unwrap();

    assert_eq!(creds.user.as_deref(), Some("found"));
    assert_eq!(creds.database.as_deref(), Some("reporting"));
}

#[test]
fn test_nothing_anywhere_is_not_found() {
    let environments = CredentialClient::new(None).prefetch(["app"]);
    let err = environments
        .resolve("app", DatabaseType::Postgres, None, &HashMap::new())
        .unwrap_err();

    assert_eq!(
        err,
        CredentialError::NotFound {
            stack: "app".into(),
            db_type: DatabaseType::Postgres
        }
    );
}
