//! Cold backups share one worker: the next service may only stop its
//! containers after the previous one has restarted and cleaned up

use test_utils::{fixtures, BackupState, ConfigBuilder, ServiceConfigBuilder, ServiceOutcome, TestContext};

fn cold_service() -> ServiceConfigBuilder {
    ServiceConfigBuilder::new().data_paths(&["state"]).stop_files()
}

#[test]
fn test_cold_services_do_not_overlap() {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new()
            .max_concurrent(1)
            .service("alpha", cold_service())
            .service("beta", cold_service()),
    )
    .with_container(fixtures::container("alpha", "alpha-app", "alpine"))
    .with_container(fixtures::container("beta", "beta-app", "alpine"));
    ctx.create_data_file("alpha", "state/a.json", "{}");
    ctx.create_data_file("beta", "state/b.json", "{}");

    let report = ctx.manager().run_backup(None).unwrap();
    assert_eq!(report.counts(), (2, 0, 0, 0));

    let observer = &ctx.observer;
    let alpha_cleanup = observer.position("alpha", BackupState::Cleanup).unwrap();
    let beta_stopping = observer.position("beta", BackupState::Stopping).unwrap();
    assert!(
        alpha_cleanup < beta_stopping,
        "beta stopped before alpha finished: {:?}",
        observer.events()
    );

    assert_eq!(ctx.runtime.stopped(), vec!["id-alpha-app", "id-beta-app"]);
    assert_eq!(ctx.runtime.started(), vec!["id-alpha-app", "id-beta-app"]);
    assert!(ctx.runtime.is_running("alpha-app") && ctx.runtime.is_running("beta-app"));
}

#[test]
fn test_priority_decides_which_goes_first() {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new()
            .max_concurrent(1)
            .service("alpha", cold_service().priority(50))
            .service("beta", cold_service().priority(10)),
    )
    .with_container(fixtures::container("alpha", "alpha-app", "alpine"))
    .with_container(fixtures::container("beta", "beta-app", "alpine"));
    ctx.create_data_file("alpha", "state/a.json", "{}");
    ctx.create_data_file("beta", "state/b.json", "{}");

    ctx.manager().run_backup(None).unwrap();

    let observer = &ctx.observer;
    let beta_done = observer.position("beta", BackupState::Done).unwrap();
    let alpha_preparing = observer.position("alpha", BackupState::Preparing).unwrap();
    assert!(beta_done < alpha_preparing);
}

#[test]
fn test_every_service_reaches_a_final_state() {
    let ctx = TestContext::from_builder(
        ConfigBuilder::new()
            .max_concurrent(3)
            .service("alpha", cold_service())
            .service("beta", cold_service())
            .service("gamma", cold_service()),
    )
    .with_containers(vec![
        fixtures::container("alpha", "alpha-app", "alpine"),
        fixtures::container("beta", "beta-app", "alpine"),
        fixtures::container("gamma", "gamma-app", "alpine"),
    ]);
    for service in ["alpha", "beta", "gamma"] {
        ctx.create_data_file(service, "state/data.json", "{}");
    }

    let report = ctx.manager().run_backup(None).unwrap();

    for service in ["alpha", "beta", "gamma"] {
        assert_eq!(report.services[service].outcome, ServiceOutcome::Done);
        let states = ctx.observer.states(service);
        assert_eq!(states.first(), Some(&BackupState::Preparing));
        assert_eq!(states.last(), Some(&BackupState::Done));
        assert!(ctx.runtime.is_running(&format!("{}-app", service)));
    }
    assert_eq!(ctx.archives().len(), 3);
}
