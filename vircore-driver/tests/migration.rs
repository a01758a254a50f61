//! Migration V3 phase sequence, including a mid-flight cancel (§4.8).

mod common;

use std::sync::Arc;

use vircore_driver::lifecycle;
use vircore_driver::migration;
use vircore_driver::registry::DomainRegistry;
use vircore_driver::testutil::{FakeMigrationTransport, FakeMonitorTransport};
use vircore_driver::types::{StateReason, VmState};

#[tokio::test]
async fn successful_migration_runs_begin_through_confirm() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("movable")).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);
    let migration_transport = FakeMigrationTransport { listen_port: 49200 };

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(1))
            .await
            .unwrap();
    }

    let (begin_result, guard) = migration::begin(&vm, true).await.unwrap();
    let guard = guard.expect("change_protection requests a migration-out async job");

    let port = migration::prepare(&begin_result.migratable_xml_def, &migration_transport, &begin_result.cookie)
        .await
        .unwrap();
    assert_eq!(port, 49200);

    migration::perform(&vm, &session, &migration_transport, &guard, "dest.example", port)
        .await
        .unwrap();

    migration::finish(&vm, &paths, &bus, true, true).await.unwrap();
    migration::confirm(&vm, &paths, &bus, guard, true).await.unwrap();

    let inner = vm.lock().await;
    assert_eq!(inner.state, VmState::Shutoff);
    assert_eq!(inner.reason, StateReason::Migrated2);
}

#[tokio::test]
async fn abort_mid_perform_cancels_instead_of_completing() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("cancelme")).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport.clone());
    let migration_transport = FakeMigrationTransport { listen_port: 49201 };

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(1))
            .await
            .unwrap();
    }

    let (_begin_result, guard) = migration::begin(&vm, true).await.unwrap();
    let guard = guard.unwrap();

    vircore_driver::job::abort_async_job(&vm).await.unwrap();

    let err = migration::perform(&vm, &session, &migration_transport, &guard, "dest.example", 49201)
        .await
        .unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::OperationAborted));
    assert!(
        transport.calls.lock().unwrap().contains(&"migrate_cancel".to_string()),
        "an aborted perform must issue migrate_cancel on the monitor session"
    );

    migration::confirm(&vm, &paths, &bus, guard, false).await.unwrap();
    let inner = vm.lock().await;
    assert_eq!(inner.state, VmState::Running, "a cancelled migration must resume the source VM");
}

#[tokio::test]
async fn begin_rejects_an_inactive_vm() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("idle")).await.unwrap();
    let err = migration::begin(&vm, false).await.unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::OperationInvalid(_)));
}
