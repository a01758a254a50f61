//! End-to-end coverage of the job coordinator and lifecycle state
//! machine: sync-job mutual exclusion, async-job masking/abort, and the
//! paused-start dual-event ordering guarantee.

mod common;

use std::time::Duration;

use vircore_driver::events::EventKind;
use vircore_driver::job::{begin_async_job, begin_sync_job};
use vircore_driver::lifecycle;
use vircore_driver::registry::DomainRegistry;
use vircore_driver::types::{AsyncJobKind, JobKind, StateReason, VmState};

#[tokio::test]
async fn sync_jobs_serialize_and_release_on_drop() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("alpha")).await.unwrap();

    let first = begin_sync_job(&vm, JobKind::Query, Some(Duration::from_millis(200)))
        .await
        .unwrap();

    // A second sync job must block while the first is held; prove it by
    // racing a short deadline against the still-held guard.
    let blocked = begin_sync_job(&vm, JobKind::Modify, Some(Duration::from_millis(50))).await;
    assert!(blocked.is_err(), "second sync job should not admit while the first is held");

    drop(first);

    // Once dropped, a fresh sync job must be admitted immediately.
    let second = begin_sync_job(&vm, JobKind::Modify, Some(Duration::from_millis(200))).await;
    assert!(second.is_ok());
}

#[tokio::test]
async fn async_job_mask_permits_query_but_not_destroy() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("beta")).await.unwrap();

    let async_guard = begin_async_job(&vm, AsyncJobKind::Save).await.unwrap();

    // Save's default mask permits Query/Abort/MigrationOp/Suspend but
    // not Destroy or Modify.
    let query = begin_sync_job(&vm, JobKind::Query, Some(Duration::from_millis(100))).await;
    assert!(query.is_ok(), "masked sync job kind should interleave with an active async job");

    let destroy = begin_sync_job(&vm, JobKind::Destroy, Some(Duration::from_millis(50))).await;
    assert!(destroy.is_err(), "unmasked sync job kind must not interleave");

    async_guard.end().await;

    let destroy_after = begin_sync_job(&vm, JobKind::Destroy, Some(Duration::from_millis(100))).await;
    assert!(destroy_after.is_ok(), "destroy should admit once the async job has ended");
}

#[tokio::test]
async fn migration_out_blocks_modify_and_destroy_but_not_query() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("zeta")).await.unwrap();

    let async_guard = begin_async_job(&vm, AsyncJobKind::MigrationOut).await.unwrap();

    let modify = begin_sync_job(&vm, JobKind::Modify, Some(Duration::from_millis(50))).await;
    assert!(modify.is_err(), "modify must not interleave with an active migration-out job");

    let destroy = begin_sync_job(&vm, JobKind::Destroy, Some(Duration::from_millis(50))).await;
    assert!(destroy.is_err(), "destroy must not interleave with an active migration-out job");

    let query = begin_sync_job(&vm, JobKind::Query, Some(Duration::from_millis(100))).await;
    assert!(query.is_ok(), "query must still interleave during migration-out");

    async_guard.end().await;
}

#[tokio::test]
async fn async_job_abort_flag_is_shared_with_the_guard() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("gamma")).await.unwrap();

    let guard = begin_async_job(&vm, AsyncJobKind::MigrationOut).await.unwrap();
    assert!(!guard.aborted());

    vircore_driver::job::abort_async_job(&vm).await.unwrap();
    assert!(guard.aborted(), "abort_async_job must flip the same flag the guard reads");

    guard.end().await;
}

#[tokio::test]
async fn boot_to_paused_emits_started_then_suspended_in_order() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("delta")).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();

    let mut rx = bus.subscribe();

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Paused, StateReason::Booted, Some(1))
            .await
            .unwrap();
    }

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.kind, EventKind::Started);
    assert_eq!(second.kind, EventKind::Suspended);
    assert!(second.seq > first.seq);
}

#[tokio::test]
async fn destroy_of_transient_vm_signals_removal_on_shutoff() {
    let registry = DomainRegistry::new();
    let def = common::domain("ephemeral");
    let vm = registry.add(def, false).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(7))
            .await
            .unwrap();
    }

    let outcome = {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Shutoff, StateReason::Destroyed, None)
            .await
            .unwrap()
    };

    assert!(outcome.should_remove, "a non-persistent VM reaching shutoff must be flagged for removal");
    registry.remove(vm.uuid).await.unwrap();
    assert!(registry.find_by_uuid(vm.uuid).await.is_err());
}

#[tokio::test]
async fn resume_from_pmsuspended_is_rejected() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("epsilon")).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(3))
            .await
            .unwrap();
        lifecycle::transition(&mut inner, &paths, &bus, VmState::PmSuspended, StateReason::Unknown, None)
            .await
            .unwrap();
    }

    let mut inner = vm.lock().await;
    let err = lifecycle::transition(&mut inner, &paths, &bus, VmState::Paused, StateReason::PausedByUser, None)
        .await
        .unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::OperationInvalid(_)));
}
