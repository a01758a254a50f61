//! Registry identity rules and event bus fan-out (§4.1, §4.9).

mod common;

use vircore_driver::lifecycle;
use vircore_driver::registry::DomainRegistry;
use vircore_driver::types::{StateReason, VmState};

#[tokio::test]
async fn add_rejects_a_duplicate_name() {
    let registry = DomainRegistry::new();
    let mut def_a = common::domain("dup");
    let def_b = common::domain("dup");
    def_a.name = "dup".to_string();

    registry.add(def_a, true).await.unwrap();
    let err = registry.add(def_b, true).await.unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::ConflictingDefinition(_)));
}

#[tokio::test]
async fn add_rejects_a_duplicate_uuid() {
    let registry = DomainRegistry::new();
    let def_a = common::domain("first");
    let mut def_b = common::domain("second");
    def_b.uuid = def_a.uuid;

    registry.add(def_a, true).await.unwrap();
    let err = registry.add(def_b, true).await.unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::ConflictingDefinition(_)));
}

#[tokio::test]
async fn lookup_by_id_only_matches_active_vms() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("findable")).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();

    assert!(registry.find_by_id(5).await.is_err());

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(5))
            .await
            .unwrap();
    }

    let found = registry.find_by_id(5).await.unwrap();
    assert_eq!(found.uuid, vm.uuid);
}

#[tokio::test]
async fn events_from_two_vms_each_keep_their_own_sequence() {
    let bus = common::events();
    let mut rx = bus.subscribe();

    let vm_a = uuid::Uuid::new_v4();
    let vm_b = uuid::Uuid::new_v4();

    bus.emit(vm_a, "a", vircore_driver::events::EventKind::Started, StateReason::Booted);
    bus.emit(vm_b, "b", vircore_driver::events::EventKind::Started, StateReason::Booted);
    bus.emit(vm_a, "a", vircore_driver::events::EventKind::Stopped, StateReason::Destroyed);

    let e1 = rx.recv().await.unwrap();
    let e2 = rx.recv().await.unwrap();
    let e3 = rx.recv().await.unwrap();

    assert_eq!((e1.vm_uuid, e1.seq), (vm_a, 0));
    assert_eq!((e2.vm_uuid, e2.seq), (vm_b, 0));
    assert_eq!((e3.vm_uuid, e3.seq), (vm_a, 1));
}
