//! External snapshot create/pivot/delete coverage (§4.7, §8).

mod common;

use std::sync::Arc;

use vircore_driver::lifecycle;
use vircore_driver::registry::DomainRegistry;
use vircore_driver::snapshot::{self, ExternalTarget, SnapshotRequest};
use vircore_driver::testutil::FakeMonitorTransport;
use vircore_driver::types::{SnapshotDeleteMode, SnapshotKind, StateReason, VmState};

#[tokio::test]
async fn two_disk_external_snapshot_uses_a_transaction() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain_with_disks("twindisk", &["vda", "vdb"]))
        .await
        .unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let binder = common::binder();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport.clone());

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(1))
            .await
            .unwrap();
    }

    let overlay_a = tmp.path().join("vda-snap1.qcow2").to_string_lossy().into_owned();
    let overlay_b = tmp.path().join("vdb-snap1.qcow2").to_string_lossy().into_owned();
    let req = SnapshotRequest {
        name: "snap1".to_string(),
        kind: SnapshotKind::External,
        targets: vec![
            ExternalTarget { disk_id: "vda".to_string(), overlay_path: overlay_a.clone(), reuse_existing: false },
            ExternalTarget { disk_id: "vdb".to_string(), overlay_path: overlay_b.clone(), reuse_existing: false },
        ],
        quiesce: false,
        memory_file: None,
        live: true,
        supports_transaction: true,
    };

    snapshot::create_external(&vm, &session, &binder, None, &paths, &bus, req)
        .await
        .unwrap();

    assert_eq!(
        transport.calls.lock().unwrap().as_slice(),
        &["transaction".to_string()],
        "two disk targets with transaction support must issue one transaction call, not two disk_snapshot calls"
    );

    let inner = vm.lock().await;
    assert!(inner.snapshots.nodes.contains_key("snap1"));
    let vda = inner.def.disks.iter().find(|d| d.id == "vda").unwrap();
    assert_eq!(vda.path, overlay_a);
    assert_eq!(vda.backing_file.as_deref(), Some("/var/lib/vircore/disks/vda.qcow2"));
}

#[tokio::test]
async fn pivot_without_active_block_copy_is_rejected() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain_with_disks("nopivot", &["vda"]))
        .await
        .unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);

    let err = snapshot::pivot(&vm, &session, &paths, &bus, "vda").await.unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::OperationInvalid(_)));
}

#[tokio::test]
async fn live_block_copy_then_pivot_moves_disk_onto_mirror() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain_with_disks("t5", &["disk0"]))
        .await
        .unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(1))
            .await
            .unwrap();
    }

    snapshot::start_block_copy(&vm, &session, "disk0", "/tmp/mirror.qcow2")
        .await
        .unwrap();
    snapshot::pivot(&vm, &session, &paths, &bus, "disk0").await.unwrap();

    let inner = vm.lock().await;
    let disk0 = inner.def.disks.iter().find(|d| d.id == "disk0").unwrap();
    assert_eq!(disk0.path, "/tmp/mirror.qcow2");
    assert!(!inner.block_copy_active.contains("disk0"), "mirror state must be cleared after pivot");
    assert_eq!(inner.state, VmState::Running, "pivot must leave the VM running");
}

#[tokio::test]
async fn metadata_only_delete_reparents_children() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("tree")).await.unwrap();

    {
        let mut inner = vm.lock().await;
        inner.snapshots.insert_root(vircore_driver::vm::SnapshotNode {
            name: "root".to_string(),
            parent: None,
            children: Vec::new(),
            kind: SnapshotKind::Internal,
            state_at_creation: VmState::Shutoff,
            overlay_paths: Default::default(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
        inner.snapshots.insert_child(vircore_driver::vm::SnapshotNode {
            name: "mid".to_string(),
            parent: Some("root".to_string()),
            children: Vec::new(),
            kind: SnapshotKind::Internal,
            state_at_creation: VmState::Shutoff,
            overlay_paths: Default::default(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
        inner.snapshots.insert_child(vircore_driver::vm::SnapshotNode {
            name: "leaf".to_string(),
            parent: Some("mid".to_string()),
            children: Vec::new(),
            kind: SnapshotKind::Internal,
            state_at_creation: VmState::Shutoff,
            overlay_paths: Default::default(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
    }

    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);
    snapshot::delete(&vm, &session, "mid", SnapshotDeleteMode::MetadataOnly).await.unwrap();

    let inner = vm.lock().await;
    assert!(!inner.snapshots.nodes.contains_key("mid"));
    let root = inner.snapshots.nodes.get("root").unwrap();
    assert_eq!(root.children, vec!["leaf".to_string()], "leaf must be reparented onto root");
    let leaf = inner.snapshots.nodes.get("leaf").unwrap();
    assert_eq!(leaf.parent.as_deref(), Some("root"));
}

#[tokio::test]
async fn full_delete_of_external_snapshot_is_unsupported() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("extdel")).await.unwrap();

    {
        let mut inner = vm.lock().await;
        inner.snapshots.insert_root(vircore_driver::vm::SnapshotNode {
            name: "ext1".to_string(),
            parent: None,
            children: Vec::new(),
            kind: SnapshotKind::External,
            state_at_creation: VmState::Shutoff,
            overlay_paths: Default::default(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
    }

    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);
    let err = snapshot::delete(&vm, &session, "ext1", SnapshotDeleteMode::Full).await.unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::OperationUnsupported(_)));
}

#[tokio::test]
async fn full_delete_of_internal_snapshot_reparents_and_calls_monitor() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("inttree")).await.unwrap();

    {
        let mut inner = vm.lock().await;
        inner.snapshots.insert_root(vircore_driver::vm::SnapshotNode {
            name: "root".to_string(),
            parent: None,
            children: Vec::new(),
            kind: SnapshotKind::Internal,
            state_at_creation: VmState::Shutoff,
            overlay_paths: Default::default(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
        inner.snapshots.insert_child(vircore_driver::vm::SnapshotNode {
            name: "mid".to_string(),
            parent: Some("root".to_string()),
            children: Vec::new(),
            kind: SnapshotKind::Internal,
            state_at_creation: VmState::Shutoff,
            overlay_paths: Default::default(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
        inner.snapshots.insert_child(vircore_driver::vm::SnapshotNode {
            name: "leaf".to_string(),
            parent: Some("mid".to_string()),
            children: Vec::new(),
            kind: SnapshotKind::Internal,
            state_at_creation: VmState::Shutoff,
            overlay_paths: Default::default(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
    }

    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport.clone());
    snapshot::delete(&vm, &session, "mid", SnapshotDeleteMode::Full).await.unwrap();

    let inner = vm.lock().await;
    assert!(!inner.snapshots.nodes.contains_key("mid"), "deleted node must be gone");
    assert!(
        inner.snapshots.nodes.contains_key("leaf"),
        "full delete must reparent mid's child, not delete the whole subtree"
    );
    let root = inner.snapshots.nodes.get("root").unwrap();
    assert_eq!(root.children, vec!["leaf".to_string()], "leaf must be reparented onto root");
    assert_eq!(
        transport.calls.lock().unwrap().as_slice(),
        &["snapshot_delete".to_string()],
        "full delete of an internal snapshot must invoke the format-native deletion"
    );
}

#[tokio::test]
async fn revert_of_inactive_vm_applies_per_disk_format_native_revert_and_force_run() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain_with_disks("revtarget", &["vda", "vdb"]))
        .await
        .unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport.clone());

    {
        let mut inner = vm.lock().await;
        inner.snapshots.insert_root(vircore_driver::vm::SnapshotNode {
            name: "snap0".to_string(),
            parent: None,
            children: Vec::new(),
            kind: SnapshotKind::Internal,
            state_at_creation: VmState::Shutoff,
            overlay_paths: Default::default(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });
    }

    snapshot::revert(&vm, &session, &paths, &bus, "snap0", true, false)
        .await
        .unwrap();

    assert_eq!(
        transport.calls.lock().unwrap().as_slice(),
        &["snapshot_revert".to_string(), "snapshot_revert".to_string()],
        "inactive revert must invoke the format-native revert once per disk"
    );
    let inner = vm.lock().await;
    assert_eq!(inner.state, VmState::Running, "force_run must override the shutoff state captured at creation");
    assert_eq!(inner.snapshots.current.as_deref(), Some("snap0"));
}

#[tokio::test]
async fn revert_rejects_conflicting_force_flags() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("revconflict")).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);

    let err = snapshot::revert(&vm, &session, &paths, &bus, "nonexistent", true, true)
        .await
        .unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::InvalidArgument(_)));
}
