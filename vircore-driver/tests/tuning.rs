//! Hot-plug and memory-tuning boundary behaviors (§8).

mod common;

use std::sync::Arc;

use vircore_driver::lifecycle;
use vircore_driver::registry::DomainRegistry;
use vircore_driver::testutil::{FakeHotplugHelper, FakeMonitorTransport};
use vircore_driver::tuning;
use vircore_driver::types::{DiskBus, DiskConfig, DiskDevice, StateReason, VmState};

#[tokio::test]
async fn usb_lun_hotplug_is_rejected_without_host_support() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("no-usb-lun")).await.unwrap();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);
    let binder = common::binder();
    let hotplug = FakeHotplugHelper { usb_lun_supported: false };

    let disk = DiskConfig {
        bus: DiskBus::Usb,
        device: DiskDevice::Lun,
        ..Default::default()
    };

    let err = tuning::attach_disk(&vm, &session, &binder, &hotplug, disk).await.unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::ConfigUnsupported(_)));
}

#[tokio::test]
async fn usb_lun_hotplug_succeeds_when_host_reports_support() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("has-usb-lun")).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);
    let binder = common::binder();
    let hotplug = FakeHotplugHelper { usb_lun_supported: true };

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(1))
            .await
            .unwrap();
    }

    let disk = DiskConfig {
        id: "lun0".to_string(),
        path: "/var/lib/vircore/disks/lun0.raw".to_string(),
        bus: DiskBus::Usb,
        device: DiskDevice::Lun,
        ..Default::default()
    };

    tuning::attach_disk(&vm, &session, &binder, &hotplug, disk).await.unwrap();
    let inner = vm.lock().await;
    assert!(inner.def.disks.iter().any(|d| d.id == "lun0"));
}

#[tokio::test]
async fn non_usb_lun_hotplug_is_unaffected_by_missing_support() {
    let registry = DomainRegistry::new();
    let vm = common::registered(&registry, common::domain("virtio-disk")).await.unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let paths = common::paths(&tmp);
    paths.create_all().await.unwrap();
    let bus = common::events();
    let transport = Arc::new(FakeMonitorTransport::new());
    let session = common::session(transport);
    let binder = common::binder();
    let hotplug = FakeHotplugHelper { usb_lun_supported: false };

    {
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, &paths, &bus, VmState::Running, StateReason::Booted, Some(1))
            .await
            .unwrap();
    }

    let disk = DiskConfig {
        id: "vda".to_string(),
        path: "/var/lib/vircore/disks/vda.qcow2".to_string(),
        ..Default::default()
    };

    tuning::attach_disk(&vm, &session, &binder, &hotplug, disk).await.unwrap();
}

#[tokio::test]
async fn set_memory_above_max_is_rejected() {
    let registry = DomainRegistry::new();
    let mut def = common::domain("tight-memory");
    def.memory.size_mib = 1024;
    def.memory.max_mib = 2048;
    let vm = registry.add(def, true).await.unwrap();
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

    let err = tuning::set_memory(&vm, &session, 4096).await.unwrap_err();
    assert!(matches!(err, vircore_driver::DriverError::InvalidArgument(_)));
}

#[tokio::test]
async fn set_memory_within_max_is_applied() {
    let registry = DomainRegistry::new();
    let mut def = common::domain("roomy-memory");
    def.memory.size_mib = 1024;
    def.memory.max_mib = 4096;
    let vm = registry.add(def, true).await.unwrap();
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

    tuning::set_memory(&vm, &session, 2048).await.unwrap();
    assert_eq!(vm.lock().await.def.memory.size_mib, 2048);
}
