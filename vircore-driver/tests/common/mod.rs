//! Shared fixtures for the integration test suite.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;
use vircore_driver::error::Result;
use vircore_driver::events::EventBus;
use vircore_driver::monitor::MonitorSession;
use vircore_driver::paths::StatePaths;
use vircore_driver::registry::DomainRegistry;
use vircore_driver::resource::ResourceBinder;
use vircore_driver::testutil::{
    FakeCgroupController, FakeLeaseManager, FakeMonitorTransport, FakeSecurityManager,
};
use vircore_driver::types::{DiskConfig, DomainDefinition};
use vircore_driver::vm::Vm;

pub fn domain(name: &str) -> DomainDefinition {
    DomainDefinition::new(name).with_uuid(Uuid::new_v4())
}

pub fn domain_with_disks(name: &str, disk_ids: &[&str]) -> DomainDefinition {
    let mut def = domain(name);
    for id in disk_ids {
        def = def.with_disk(DiskConfig {
            id: id.to_string(),
            path: format!("/var/lib/vircore/disks/{id}.qcow2"),
            ..DiskConfig::default()
        });
    }
    def
}

pub fn paths(tmp: &tempfile::TempDir) -> StatePaths {
    StatePaths::under(tmp.path())
}

pub fn events() -> EventBus {
    EventBus::new(64, 4, |work| {
        Box::pin(async move {
            let _ = work;
            Ok(())
        })
    })
}

pub fn binder() -> ResourceBinder {
    ResourceBinder::new(
        Arc::new(FakeLeaseManager::default()),
        Arc::new(FakeCgroupController::default()),
        vec![Arc::new(FakeSecurityManager::default())],
    )
}

pub fn session(transport: Arc<FakeMonitorTransport>) -> MonitorSession {
    MonitorSession::new(transport, Duration::from_secs(5))
}

pub async fn registered(registry: &DomainRegistry, def: DomainDefinition) -> Result<Arc<Vm>> {
    registry.add(def, true).await
}
