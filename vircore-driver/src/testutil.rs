//! In-memory fakes for every collaborator trait in
//! [`crate::interfaces`], analogous to the teacher's `MockBackend`
//! (`mock.rs`). Exercises the job/lifecycle/save/snapshot/migration
//! machinery in tests without a real hypervisor process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DriverError, Result};
use crate::interfaces::{
    CgroupController, GuestAgentHandle, HotplugHelper, LeaseManager, MigrationTransport,
    MonitorCommand, MonitorTransport, SecurityManager, XmlCodec,
};
use crate::types::DomainDefinition;

/// Round-trips a `DomainDefinition` through JSON rather than any real
/// XML dialect — sufficient for exercising the core's own logic, since
/// the actual schema is out of scope (§1 Non-goals).
pub struct JsonXmlCodec;

impl XmlCodec for JsonXmlCodec {
    fn render(&self, def: &DomainDefinition) -> Result<String> {
        serde_json::to_string_pretty(def)
            .map_err(|e| DriverError::InternalError(format!("render: {e}")))
    }

    fn parse(&self, xml: &str) -> Result<DomainDefinition> {
        serde_json::from_str(xml).map_err(|e| DriverError::InvalidArgument(format!("parse: {e}")))
    }
}

/// Scriptable fake monitor transport: callers push `(verb, Value)`
/// responses ahead of time via [`FakeMonitorTransport::expect`].
#[derive(Default)]
pub struct FakeMonitorTransport {
    responses: StdMutex<std::collections::VecDeque<Result<Value>>>,
    alive: AtomicBool,
    pub calls: StdMutex<Vec<String>>,
}

impl FakeMonitorTransport {
    pub fn new() -> Self {
        Self {
            responses: StdMutex::new(Default::default()),
            alive: AtomicBool::new(true),
            calls: StdMutex::new(Vec::new()),
        }
    }

    pub fn expect_ok(&self, value: Value) {
        self.responses.lock().unwrap().push_back(Ok(value));
    }

    pub fn expect_err(&self, err: DriverError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }
}

#[async_trait]
impl MonitorTransport for FakeMonitorTransport {
    async fn request(&self, cmd: MonitorCommand) -> Result<Value> {
        self.calls.lock().unwrap().push(cmd.verb.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Value::Null))
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// No-op lease manager; records acquisitions for assertions.
#[derive(Default)]
pub struct FakeLeaseManager {
    pub held: StdMutex<HashSet<String>>,
}

#[async_trait]
impl LeaseManager for FakeLeaseManager {
    async fn acquire(&self, path: &str, _shared: bool) -> Result<()> {
        self.held.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    async fn release(&self, path: &str) -> Result<()> {
        self.held.lock().unwrap().remove(path);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCgroupController {
    pub allowed: StdMutex<HashSet<String>>,
}

#[async_trait]
impl CgroupController for FakeCgroupController {
    async fn allow_device(&self, vm_name: &str, path: &str, _writable: bool) -> Result<()> {
        self.allowed
            .lock()
            .unwrap()
            .insert(format!("{vm_name}:{path}"));
        Ok(())
    }

    async fn deny_device(&self, vm_name: &str, path: &str) -> Result<()> {
        self.allowed
            .lock()
            .unwrap()
            .remove(&format!("{vm_name}:{path}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSecurityManager {
    pub labeled: StdMutex<HashSet<String>>,
}

#[async_trait]
impl SecurityManager for FakeSecurityManager {
    async fn label(&self, _vm_name: &str, path: &str) -> Result<()> {
        self.labeled.lock().unwrap().insert(path.to_string());
        Ok(())
    }

    async fn restore_label(&self, path: &str) -> Result<()> {
        self.labeled.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Always-responsive guest agent fake.
#[derive(Default)]
pub struct FakeGuestAgent {
    pub frozen: AtomicBool,
    pub fail_freeze: bool,
}

#[async_trait]
impl GuestAgentHandle for FakeGuestAgent {
    async fn freeze_filesystems(&self) -> Result<()> {
        if self.fail_freeze {
            return Err(DriverError::AgentUnresponsive);
        }
        self.frozen.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn thaw_filesystems(&self) -> Result<()> {
        self.frozen.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_responsive(&self) -> bool {
        !self.fail_freeze
    }
}

#[derive(Default)]
pub struct FakeHotplugHelper {
    pub usb_lun_supported: bool,
}

impl HotplugHelper for FakeHotplugHelper {
    fn supports_usb_lun(&self) -> bool {
        self.usb_lun_supported
    }
}

/// In-memory migration transport pairing a fixed port with a no-op
/// connect/close.
#[derive(Default)]
pub struct FakeMigrationTransport {
    pub listen_port: u16,
}

#[async_trait]
impl MigrationTransport for FakeMigrationTransport {
    async fn listen(&self) -> Result<u16> {
        Ok(self.listen_port)
    }

    async fn connect(&self, _host: &str, _port: u16) -> Result<String> {
        Ok("fake-token".to_string())
    }

    async fn close(&self, _token: &str) -> Result<()> {
        Ok(())
    }
}
