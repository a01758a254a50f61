//! Trait boundaries for the collaborators the specification marks as
//! out of scope (§1): XML parse/format, the control-socket wire codec,
//! cgroup/security-label mechanisms, the guest-agent transport, the
//! PCI/USB hot-plug helpers and the migration wire protocol. The core
//! depends only on these traits; production deployments supply real
//! implementations, tests use the fakes in [`crate::testutil`].
//!
//! Grounded in the teacher's one-trait-per-pluggable-mechanism pattern
//! (`storage::traits::StorageBackend`): each mechanism gets a small
//! `#[async_trait] Send + Sync` trait rather than a god-object.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::types::DomainDefinition;

/// Renders a [`DomainDefinition`] to/from the XML dialect a deployment's
/// hypervisor expects. XML schemas themselves are out of scope (§1
/// Non-goals); the core only ever needs to round-trip its own typed
/// fields through this seam.
pub trait XmlCodec: Send + Sync {
    fn render(&self, def: &DomainDefinition) -> Result<String>;
    fn parse(&self, xml: &str) -> Result<DomainDefinition>;
}

/// A single control-socket request as the core issues it. The wire
/// framing (line-oriented text vs newline-delimited JSON, §6) is the
/// transport's concern; the core only ever sees verb + arguments in,
/// a JSON value out.
#[derive(Debug, Clone)]
pub struct MonitorCommand {
    pub verb: String,
    pub args: serde_json::Value,
}

impl MonitorCommand {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

/// The framed request/response transport to a single hypervisor
/// process's control socket (§4.4, §6). One outstanding request at a
/// time; the job coordinator's enter/exit-monitor discipline is what
/// enforces that from the caller's side.
#[async_trait]
pub trait MonitorTransport: Send + Sync {
    /// Issue `cmd` and wait for its reply. Must return `Err(MonitorIO)`
    /// on transport failure or reply timeout (§4.4 failure semantics).
    async fn request(&self, cmd: MonitorCommand) -> Result<serde_json::Value>;

    /// True while the underlying connection is still usable.
    async fn is_alive(&self) -> bool;

    /// Best-effort close; does not itself fail callers still holding a
    /// reference.
    async fn close(&self);
}

/// Lock-manager lease over a single disk-chain file element (§4.5,
/// glossary "Lease"). `shared` requests a read lease (used for backing
/// elements shared across snapshots); otherwise exclusive.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    async fn acquire(&self, path: &str, shared: bool) -> Result<()>;
    async fn release(&self, path: &str) -> Result<()>;
}

/// Device cgroup controller (§4.5). `allow`/`deny` toggle the device
/// major/minor permission bit for a disk file; the cgroup mechanism
/// itself is out of scope (§1 Non-goals).
#[async_trait]
pub trait CgroupController: Send + Sync {
    async fn allow_device(&self, vm_name: &str, path: &str, writable: bool) -> Result<()>;
    async fn deny_device(&self, vm_name: &str, path: &str) -> Result<()>;
}

/// Security label manager (§4.5). Mirrors a stacked list of models in
/// the specification's driver context; this trait represents one
/// model in that stack.
#[async_trait]
pub trait SecurityManager: Send + Sync {
    async fn label(&self, vm_name: &str, path: &str) -> Result<()>;
    async fn restore_label(&self, path: &str) -> Result<()>;
}

/// Guest-agent transport handle (§1, glossary). Used only by the
/// snapshot engine's quiesce/thaw step (§4.7) and by managed-save's
/// analog in other drivers; the transport and wire protocol are out of
/// scope.
#[async_trait]
pub trait GuestAgentHandle: Send + Sync {
    async fn freeze_filesystems(&self) -> Result<()>;
    async fn thaw_filesystems(&self) -> Result<()>;
    async fn is_responsive(&self) -> bool;
}

/// PCI/USB hot-plug helper (§1). The core only needs to know whether a
/// requested hot-plug shape is supported on this host before it issues
/// the corresponding monitor command; the helper's internal device
/// enumeration is out of scope.
pub trait HotplugHelper: Send + Sync {
    fn supports_usb_lun(&self) -> bool {
        false
    }
}

/// Migration wire-protocol transport (§4.8). The V2/V3 handshake
/// itself is sketched only as the state transitions it induces (§1);
/// this trait is the seam the orchestrator drives those transitions
/// through.
#[async_trait]
pub trait MigrationTransport: Send + Sync {
    /// Destination: start listening for an incoming migration stream
    /// and return the port it bound.
    async fn listen(&self) -> Result<u16>;

    /// Source: connect to `host:port` and return an opaque connection
    /// token used by subsequent `send_cookie`/`close` calls.
    async fn connect(&self, host: &str, port: u16) -> Result<String>;

    async fn close(&self, token: &str) -> Result<()>;
}

/// Opaque, length-prefixed capability/state blob exchanged between
/// migration peers (§4.8 "Cookies"). V2 carries none; V3 uses this to
/// negotiate capabilities and carry post-migration state.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MigrationCookie {
    pub fields: HashMap<String, String>,
}

impl MigrationCookie {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::error::DriverError::InvalidArgument(e.to_string()))
    }
}
