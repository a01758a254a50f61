//! Domain definition and status types.
//!
//! `DomainDefinition` plays the role the specification calls `def` /
//! `newDef`: a fully-resolved, host-independent description of a VM.
//! Parsing it from (or rendering it to) the actual XML dialect a given
//! deployment uses is out of scope for the core and lives behind
//! [`crate::interfaces::XmlCodec`] — this module only carries the typed
//! fields the core itself needs to reason about (disks for the resource
//! binder, boot/console info for save and snapshot, etc).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// DOMAIN DEFINITION
// =============================================================================

/// A fully-resolved domain definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainDefinition {
    /// Globally unique identifier.
    pub uuid: Uuid,
    /// Name, unique among persistent VMs.
    pub name: String,
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub disks: Vec<DiskConfig>,
    pub nics: Vec<NicConfig>,
    pub cdroms: Vec<CdromConfig>,
    pub boot: BootConfig,
    pub console: ConsoleConfig,
}

impl DomainDefinition {
    /// Create a minimal definition with default hardware sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            cpu: CpuConfig::default(),
            memory: MemoryConfig::default(),
            disks: Vec::new(),
            nics: Vec::new(),
            cdroms: Vec::new(),
            boot: BootConfig::default(),
            console: ConsoleConfig::default(),
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn with_cpu(mut self, cores: u32) -> Self {
        self.cpu.cores = cores;
        self
    }

    pub fn with_memory_mib(mut self, size_mib: u64) -> Self {
        self.memory.size_mib = size_mib;
        self
    }

    pub fn with_disk(mut self, disk: DiskConfig) -> Self {
        self.disks.push(disk);
        self
    }

    pub fn with_nic(mut self, nic: NicConfig) -> Self {
        self.nics.push(nic);
        self
    }

    /// Produce a "migratable" projection: a clone with host-specific
    /// detail stripped, suitable for sending to a migration destination
    /// or embedding in a save image (§4.6 step 3, §4.8 Begin).
    pub fn to_migratable(&self) -> Self {
        let mut clone = self.clone();
        for disk in &mut clone.disks {
            disk.backing_file = None;
        }
        clone.console.vnc_port = None;
        clone.console.spice_port = None;
        clone
    }

    /// Structural comparison of the durable, ABI-relevant fields used by
    /// restore (§4.6 step 2) to check two definitions are equivalent
    /// enough to swap in a replacement XML at restore time.
    pub fn abi_stable_equivalent(&self, other: &DomainDefinition) -> bool {
        self.cpu.total_vcpus() == other.cpu.total_vcpus()
            && self.memory.size_mib == other.memory.size_mib
            && self.disks.len() == other.disks.len()
            && self
                .disks
                .iter()
                .zip(other.disks.iter())
                .all(|(a, b)| a.bus == b.bus && a.id == b.id)
    }
}

/// CPU configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuConfig {
    pub cores: u32,
    pub sockets: u32,
    pub threads_per_core: u32,
    pub model: Option<String>,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            cores: 2,
            sockets: 1,
            threads_per_core: 1,
            model: None,
        }
    }
}

impl CpuConfig {
    pub fn total_vcpus(&self) -> u32 {
        self.cores * self.sockets * self.threads_per_core
    }
}

/// Memory configuration. `size_mib` is the current target; `max_mib`
/// bounds it for the `InvalidArgument` check on memory hot-tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub size_mib: u64,
    pub max_mib: u64,
    pub hugepages: bool,
    pub ballooning: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            size_mib: 2048,
            max_mib: 2048,
            hugepages: false,
            ballooning: true,
        }
    }
}

/// Disk configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub id: String,
    pub path: String,
    pub bus: DiskBus,
    pub format: DiskFormat,
    pub readonly: bool,
    pub device: DiskDevice,
    /// Backing file path, if this element of the chain has one.
    pub backing_file: Option<String>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: String::new(),
            bus: DiskBus::Virtio,
            format: DiskFormat::Qcow2,
            readonly: false,
            device: DiskDevice::Disk,
            backing_file: None,
        }
    }
}

impl DiskConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Device presentation for a disk; `Lun` hot-plug over USB is rejected
/// with `ConfigUnsupported` per the boundary behaviors in §8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
    Lun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Sata,
    Usb,
    Ide,
}

impl DiskBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Usb => "usb",
            DiskBus::Ide => "ide",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
}

/// Network interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicConfig {
    pub id: String,
    pub mac_address: Option<String>,
    pub bridge: Option<String>,
    pub model: NicModel,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mac_address: None,
            bridge: Some("virbr0".to_string()),
            model: NicModel::Virtio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    Virtio,
    E1000,
    Rtl8139,
}

/// CD-ROM configuration (for `change_media`, §8 boundary behaviors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdromConfig {
    pub id: String,
    pub iso_path: Option<String>,
    pub bootable: bool,
}

impl Default for CdromConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            iso_path: None,
            bootable: false,
        }
    }
}

/// Boot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    pub order: Vec<BootDevice>,
    pub firmware: Firmware,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            order: vec![BootDevice::Disk, BootDevice::Cdrom, BootDevice::Network],
            firmware: Firmware::Bios,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Disk,
    Cdrom,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    Bios,
    Uefi,
}

/// Console configuration (port numbers are runtime-assigned via the
/// driver context's port allocator, §4.10 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub vnc_enabled: bool,
    pub vnc_port: Option<u16>,
    pub spice_enabled: bool,
    pub spice_port: Option<u16>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            vnc_enabled: true,
            vnc_port: None,
            spice_enabled: false,
            spice_port: None,
        }
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// VM lifecycle state (§4.3). `Blocked` reflects a running guest that
/// cannot make progress (e.g. I/O error with `stop` on error policy);
/// it is reachable only via a monitor event, never directly requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Shutoff,
    Running,
    Paused,
    Blocked,
    ShutdownInProgress,
    Crashed,
    PmSuspended,
}

impl VmState {
    /// True for any state implying an attached hypervisor process and
    /// control-socket session (the "active" predicate from the glossary).
    pub fn is_active(&self) -> bool {
        !matches!(self, VmState::Shutoff | VmState::Crashed)
    }
}

/// Reason code accompanying a lifecycle state (§4.3, §7 "reason codes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateReason {
    Unknown,
    Booted,
    Migrated,
    Restored,
    FromSnapshot,
    PausedByUser,
    PausedForMigration,
    PausedForSave,
    PausedForSnapshot,
    PausedIoError,
    PausedWatchdog,
    PausedFromSnapshot,
    SuspendedApiError,
    Destroyed,
    Failed,
    Crashed,
    Saved,
    Migrated2,
    ShutdownUser,
}

/// Power state shorthand used by status reporting (coarser than
/// `VmState`; kept for symmetry with the glossary's "active/inactive").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
    Suspended,
    Crashed,
}

impl From<VmState> for PowerState {
    fn from(s: VmState) -> Self {
        match s {
            VmState::Running | VmState::Blocked | VmState::ShutdownInProgress => {
                PowerState::Running
            }
            VmState::Paused => PowerState::Paused,
            VmState::PmSuspended => PowerState::Suspended,
            VmState::Crashed => PowerState::Crashed,
            VmState::Shutoff => PowerState::Stopped,
        }
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// Synchronous job kinds (§3 Job descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    None,
    Query,
    Destroy,
    Suspend,
    Modify,
    Abort,
    MigrationOp,
}

/// Long-running async job kinds (§3 Job descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsyncJobKind {
    None,
    MigrationOut,
    MigrationIn,
    Save,
    Dump,
    Snapshot,
}

/// Progress counters surfaced by `Inquire` (§4.2).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobInfo {
    pub bounded: bool,
    pub data_total: u64,
    pub data_processed: u64,
    pub elapsed_ms: u64,
}

// =============================================================================
// SAVE / SNAPSHOT
// =============================================================================

/// Compression codec used for a save image's memory stream, matching
/// the `compressed` header field's enum values exactly (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Compression {
    Raw = 0,
    Gzip = 1,
    Bzip2 = 2,
    Xz = 3,
    Lzop = 4,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Raw
    }
}

impl Compression {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Compression::Raw),
            1 => Some(Compression::Gzip),
            2 => Some(Compression::Bzip2),
            3 => Some(Compression::Xz),
            4 => Some(Compression::Lzop),
            _ => None,
        }
    }

    /// Argv for the decompressor pipeline used by restore (§4.6 step 3).
    pub fn decompress_command(&self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Compression::Raw => None,
            Compression::Gzip => Some(("gzip", &["-d", "-c"])),
            Compression::Bzip2 => Some(("bzip2", &["-d", "-c"])),
            Compression::Xz => Some(("xz", &["-d", "-c"])),
            Compression::Lzop => Some(("lzop", &["-d", "-c"])),
        }
    }
}

/// Snapshot family (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Internal,
    External,
}

/// Disk bind mode used by the resource binder's `prepare()` (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    None,
    ReadOnly,
    ReadWrite,
}

/// Snapshot deletion policy (§4.7 Delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDeleteMode {
    MetadataOnly,
    Full,
}

/// Basic VM information for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    pub uuid: Uuid,
    pub name: String,
    pub id: i32,
    pub state: VmState,
    pub reason: StateReason,
}

/// Detailed VM status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStatus {
    pub uuid: Uuid,
    pub name: String,
    pub id: i32,
    pub state: VmState,
    pub reason: StateReason,
    pub persistent: bool,
    pub has_managed_save: bool,
    pub cpu_time_ns: u64,
    pub memory_rss_bytes: u64,
    pub memory_max_bytes: u64,
}
