//! Error types for the driver core.
//!
//! Mirrors the error-kind list in the specification's error handling
//! design: each API-visible failure mode gets its own variant so callers
//! can match on `kind()` without parsing messages.

use thiserror::Error;

/// Errors surfaced at the driver's API boundary.
#[derive(Error, Debug)]
pub enum DriverError {
    /// No VM with the given name/UUID/id exists in the registry.
    #[error("no such domain: {0}")]
    NoSuchDomain(String),

    /// No snapshot with the given name exists in the VM's snapshot tree.
    #[error("no such snapshot: {0}")]
    NoSuchSnapshot(String),

    /// The requested transition or operation is not valid in the VM's
    /// current state (wrong job phase, wrong lifecycle state, etc).
    #[error("operation invalid: {0}")]
    OperationInvalid(String),

    /// The backend or configuration does not support the requested
    /// feature at all (as opposed to just not right now).
    #[error("operation unsupported: {0}")]
    OperationUnsupported(String),

    /// A sync-job acquisition or monitor round-trip exceeded its deadline.
    #[error("operation timed out")]
    OperationTimedOut,

    /// An async job was cancelled via abort-job.
    #[error("operation aborted")]
    OperationAborted,

    /// Generic operation failure with a human-readable cause.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A caller-supplied argument was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A caller-supplied argument is recognized but not supported in
    /// this configuration (e.g. `device='lun'` hot-plug).
    #[error("argument unsupported: {0}")]
    ArgumentUnsupported(String),

    /// A counter or size computation would overflow its representation.
    #[error("overflow")]
    Overflow,

    /// `add()` was called with a name or UUID already present in the
    /// registry and no merge policy was supplied.
    #[error("conflicting definition: {0}")]
    ConflictingDefinition(String),

    /// A persisted record referenced metadata that is missing on disk.
    #[error("domain metadata missing: {0}")]
    DomainMetadataMissing(String),

    /// The control-socket session failed or timed out.
    #[error("monitor I/O error: {0}")]
    MonitorIO(String),

    /// The guest agent transport did not respond in time.
    #[error("guest agent unresponsive")]
    AgentUnresponsive,

    /// A disk has an active block-copy job; the requested operation
    /// conflicts with it.
    #[error("block copy already active")]
    BlockCopyActive,

    /// A save image's header magic is `IMAGE_PARTIAL`.
    #[error("save image incomplete")]
    SaveImageIncomplete,

    /// A save image's header failed validation (bad magic, zero
    /// `xml_len`, unreadable XML region, version too new after a
    /// byte-swap retry).
    #[error("save image corrupt: {0}")]
    SaveImageCorrupt(String),

    /// A configuration value is structurally valid but not supported by
    /// this driver build.
    #[error("configuration unsupported: {0}")]
    ConfigUnsupported(String),

    /// An invariant the driver relies on was violated; always a bug.
    #[error("internal error: {0}")]
    InternalError(String),

    /// Allocation failure.
    #[error("out of memory")]
    OutOfMemory,

    /// A syscall-adjacent operation failed; carries the OS error.
    #[error("system error: {0}")]
    SystemError(#[from] std::io::Error),
}

/// Result type alias used throughout the driver core.
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// Short, stable kind name for logging/metrics, independent of the
    /// interpolated message text.
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::NoSuchDomain(_) => "NoSuchDomain",
            DriverError::NoSuchSnapshot(_) => "NoSuchSnapshot",
            DriverError::OperationInvalid(_) => "OperationInvalid",
            DriverError::OperationUnsupported(_) => "OperationUnsupported",
            DriverError::OperationTimedOut => "OperationTimedOut",
            DriverError::OperationAborted => "OperationAborted",
            DriverError::OperationFailed(_) => "OperationFailed",
            DriverError::InvalidArgument(_) => "InvalidArgument",
            DriverError::ArgumentUnsupported(_) => "ArgumentUnsupported",
            DriverError::Overflow => "Overflow",
            DriverError::ConflictingDefinition(_) => "ConflictingDefinition",
            DriverError::DomainMetadataMissing(_) => "DomainMetadataMissing",
            DriverError::MonitorIO(_) => "MonitorIO",
            DriverError::AgentUnresponsive => "AgentUnresponsive",
            DriverError::BlockCopyActive => "BlockCopyActive",
            DriverError::SaveImageIncomplete => "SaveImageIncomplete",
            DriverError::SaveImageCorrupt(_) => "SaveImageCorrupt",
            DriverError::ConfigUnsupported(_) => "ConfigUnsupported",
            DriverError::InternalError(_) => "InternalError",
            DriverError::OutOfMemory => "OutOfMemory",
            DriverError::SystemError(_) => "SystemError",
        }
    }
}
