//! # vircore-driver
//!
//! The core of a host-local hypervisor management driver, modeled on
//! libvirt's qemu driver: a per-VM job coordinator, a VM lifecycle
//! state machine, a persisted save/snapshot engine, and a multi-domain
//! registry with an event bus. Everything this crate depends on beyond
//! that core — XML rendering, the control-socket wire codec, cgroup and
//! security-label mechanisms, the guest-agent transport, PCI/USB
//! hot-plug helpers, and the migration wire protocol — is represented
//! as a trait in [`interfaces`]; a deployment supplies real
//! implementations, and [`testutil`] supplies in-memory fakes for
//! tests.
//!
//! ## Layering
//!
//! ```text
//! context::DriverContext
//!   ├─ registry::DomainRegistry  (C1)  -> vm::Vm
//!   │                                        ├─ job       (C2)
//!   │                                        ├─ lifecycle (C3)
//!   │                                        └─ monitor   (C4)
//!   ├─ resource::ResourceBinder  (C5)
//!   ├─ save / snapshot / migration (C6 / C7 / C8)
//!   └─ events::EventBus          (C9)
//! ```

pub mod capability;
pub mod context;
pub mod error;
pub mod events;
pub mod interfaces;
pub mod job;
pub mod lifecycle;
pub mod migration;
pub mod monitor;
pub mod paths;
pub mod port;
pub mod registry;
pub mod resource;
pub mod save;
pub mod snapshot;
pub mod tuning;
pub mod types;
pub mod vm;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use error::{DriverError, Result};
pub use registry::DomainRegistry;
pub use vm::Vm;
