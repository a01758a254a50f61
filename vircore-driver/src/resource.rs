//! Resource binder (C5, §4.5).
//!
//! Binds a disk-chain element to a running VM through three
//! collaborators, in a fixed order (lease, cgroup, security label);
//! release runs the reverse order. Any failure partway through rolls
//! back only the steps already completed, leaving the file exactly as
//! it was found — the compensating-action-list pattern the
//! specification calls for in place of `goto cleanup` (§9).

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::error::Result;
use crate::interfaces::{CgroupController, LeaseManager, SecurityManager};
use crate::types::BindMode;

/// Fans a `prepare()` call out across the configured collaborator
/// stack. Grounded in the teacher's `storage::traits::StorageBackend`
/// fan-out manager shape (one struct holding `Arc<dyn Trait>` handles,
/// iterating the stack rather than hard-coding one implementation).
pub struct ResourceBinder {
    lease: Arc<dyn LeaseManager>,
    cgroup: Arc<dyn CgroupController>,
    security: Vec<Arc<dyn SecurityManager>>,
}

impl ResourceBinder {
    pub fn new(
        lease: Arc<dyn LeaseManager>,
        cgroup: Arc<dyn CgroupController>,
        security: Vec<Arc<dyn SecurityManager>>,
    ) -> Self {
        Self { lease, cgroup, security }
    }

    /// Bind or release `file` for `vm_name` depending on `mode`
    /// (§4.5: "exposes `prepare(disk, file, mode)` which both acquires
    /// ... and releases ... using the same code path").
    #[instrument(skip(self), fields(%vm_name, %file))]
    pub async fn prepare(&self, vm_name: &str, file: &str, mode: BindMode) -> Result<()> {
        match mode {
            BindMode::None => self.release(vm_name, file).await,
            BindMode::ReadOnly => self.acquire(vm_name, file, false).await,
            BindMode::ReadWrite => self.acquire(vm_name, file, true).await,
        }
    }

    async fn acquire(&self, vm_name: &str, file: &str, writable: bool) -> Result<()> {
        let mut completed: Vec<CompletedStep> = Vec::new();

        if let Err(e) = self.lease.acquire(file, !writable).await {
            self.rollback(vm_name, file, &completed).await;
            return Err(e);
        }
        completed.push(CompletedStep::Lease);

        if let Err(e) = self.cgroup.allow_device(vm_name, file, writable).await {
            self.rollback(vm_name, file, &completed).await;
            return Err(e);
        }
        completed.push(CompletedStep::Cgroup);

        for security in &self.security {
            if let Err(e) = security.label(vm_name, file).await {
                self.rollback(vm_name, file, &completed).await;
                return Err(e);
            }
        }
        completed.push(CompletedStep::Security);

        Ok(())
    }

    async fn release(&self, vm_name: &str, file: &str) -> Result<()> {
        for security in self.security.iter().rev() {
            if let Err(e) = security.restore_label(file).await {
                warn!(error = %e, "failed to restore security label during release");
            }
        }
        if let Err(e) = self.cgroup.deny_device(vm_name, file).await {
            warn!(error = %e, "failed to deny device during release");
        }
        if let Err(e) = self.lease.release(file).await {
            warn!(error = %e, "failed to release lease");
        }
        Ok(())
    }

    async fn rollback(&self, vm_name: &str, file: &str, completed: &[CompletedStep]) {
        for step in completed.iter().rev() {
            match step {
                CompletedStep::Security => {
                    for security in self.security.iter().rev() {
                        let _ = security.restore_label(file).await;
                    }
                }
                CompletedStep::Cgroup => {
                    let _ = self.cgroup.deny_device(vm_name, file).await;
                }
                CompletedStep::Lease => {
                    let _ = self.lease.release(file).await;
                }
            }
        }
    }
}

enum CompletedStep {
    Lease,
    Cgroup,
    Security,
}
