//! Multi-domain registry (C1, §4.1): the name/UUID/id index over every
//! defined or running VM, plus the event bus that fans out lifecycle
//! changes to listeners (the event half lives in [`crate::events`];
//! this module owns the table itself).
//!
//! Lookups take the registry mutex only long enough to clone an
//! `Arc<Vm>` handle out of the index, then drop it — the per-VM mutex is
//! always acquired as a separate step after that, never while the
//! registry mutex is held (§4.1: "Lookups MUST drop this mutex before
//! taking the per-VM mutex").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{DriverError, Result};
use crate::types::DomainDefinition;
use crate::vm::Vm;

#[derive(Default)]
struct Index {
    by_uuid: HashMap<Uuid, Arc<Vm>>,
    by_name: HashMap<String, Uuid>,
    /// Monotonic id allocator for active VMs (§3 glossary "id").
    next_id: i32,
}

/// The registry. Wrapped in `RwLock` rather than a plain `Mutex`: most
/// traffic is lookups (read), definition/undefine churn is comparatively
/// rare (write).
pub struct DomainRegistry {
    index: RwLock<Index>,
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Add a new VM definition (§4.1 Add). Rejects a name or UUID
    /// collision with `ConflictingDefinition` — the specification's
    /// merge-on-redefine policy for an *existing* VM is
    /// [`DomainRegistry::redefine`], a distinct operation.
    #[instrument(skip(self, def))]
    pub async fn add(&self, def: DomainDefinition, persistent: bool) -> Result<Arc<Vm>> {
        let mut index = self.index.write().await;
        if index.by_uuid.contains_key(&def.uuid) {
            return Err(DriverError::ConflictingDefinition(format!(
                "uuid {} already defined",
                def.uuid
            )));
        }
        if index.by_name.contains_key(&def.name) {
            return Err(DriverError::ConflictingDefinition(format!(
                "name {} already defined",
                def.name
            )));
        }
        let uuid = def.uuid;
        let name = def.name.clone();
        let vm = Vm::new(def, persistent);
        index.by_uuid.insert(uuid, vm.clone());
        index.by_name.insert(name, uuid);
        debug!(vm = %uuid, "domain added to registry");
        Ok(vm)
    }

    /// Redefine an existing VM in place (§4.3 Modify transition target):
    /// if inactive, `def` replaces the live definition immediately; if
    /// active, the caller is expected to have staged the update as
    /// `VmInner::new_def` instead and must not call this.
    pub async fn redefine(&self, uuid: Uuid, def: DomainDefinition) -> Result<()> {
        let vm = self.find_by_uuid(uuid).await?;
        let mut inner = vm.lock().await;
        if inner.def.name != def.name {
            let mut index = self.index.write().await;
            index.by_name.remove(&inner.def.name);
            index.by_name.insert(def.name.clone(), uuid);
        }
        inner.def = def;
        Ok(())
    }

    /// Remove a VM from the registry entirely (§4.1 Remove). Callers
    /// must ensure the VM is inactive and has no active job first; this
    /// function does not itself check, since undefine-while-transient
    /// semantics (drop on clean shutdown) are the caller's
    /// responsibility (lifecycle.rs).
    pub async fn remove(&self, uuid: Uuid) -> Result<()> {
        let mut index = self.index.write().await;
        let vm = index
            .by_uuid
            .remove(&uuid)
            .ok_or_else(|| DriverError::NoSuchDomain(uuid.to_string()))?;
        let name = vm.lock().await.def.name.clone();
        index.by_name.remove(&name);
        Ok(())
    }

    pub async fn find_by_uuid(&self, uuid: Uuid) -> Result<Arc<Vm>> {
        let index = self.index.read().await;
        index
            .by_uuid
            .get(&uuid)
            .cloned()
            .ok_or_else(|| DriverError::NoSuchDomain(uuid.to_string()))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Arc<Vm>> {
        let index = self.index.read().await;
        let uuid = index
            .by_name
            .get(name)
            .ok_or_else(|| DriverError::NoSuchDomain(name.to_string()))?;
        index
            .by_uuid
            .get(uuid)
            .cloned()
            .ok_or_else(|| DriverError::NoSuchDomain(name.to_string()))
    }

    /// Find by the transient numeric id assigned while active (§3
    /// glossary). Active-only: an inactive VM never matches any id.
    pub async fn find_by_id(&self, id: i32) -> Result<Arc<Vm>> {
        let index = self.index.read().await;
        for vm in index.by_uuid.values() {
            if let Ok(inner) = vm.try_lock() {
                if inner.id == id {
                    return Ok(vm.clone());
                }
            }
        }
        Err(DriverError::NoSuchDomain(format!("id {id}")))
    }

    /// Allocate the next transient id for a VM transitioning to active
    /// (§4.3, the Shutoff -> Running/Paused transitions).
    pub async fn allocate_id(&self) -> i32 {
        let mut index = self.index.write().await;
        let id = index.next_id;
        index.next_id += 1;
        id
    }

    /// All VMs currently indexed, for `list` and the startup
    /// reconnect/autostart passes (§4.9, §4.10 step 8).
    pub async fn all(&self) -> Vec<Arc<Vm>> {
        self.index.read().await.by_uuid.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.by_uuid.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
