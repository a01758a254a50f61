//! The in-memory VM object (§3 `virDomainObj`-equivalent) and its
//! snapshot tree.
//!
//! Every live or defined-but-inactive VM has exactly one `Vm`, held by
//! the registry as `Arc<Vm>` and handed out to callers on lookup. Its
//! mutable state lives behind a `tokio::sync::Mutex` wrapped in its own
//! `Arc` so job guards can take an owned, `'static` lock independent of
//! how long the caller keeps its `Arc<Vm>` handle around.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex as TokioMutex, Notify};
use uuid::Uuid;

use crate::interfaces::MonitorTransport;
use crate::job::JobState;
use crate::types::{DomainDefinition, StateReason, VmState};

/// One node in a VM's snapshot tree (§4.7).
#[derive(Debug, Clone)]
pub struct SnapshotNode {
    pub name: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub kind: crate::types::SnapshotKind,
    /// Domain state captured at snapshot time, used by revert.
    pub state_at_creation: VmState,
    /// For external disk snapshots, the new active image path per disk
    /// id, in the order generated by the snapshot transaction.
    pub overlay_paths: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Snapshot relationships for one VM, kept separate from `VmInner`'s
/// runtime fields because it is serialized to disk independently
/// (§6 `snapshot/<vm-name>/*.xml`).
#[derive(Debug, Clone, Default)]
pub struct SnapshotTree {
    pub nodes: HashMap<String, SnapshotNode>,
    pub current: Option<String>,
}

impl SnapshotTree {
    pub fn insert_root(&mut self, node: SnapshotNode) {
        self.current = Some(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn insert_child(&mut self, mut node: SnapshotNode) {
        if let Some(parent_name) = &node.parent {
            if let Some(parent) = self.nodes.get_mut(parent_name) {
                parent.children.push(node.name.clone());
            }
        } else {
            node.parent = None;
        }
        self.current = Some(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
    }

    /// Remove `name`, reparenting its children onto its own parent
    /// (§4.7 Delete, metadata-only mode).
    pub fn unlink(&mut self, name: &str) -> Option<SnapshotNode> {
        let removed = self.nodes.remove(name)?;
        for child in &removed.children {
            if let Some(child_node) = self.nodes.get_mut(child) {
                child_node.parent = removed.parent.clone();
            }
        }
        if let Some(parent_name) = &removed.parent {
            if let Some(parent) = self.nodes.get_mut(parent_name) {
                parent.children.retain(|c| c != name);
                parent.children.extend(removed.children.iter().cloned());
            }
        }
        if self.current.as_deref() == Some(name) {
            self.current = removed.parent.clone();
        }
        Some(removed)
    }

    /// All descendants of `name`, including `name` itself, in no
    /// particular order — used by full-delete mode (§4.7 Delete).
    pub fn subtree(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![name.to_string()];
        while let Some(n) = stack.pop() {
            if let Some(node) = self.nodes.get(&n) {
                stack.extend(node.children.iter().cloned());
            }
            out.push(n);
        }
        out
    }
}

/// Mutable VM state, guarded by the owning `Vm`'s mutex.
pub struct VmInner {
    pub def: DomainDefinition,
    /// Pending redefinition staged during a live `Modify`, swapped in
    /// at the next clean shutdown (§4.3 Modify transition).
    pub new_def: Option<DomainDefinition>,
    pub state: VmState,
    pub reason: StateReason,
    /// Monotonic id assigned while active; -1 when inactive, matching
    /// the glossary's "id" field semantics.
    pub id: i32,
    pub persistent: bool,
    pub autostart: bool,
    pub has_managed_save: bool,
    pub job: JobState,
    pub snapshots: SnapshotTree,
    /// Attached control-socket session; `None` whenever the VM is not
    /// active (§4.4).
    pub monitor: Option<Arc<dyn MonitorTransport>>,
    /// Disk ids with an active block-copy job (§4.7 external snapshot,
    /// §8 boundary: pivot without an active copy is rejected).
    pub block_copy_active: std::collections::HashSet<String>,
    /// Mirror target path per disk id for an active block-copy, consumed
    /// by `pivot` on success (§8 scenario 5).
    pub block_copy_targets: HashMap<String, String>,
    pub pid: Option<u32>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl VmInner {
    fn new(def: DomainDefinition, persistent: bool) -> Self {
        Self {
            def,
            new_def: None,
            state: VmState::Shutoff,
            reason: StateReason::Unknown,
            id: -1,
            persistent,
            autostart: false,
            has_managed_save: false,
            job: JobState::default(),
            snapshots: SnapshotTree::default(),
            monitor: None,
            block_copy_active: std::collections::HashSet::new(),
            block_copy_targets: HashMap::new(),
            pid: None,
            start_time: None,
        }
    }
}

/// A VM object as shared through the registry. `uuid` is duplicated out
/// of `inner.def` for lock-free lookup by callers that only need
/// identity (the job coordinator's tracing fields, registry indices).
pub struct Vm {
    pub uuid: Uuid,
    pub(crate) notify: Notify,
    pub(crate) inner: Arc<TokioMutex<VmInner>>,
}

impl Vm {
    pub fn new(def: DomainDefinition, persistent: bool) -> Arc<Self> {
        let uuid = def.uuid;
        Arc::new(Self {
            uuid,
            notify: Notify::new(),
            inner: Arc::new(TokioMutex::new(VmInner::new(def, persistent))),
        })
    }

    /// Take the VM mutex directly, bypassing the job coordinator. Used
    /// by read-only paths (list, status) that don't need sync-job
    /// serialization, matching the specification's allowance for
    /// lock-free queries that don't touch job state (§4.2).
    pub async fn lock(&self) -> tokio::sync::OwnedMutexGuard<VmInner> {
        self.inner.clone().lock_owned().await
    }

    pub fn try_lock(&self) -> Result<tokio::sync::OwnedMutexGuard<VmInner>, tokio::sync::TryLockError> {
        self.inner.clone().try_lock_owned()
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").field("uuid", &self.uuid).finish()
    }
}
