//! VM lifecycle state machine (C3, §4.3).
//!
//! Pure transition logic over an already-locked [`VmInner`]; callers
//! hold the VM mutex (typically via a [`crate::job::SyncJobGuard`])
//! before calling any function here. Each transition performs, in
//! order: the in-memory state update, status-file persistence when the
//! new state is active, and event enqueue — matching §4.3's three-step
//! transition contract. Registry removal for a non-persistent VM
//! reaching `shutoff` is signalled back to the caller via the returned
//! [`Transition::should_remove`] flag rather than performed here, since
//! lifecycle.rs has no registry reference (keeps the lock hierarchy
//! honest: registry access happens one level up, in `context.rs`).

use tracing::instrument;

use crate::error::{DriverError, Result};
use crate::events::{EventBus, EventKind};
use crate::paths::StatePaths;
use crate::types::{StateReason, VmState};
use crate::vm::VmInner;

/// Outcome of a transition, for the caller to act on after the lock is
/// released.
pub struct Transition {
    pub from: VmState,
    pub to: VmState,
    pub should_remove: bool,
}

fn validate(from: VmState, to: VmState) -> Result<()> {
    match (from, to) {
        (VmState::PmSuspended, VmState::Paused) => Err(DriverError::OperationInvalid(
            "suspend is invalid from pmsuspended".into(),
        )),
        (from, VmState::Running)
            if from != VmState::Paused && from != VmState::Shutoff && from != VmState::Running =>
        {
            // resume is only valid from paused; direct transitions to
            // running from anything else must go through a start path,
            // which calls `boot` rather than `resume`. `running ->
            // running` is an idempotent no-op (e.g. a migration that
            // never left the source running) and is excluded above.
            if from == VmState::PmSuspended || from == VmState::Blocked {
                Ok(())
            } else {
                Err(DriverError::OperationInvalid(format!(
                    "cannot resume from {from:?}"
                )))
            }
        }
        _ => Ok(()),
    }
}

async fn persist_status(
    paths: &StatePaths,
    inner: &VmInner,
) -> std::io::Result<()> {
    if !inner.state.is_active() {
        let _ = tokio::fs::remove_file(paths.status_file(&inner.def.name)).await;
        return Ok(());
    }
    let record = serde_json::json!({
        "uuid": inner.def.uuid,
        "name": inner.def.name,
        "id": inner.id,
        "state": inner.state,
        "reason": inner.reason,
        "pid": inner.pid,
    });
    let bytes = serde_json::to_vec_pretty(&record)?;
    tokio::fs::write(paths.status_file(&inner.def.name), bytes).await
}

/// Apply a state transition (§4.3 steps 1-4). `allocate_id` is called
/// only when transitioning from an inactive to an active state.
#[instrument(skip(inner, paths, bus), fields(vm = %inner.def.uuid, ?to, ?reason))]
pub async fn transition(
    inner: &mut VmInner,
    paths: &StatePaths,
    bus: &EventBus,
    to: VmState,
    reason: StateReason,
    new_id: Option<i32>,
) -> Result<Transition> {
    let from = inner.state;
    validate(from, to)?;

    inner.state = to;
    inner.reason = reason;
    if let Some(id) = new_id {
        inner.id = id;
    }
    if !to.is_active() {
        inner.id = -1;
        inner.monitor = None;
    }

    if let Err(e) = persist_status(paths, inner).await {
        return Err(DriverError::SystemError(e));
    }

    emit_for_transition(bus, inner, from, to, reason);

    let should_remove = to == VmState::Shutoff && !inner.persistent;
    Ok(Transition { from, to, should_remove })
}

fn emit_for_transition(
    bus: &EventBus,
    inner: &VmInner,
    from: VmState,
    to: VmState,
    reason: StateReason,
) {
    let uuid = inner.def.uuid;
    let name = &inner.def.name;

    // Paused-start: a direct shutoff -> paused transition on boot
    // enqueues both `started` and `suspended`, in that order (§5).
    if from == VmState::Shutoff && to == VmState::Paused {
        bus.emit_paused_start(uuid, name);
        return;
    }

    let kind = match to {
        VmState::Running if from == VmState::Shutoff => EventKind::Started,
        VmState::Running => EventKind::Resumed,
        VmState::Paused => EventKind::Suspended,
        VmState::Shutoff | VmState::Crashed => EventKind::Stopped,
        VmState::PmSuspended => EventKind::PmSuspended,
        VmState::Blocked => EventKind::Suspended,
        VmState::ShutdownInProgress => return,
    };
    bus.emit(uuid, name, kind, reason);
}

/// Status record shape written by [`persist_status`], read back at
/// manager start to decide whether a VM needs a reconnect attempt
/// (§4.10 step 5).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PersistedStatus {
    pub id: i32,
    pub state: VmState,
    pub pid: Option<u32>,
}

/// Read back `<state_dir>/<vm_name>.xml` if it exists (§4.3, §4.10 step
/// 5: "load persistent status files for active VMs first").
pub async fn load_status(paths: &StatePaths, vm_name: &str) -> Option<PersistedStatus> {
    let bytes = tokio::fs::read(paths.status_file(vm_name)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Reconnect semantics (manager start, §4.3): for a VM whose status
/// file claims it was active, attempt to reattach; on failure mark it
/// `crashed` and queue a stop event. Reattaching to a live hypervisor
/// process is a deployment-specific connection-layer concern (§1) this
/// core has no collaborator for, so every call here is the "on
/// failure" branch.
pub async fn reconnect_failed(
    inner: &mut VmInner,
    paths: &StatePaths,
    bus: &EventBus,
) -> Result<()> {
    transition(
        inner,
        paths,
        bus,
        VmState::Crashed,
        StateReason::Crashed,
        None,
    )
    .await?;
    Ok(())
}
