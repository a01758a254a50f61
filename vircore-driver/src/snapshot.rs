//! Snapshot engine (C7, §4.7).
//!
//! Two independent families share one metadata tree
//! ([`crate::vm::SnapshotTree`]): internal (native QCOW2 snapshots,
//! memory folded into the same file) and external (a new overlay file
//! per disk, optionally a separate memory file). This module only
//! implements the external family's live path plus pivot and delete,
//! since those are the operations with real concurrency and rollback
//! hazards; internal snapshots reduce to format-native calls issued
//! through the same monitor session.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;

use crate::error::{DriverError, Result};
use crate::events::EventBus;
use crate::interfaces::{GuestAgentHandle, MonitorCommand};
use crate::job::{begin_async_job, AsyncJobGuard};
use crate::lifecycle;
use crate::monitor::MonitorSession;
use crate::paths::StatePaths;
use crate::resource::ResourceBinder;
use crate::types::{BindMode, SnapshotDeleteMode, SnapshotKind, StateReason, VmState};
use crate::vm::{SnapshotNode, Vm};

/// One disk's target for an external snapshot request.
#[derive(Debug, Clone)]
pub struct ExternalTarget {
    pub disk_id: String,
    pub overlay_path: String,
    pub reuse_existing: bool,
}

/// A snapshot request (§4.7 preparation rules).
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub name: String,
    pub kind: SnapshotKind,
    pub targets: Vec<ExternalTarget>,
    pub quiesce: bool,
    pub memory_file: Option<String>,
    pub live: bool,
    pub supports_transaction: bool,
}

fn validate_request(req: &SnapshotRequest) -> Result<()> {
    if req.kind == SnapshotKind::External && req.targets.is_empty() {
        return Err(DriverError::InvalidArgument(
            "external snapshot requires at least one disk target".into(),
        ));
    }
    if req.quiesce && req.memory_file.is_none() && req.targets.is_empty() {
        return Err(DriverError::InvalidArgument(
            "disk-only snapshot cannot also request quiesce".into(),
        ));
    }
    Ok(())
}

/// Run the live external-snapshot algorithm (§4.7 steps 1-7).
#[instrument(skip_all, fields(vm = %vm.uuid, name = %req.name))]
pub async fn create_external(
    vm: &Arc<Vm>,
    session: &MonitorSession,
    binder: &ResourceBinder,
    agent: Option<&dyn GuestAgentHandle>,
    paths: &StatePaths,
    bus: &EventBus,
    req: SnapshotRequest,
) -> Result<()> {
    validate_request(&req)?;
    for target in &req.targets {
        if !target.reuse_existing && tokio::fs::metadata(&target.overlay_path).await.is_ok() {
            return Err(DriverError::InvalidArgument(format!(
                "target {} already exists",
                target.overlay_path
            )));
        }
    }

    let guard = begin_async_job(vm, crate::types::AsyncJobKind::Snapshot).await?;
    let result = create_external_inner(vm, &guard, session, binder, agent, paths, bus, &req).await;
    guard.end().await;
    result
}

async fn create_external_inner(
    vm: &Arc<Vm>,
    guard: &AsyncJobGuard,
    session: &MonitorSession,
    binder: &ResourceBinder,
    agent: Option<&dyn GuestAgentHandle>,
    paths: &StatePaths,
    bus: &EventBus,
    req: &SnapshotRequest,
) -> Result<()> {
    let mut thaw_owed = false;
    if req.quiesce {
        match agent {
            Some(agent) => agent.freeze_filesystems().await?,
            None => {
                return Err(DriverError::OperationUnsupported(
                    "quiesce requires a guest agent".into(),
                ))
            }
        }
        thaw_owed = true;
    }

    let run_result = run_snapshot_steps(vm, guard, session, binder, paths, bus, req).await;

    if thaw_owed {
        if let Some(agent) = agent {
            let _ = agent.thaw_filesystems().await;
        }
    }

    run_result
}

async fn run_snapshot_steps(
    vm: &Arc<Vm>,
    guard: &AsyncJobGuard,
    session: &MonitorSession,
    binder: &ResourceBinder,
    paths: &StatePaths,
    bus: &EventBus,
    req: &SnapshotRequest,
) -> Result<()> {
    let (vm_name, was_running, prior_current) = {
        let inner = vm.lock().await;
        (
            inner.def.name.clone(),
            matches!(inner.state, VmState::Running),
            inner.snapshots.current.clone(),
        )
    };

    let paused_here = if req.memory_file.is_some() && !req.live && was_running {
        let mut inner = vm.lock().await;
        lifecycle::transition(
            &mut inner,
            paths,
            bus,
            VmState::Paused,
            StateReason::PausedForSnapshot,
            None,
        )
        .await?;
        true
    } else {
        false
    };

    let step_result = apply_disk_overlays(vm, guard, session, binder, &vm_name, req).await;

    if paused_here {
        let mut inner = vm.lock().await;
        let _ = lifecycle::transition(
            &mut inner,
            paths,
            bus,
            VmState::Running,
            StateReason::Unknown,
            None,
        )
        .await;
    }

    step_result?;

    let mut inner = vm.lock().await;
    let mut overlay_paths = HashMap::new();
    for target in &req.targets {
        overlay_paths.insert(target.disk_id.clone(), target.overlay_path.clone());
    }
    let node = SnapshotNode {
        name: req.name.clone(),
        parent: prior_current.clone(),
        children: Vec::new(),
        kind: req.kind,
        state_at_creation: inner.state,
        overlay_paths,
        created_at: chrono::Utc::now(),
    };
    if prior_current.is_none() {
        inner.snapshots.insert_root(node);
    } else {
        inner.snapshots.insert_child(node);
    }
    Ok(())
}

async fn apply_disk_overlays(
    vm: &Arc<Vm>,
    guard: &AsyncJobGuard,
    session: &MonitorSession,
    binder: &ResourceBinder,
    vm_name: &str,
    req: &SnapshotRequest,
) -> Result<()> {
    let mut bound: Vec<&ExternalTarget> = Vec::new();
    for target in &req.targets {
        if let Err(e) = binder.prepare(vm_name, &target.overlay_path, BindMode::ReadWrite).await {
            rollback_overlays(binder, vm_name, &bound).await;
            return Err(e);
        }
        bound.push(target);
    }

    let call_result = if req.supports_transaction && req.targets.len() > 1 {
        let actions: Vec<_> = req
            .targets
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "blockdev-snapshot-sync",
                    "device": t.disk_id,
                    "snapshot-file": t.overlay_path,
                })
            })
            .collect();
        session
            .call(
                vm,
                MonitorCommand::new("transaction").with_args(serde_json::json!({ "actions": actions })),
            )
            .await
    } else if req.targets.len() == 1 {
        let target = &req.targets[0];
        session
            .call(
                vm,
                MonitorCommand::new("disk_snapshot").with_args(serde_json::json!({
                    "device": target.disk_id,
                    "file": target.overlay_path,
                })),
            )
            .await
    } else {
        Err(DriverError::OperationUnsupported(
            "multiple disk targets require transaction support".into(),
        ))
    };

    if guard.aborted() {
        rollback_overlays(binder, vm_name, &bound).await;
        for target in &req.targets {
            let _ = tokio::fs::remove_file(&target.overlay_path).await;
        }
        return Err(DriverError::OperationAborted);
    }

    if let Err(e) = call_result {
        rollback_overlays(binder, vm_name, &bound).await;
        for target in &req.targets {
            let _ = tokio::fs::remove_file(&target.overlay_path).await;
        }
        return Err(e);
    }

    let mut inner = vm.lock().await;
    for target in &req.targets {
        if let Some(disk) = inner.def.disks.iter_mut().find(|d| d.id == target.disk_id) {
            disk.backing_file = Some(disk.path.clone());
            disk.path = target.overlay_path.clone();
        }
    }
    Ok(())
}

async fn rollback_overlays(binder: &ResourceBinder, vm_name: &str, bound: &[&ExternalTarget]) {
    for target in bound.iter().rev() {
        let _ = binder.prepare(vm_name, &target.overlay_path, BindMode::None).await;
    }
}

/// Start a live block-copy ("mirror") of `disk_id` onto `target_path`
/// (§8 scenario 5: "Live block copy then pivot"). The guest keeps
/// serving I/O from the original file until a later [`pivot`] succeeds.
#[instrument(skip(vm, session), fields(vm = %vm.uuid, %disk_id, %target_path))]
pub async fn start_block_copy(
    vm: &Arc<Vm>,
    session: &MonitorSession,
    disk_id: &str,
    target_path: &str,
) -> Result<()> {
    {
        let inner = vm.lock().await;
        if inner.block_copy_active.contains(disk_id) {
            return Err(DriverError::OperationInvalid(
                "block-copy already active for this disk".into(),
            ));
        }
    }

    session
        .call(
            vm,
            MonitorCommand::new("drive_mirror").with_args(serde_json::json!({
                "device": disk_id,
                "target": target_path,
                "sync": "full",
            })),
        )
        .await?;

    let mut inner = vm.lock().await;
    inner.block_copy_active.insert(disk_id.to_string());
    inner
        .block_copy_targets
        .insert(disk_id.to_string(), target_path.to_string());
    Ok(())
}

/// Pivot a live block-copy onto its mirror (§4.7 "Pivot").
#[instrument(skip(vm, session), fields(vm = %vm.uuid, %disk_id))]
pub async fn pivot(
    vm: &Arc<Vm>,
    session: &MonitorSession,
    paths: &StatePaths,
    bus: &EventBus,
    disk_id: &str,
) -> Result<()> {
    {
        let inner = vm.lock().await;
        if !inner.block_copy_active.contains(disk_id) {
            return Err(DriverError::OperationInvalid(
                "pivot requested on a disk with no active block-copy".into(),
            ));
        }
    }

    let mut inner = vm.lock().await;
    let was_running = inner.state == VmState::Running;
    if was_running {
        lifecycle::transition(
            &mut inner,
            paths,
            bus,
            VmState::Paused,
            StateReason::PausedForSnapshot,
            None,
        )
        .await?;
    }
    drop(inner);

    let reply = session
        .call(
            vm,
            MonitorCommand::new("drive_pivot").with_args(serde_json::json!({ "device": disk_id })),
        )
        .await;

    let mut inner = vm.lock().await;
    match reply {
        Ok(_) => {
            inner.block_copy_active.remove(disk_id);
            if let Some(target_path) = inner.block_copy_targets.remove(disk_id) {
                if let Some(disk) = inner.def.disks.iter_mut().find(|d| d.id == disk_id) {
                    disk.backing_file = Some(disk.path.clone());
                    disk.path = target_path;
                }
            }
        }
        Err(ref _e) => {
            // block-copy stays active; the caller may retry the pivot.
        }
    }
    if was_running {
        lifecycle::transition(&mut inner, paths, bus, VmState::Running, StateReason::Unknown, None)
            .await?;
    }
    reply.map(|_| ())
}

/// Delete a snapshot (§4.7 "Delete"). `Full` mode reparents `name`'s
/// children onto its own parent, same as `MetadataOnly`, and additionally
/// invokes the format-native deletion of `name`'s own QCOW2 snapshot
/// point — it never touches `name`'s descendants.
pub async fn delete(
    vm: &Arc<Vm>,
    session: &MonitorSession,
    name: &str,
    mode: SnapshotDeleteMode,
) -> Result<()> {
    let mut inner = vm.lock().await;
    match mode {
        SnapshotDeleteMode::MetadataOnly => {
            inner
                .snapshots
                .unlink(name)
                .ok_or_else(|| DriverError::NoSuchSnapshot(name.to_string()))?;
            Ok(())
        }
        SnapshotDeleteMode::Full => {
            if inner.snapshots.nodes.get(name).map(|n| n.kind) == Some(SnapshotKind::External) {
                return Err(DriverError::OperationUnsupported(
                    "external-snapshot deletion is not supported".into(),
                ));
            }
            inner
                .snapshots
                .unlink(name)
                .ok_or_else(|| DriverError::NoSuchSnapshot(name.to_string()))?;
            drop(inner);
            session
                .call(
                    vm,
                    MonitorCommand::new("snapshot_delete").with_args(serde_json::json!({ "name": name })),
                )
                .await?;
            Ok(())
        }
    }
}

/// Revert to `name` (§4.7 "Revert"). Only internal snapshots are
/// supported; external-snapshot revert is explicitly out of scope.
/// `force_run`/`force_paused` override the state captured at snapshot
/// creation time; at most one may be set.
pub async fn revert(
    vm: &Arc<Vm>,
    session: &MonitorSession,
    paths: &StatePaths,
    bus: &EventBus,
    name: &str,
    force_run: bool,
    force_paused: bool,
) -> Result<()> {
    if force_run && force_paused {
        return Err(DriverError::InvalidArgument(
            "force-run and force-paused are mutually exclusive".into(),
        ));
    }

    let mut inner = vm.lock().await;
    let node = inner
        .snapshots
        .nodes
        .get(name)
        .cloned()
        .ok_or_else(|| DriverError::NoSuchSnapshot(name.to_string()))?;
    if node.kind == SnapshotKind::External {
        return Err(DriverError::OperationUnsupported(
            "revert to an external disk snapshot is out of scope".into(),
        ));
    }
    let target_state = if force_run {
        VmState::Running
    } else if force_paused {
        VmState::Paused
    } else {
        node.state_at_creation
    };

    let is_active = inner.state.is_active();
    if is_active {
        lifecycle::transition(&mut inner, paths, bus, VmState::Paused, StateReason::PausedForSnapshot, None)
            .await?;
        drop(inner);
        session
            .call(vm, MonitorCommand::new("load_snapshot").with_args(serde_json::json!({ "name": name })))
            .await?;
        let mut inner = vm.lock().await;
        lifecycle::transition(&mut inner, paths, bus, target_state, StateReason::FromSnapshot, None).await?;
    } else {
        // Inactive revert: no live monitor to reload a live snapshot
        // from, so the format-native revert is issued per disk instead,
        // the same call shape `apply_disk_overlays` uses for its own
        // per-disk monitor commands.
        let disk_ids: Vec<String> = inner.def.disks.iter().map(|d| d.id.clone()).collect();
        drop(inner);
        for disk_id in &disk_ids {
            session
                .call(
                    vm,
                    MonitorCommand::new("snapshot_revert").with_args(serde_json::json!({
                        "device": disk_id,
                        "snapshot": name,
                    })),
                )
                .await?;
        }
        if target_state.is_active() {
            let mut inner = vm.lock().await;
            lifecycle::transition(&mut inner, paths, bus, target_state, StateReason::FromSnapshot, None)
                .await?;
        }
    }
    let mut inner = vm.lock().await;
    inner.snapshots.current = Some(name.to_string());
    Ok(())
}
