//! Resource tuning and hot-plug entry points (§1: "hot-plug, resource
//! tuning" requests; §8 boundary behaviors).
//!
//! These are thin sync-job-wrapped operations rather than a module of
//! their own class in §4 — a `Modify` sync job, a validation check
//! against the relevant collaborator, and a single monitor command —
//! grounded in the same shape [`crate::save`] and [`crate::snapshot`]
//! use for their own preliminary validation.

use std::sync::Arc;

use tracing::instrument;

use crate::error::{DriverError, Result};
use crate::interfaces::{HotplugHelper, MonitorCommand};
use crate::job::begin_sync_job;
use crate::monitor::MonitorSession;
use crate::resource::ResourceBinder;
use crate::types::{BindMode, DiskBus, DiskConfig, DiskDevice, JobKind};
use crate::vm::Vm;

// `attach_disk`/`set_memory` keep the `Modify` sync job reserved across
// the binder/monitor round trip by handing the guard off to a
// `SyncJobToken` (`SyncJobGuard::release_mutex`) rather than dropping it
// outright — the VM mutex itself can't be held across `session.call`,
// which locks the VM internally, but the job slot must stay marked the
// whole time so no concurrent `Destroy` or second `Modify` can interleave
// with the in-flight mutation (§4.2, §7/§76).

/// Hot-plug a disk into a running VM (§8: "Hot-plug of a USB disk with
/// `device='lun'` is rejected with `ConfigUnsupported`").
#[instrument(skip(vm, session, binder, hotplug, disk), fields(vm = %vm.uuid, disk = %disk.id))]
pub async fn attach_disk(
    vm: &Arc<Vm>,
    session: &MonitorSession,
    binder: &ResourceBinder,
    hotplug: &dyn HotplugHelper,
    disk: DiskConfig,
) -> Result<()> {
    if disk.bus == DiskBus::Usb && disk.device == DiskDevice::Lun && !hotplug.supports_usb_lun() {
        return Err(DriverError::ConfigUnsupported(
            "hot-plug of a USB disk with device=lun is not supported on this host".into(),
        ));
    }

    let guard = begin_sync_job(vm, JobKind::Modify, None).await?;
    if !guard.state.is_active() {
        return Err(DriverError::OperationInvalid(
            "cannot hot-plug a disk into an inactive VM".into(),
        ));
    }
    let vm_name = guard.def.name.clone();
    let token = guard.release_mutex();

    if let Err(e) = binder.prepare(&vm_name, &disk.path, BindMode::ReadWrite).await {
        token.end().await;
        return Err(e);
    }

    let result = session
        .call(
            vm,
            MonitorCommand::new("device_add").with_args(serde_json::json!({
                "id": disk.id.clone(),
                "path": disk.path.clone(),
                "bus": disk.bus.as_str(),
            })),
        )
        .await;
    if let Err(e) = result {
        let _ = binder.prepare(&vm_name, &disk.path, BindMode::None).await;
        token.end().await;
        return Err(e);
    }

    let mut guard = token.reacquire().await;
    guard.def.disks.push(disk);
    Ok(())
}

/// Live-tune a running VM's target memory (§8: "Setting memory above
/// current max-memory is rejected with `InvalidArgument`").
#[instrument(skip(vm, session), fields(vm = %vm.uuid, requested_mib))]
pub async fn set_memory(vm: &Arc<Vm>, session: &MonitorSession, requested_mib: u64) -> Result<()> {
    let guard = begin_sync_job(vm, JobKind::Modify, None).await?;
    if requested_mib > guard.def.memory.max_mib {
        return Err(DriverError::InvalidArgument(format!(
            "requested memory {requested_mib} MiB exceeds max-memory {} MiB",
            guard.def.memory.max_mib
        )));
    }
    if !guard.state.is_active() {
        return Err(DriverError::OperationInvalid(
            "cannot live-tune memory on an inactive VM".into(),
        ));
    }
    let token = guard.release_mutex();

    if let Err(e) = session
        .call(vm, MonitorCommand::new("set_balloon").with_args(serde_json::json!({ "mib": requested_mib })))
        .await
    {
        token.end().await;
        return Err(e);
    }

    let mut guard = token.reacquire().await;
    guard.def.memory.size_mib = requested_mib;
    Ok(())
}
