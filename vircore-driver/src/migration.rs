//! Migration orchestrator (C8, §4.8).
//!
//! Models the V2/V3 phase sequence as four free functions — `begin`,
//! `prepare`, `perform`, `finish`/`confirm` — driven by a caller that
//! owns the source/destination pairing (out of scope here: the
//! connection layer that actually dials the destination host). Each
//! function takes the job guard the caller already holds so the
//! `migration-out` async job persists across phases when
//! `change_protection` is requested (§4.8 Begin).

use std::sync::Arc;

use tracing::instrument;

use crate::error::{DriverError, Result};
use crate::events::EventBus;
use crate::interfaces::{MigrationCookie, MigrationTransport, MonitorCommand};
use crate::job::{begin_async_job, AsyncJobGuard};
use crate::lifecycle;
use crate::monitor::MonitorSession;
use crate::paths::StatePaths;
use crate::types::{AsyncJobKind, DomainDefinition, StateReason, VmState};
use crate::vm::Vm;

/// Output of [`begin`]: everything the caller needs to hand to the
/// destination's [`prepare`] over whatever connection mechanism it uses.
pub struct BeginResult {
    pub migratable_xml_def: DomainDefinition,
    pub cookie: MigrationCookie,
}

/// Source-side Begin (§4.8). Starts the persistent `migration-out`
/// async job when `change_protection` is set; otherwise the caller is
/// expected to hold its own async job for the duration.
#[instrument(skip(vm), fields(vm = %vm.uuid))]
pub async fn begin(
    vm: &Arc<Vm>,
    change_protection: bool,
) -> Result<(BeginResult, Option<AsyncJobGuard>)> {
    let inner = vm.lock().await;
    if !inner.state.is_active() {
        return Err(DriverError::OperationInvalid(
            "cannot migrate an inactive VM".into(),
        ));
    }
    if inner.def.cdroms.iter().any(|c| c.iso_path.is_none() && c.bootable) {
        return Err(DriverError::OperationInvalid(
            "bootable cdrom has no media inserted".into(),
        ));
    }
    let migratable = inner.def.to_migratable();
    drop(inner);

    let guard = if change_protection {
        Some(begin_async_job(vm, AsyncJobKind::MigrationOut).await?)
    } else {
        None
    };

    Ok((
        BeginResult {
            migratable_xml_def: migratable,
            cookie: MigrationCookie::default(),
        },
        guard,
    ))
}

/// Destination-side Prepare (§4.8). Picks a listening port via
/// `transport` and returns it for the caller to relay back to the
/// source out-of-band.
#[instrument(skip(def, transport))]
pub async fn prepare(
    def: &DomainDefinition,
    transport: &dyn MigrationTransport,
    _cookie: &MigrationCookie,
) -> Result<u16> {
    let _ = def;
    transport.listen().await
}

/// Source-side Perform (§4.8): connect to the destination and issue the
/// outgoing-migration monitor command. `guard` must be the
/// `migration-out` async job from [`begin`] (or one the caller started
/// itself) so `abort-job` can cancel it mid-flight.
#[instrument(skip(vm, session, transport), fields(vm = %vm.uuid, %host, %port))]
pub async fn perform(
    vm: &Arc<Vm>,
    session: &MonitorSession,
    transport: &dyn MigrationTransport,
    guard: &AsyncJobGuard,
    host: &str,
    port: u16,
) -> Result<()> {
    let token = transport.connect(host, port).await?;
    let reply = session
        .call(
            vm,
            MonitorCommand::new("migrate").with_args(serde_json::json!({
                "uri": format!("tcp:{host}:{port}"),
            })),
        )
        .await;

    let outcome = if guard.aborted() {
        let _ = session.call(vm, MonitorCommand::new("migrate_cancel")).await;
        Err(DriverError::OperationAborted)
    } else {
        reply
    };

    transport.close(&token).await?;
    outcome.map(|_| ())
}

/// Destination-side Finish (§4.8): wait for convergence (signalled by
/// the caller observing the incoming-migration monitor event, out of
/// scope here) and transition the destination VM to its final state.
#[instrument(skip(vm, bus, paths), fields(vm = %vm.uuid, resume = resume))]
pub async fn finish(
    vm: &Arc<Vm>,
    paths: &StatePaths,
    bus: &EventBus,
    converged: bool,
    resume: bool,
) -> Result<()> {
    let mut inner = vm.lock().await;
    if !converged {
        lifecycle::transition(&mut inner, paths, bus, VmState::Shutoff, StateReason::Failed, None)
            .await?;
        return Err(DriverError::OperationFailed("migration did not converge".into()));
    }
    let target = if resume { VmState::Running } else { VmState::Paused };
    let reason = if resume { StateReason::Migrated } else { StateReason::PausedForMigration };
    lifecycle::transition(&mut inner, paths, bus, target, reason, None).await?;
    Ok(())
}

/// Source-side Confirm (§4.8): on destination success, shut the source
/// off with `shutoff-migrated`; on cancellation, resume the source back
/// to running. Ends the `migration-out` async job.
#[instrument(skip(vm, paths, bus, guard), fields(vm = %vm.uuid, success = success))]
pub async fn confirm(
    vm: &Arc<Vm>,
    paths: &StatePaths,
    bus: &EventBus,
    guard: AsyncJobGuard,
    success: bool,
) -> Result<()> {
    let mut inner = vm.lock().await;
    if success {
        lifecycle::transition(
            &mut inner,
            paths,
            bus,
            VmState::Shutoff,
            StateReason::Migrated2,
            None,
        )
        .await?;
    } else {
        lifecycle::transition(&mut inner, paths, bus, VmState::Running, StateReason::Unknown, None)
            .await?;
    }
    drop(inner);
    guard.end().await;
    Ok(())
}
