//! The per-VM job coordinator (C2) — the critical mutex of the whole
//! system (§4.2).
//!
//! Two independent slots live in [`JobState`]: a synchronous job
//! (`sync_kind`) serializing short mutations, and an async job
//! (`async_kind`) for long-running operations that permit a masked set
//! of sync jobs to interleave. Both are guarded by the VM's own
//! `tokio::sync::Mutex<VmInner>`; waiters block on a `tokio::sync::Notify`
//! rather than a raw condvar, since the whole driver is async and a
//! waiter must be able to suspend across an `.await` without blocking a
//! worker thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;
use tracing::{instrument, warn};

use crate::error::{DriverError, Result};
use crate::types::{AsyncJobKind, JobInfo, JobKind};
use crate::vm::{Vm, VmInner};

/// Job bookkeeping embedded in [`VmInner`] (§3 Job descriptor).
pub struct JobState {
    pub sync_kind: JobKind,
    pub async_kind: AsyncJobKind,
    pub mask: HashSet<JobKind>,
    pub sync_start: Option<Instant>,
    pub async_start: Option<Instant>,
    pub monitor_start: Option<Instant>,
    pub owner: Option<String>,
    pub abort: Arc<AtomicBool>,
    pub info: JobInfo,
    /// Set around `Begin-sync-job(destroy)` to suppress EOF-driven
    /// crash bookkeeping while a destroy request is in flight (§4.2).
    pub being_destroyed: bool,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            sync_kind: JobKind::None,
            async_kind: AsyncJobKind::None,
            mask: HashSet::new(),
            sync_start: None,
            async_start: None,
            monitor_start: None,
            owner: None,
            abort: Arc::new(AtomicBool::new(false)),
            info: JobInfo::default(),
            being_destroyed: false,
        }
    }
}

impl JobState {
    /// Default interleave mask for a newly-started async job (§4.2
    /// Begin-async-job).
    fn default_mask(kind: AsyncJobKind) -> HashSet<JobKind> {
        use JobKind::*;
        match kind {
            AsyncJobKind::MigrationOut => [Query, Suspend, MigrationOp].into_iter().collect(),
            AsyncJobKind::Save | AsyncJobKind::Dump => {
                [Query, Abort, MigrationOp, Suspend].into_iter().collect()
            }
            AsyncJobKind::MigrationIn | AsyncJobKind::Snapshot => {
                [Query, MigrationOp].into_iter().collect()
            }
            AsyncJobKind::None => HashSet::new(),
        }
    }

    fn can_admit_sync(&self, kind: JobKind) -> bool {
        if self.sync_kind != JobKind::None {
            return false;
        }
        self.async_kind == AsyncJobKind::None || self.mask.contains(&kind)
    }
}

/// RAII guard returned by [`begin_sync_job`]. Holding it *is* holding
/// the VM mutex (§4.2: "return with the mutex still held"); dropping it
/// is `end_sync_job` (§4.2), guaranteeing the "exactly one end-sync-job"
/// invariant (§8 property 6) regardless of the caller's control flow.
pub struct SyncJobGuard {
    vm: Arc<Vm>,
    guard: Option<OwnedMutexGuard<VmInner>>,
}

impl SyncJobGuard {
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Consume the guard early; equivalent to letting it drop, provided
    /// only for call sites that want the "end-sync-job" point to read
    /// explicitly in the code.
    pub fn end(self) {
        drop(self);
    }

    /// Release the VM mutex while keeping the sync-job slot reserved,
    /// for a mutation that must call something which locks the VM
    /// itself (e.g. a monitor round-trip through [`crate::monitor::MonitorSession`])
    /// partway through. The job keeps blocking any other sync job and
    /// any unmasked async job until the returned [`SyncJobToken`] is
    /// consumed by `end` or `reacquire` (§4.2: exactly one end-sync-job
    /// per begin-sync-job, just deferred past this unguarded stretch).
    pub fn release_mutex(mut self) -> SyncJobToken {
        self.guard.take();
        SyncJobToken { vm: self.vm.clone() }
    }
}

/// Continuation of a [`SyncJobGuard`] after [`SyncJobGuard::release_mutex`]:
/// the sync-job slot is still reserved but the VM mutex is free for
/// other code (including this same caller) to lock.
pub struct SyncJobToken {
    vm: Arc<Vm>,
}

impl SyncJobToken {
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Clear the sync-job slot, the same effect `SyncJobGuard::drop` has
    /// — call this when the unguarded work failed or rolled back cleanly
    /// and no further guarded mutation follows.
    pub async fn end(self) {
        let mut inner = self.vm.inner.clone().lock_owned().await;
        inner.job.sync_kind = JobKind::None;
        inner.job.sync_start = None;
        inner.job.owner = None;
        inner.job.being_destroyed = false;
        drop(inner);
        self.vm.notify.notify_waiters();
    }

    /// Re-lock the VM and hand back a [`SyncJobGuard`] over the same
    /// still-reserved slot, for the final guarded mutation that commits
    /// the operation. Dropping that guard ends the job.
    pub async fn reacquire(self) -> SyncJobGuard {
        let inner = self.vm.inner.clone().lock_owned().await;
        SyncJobGuard { vm: self.vm.clone(), guard: Some(inner) }
    }
}

impl std::ops::Deref for SyncJobGuard {
    type Target = VmInner;
    fn deref(&self) -> &VmInner {
        self.guard.as_ref().expect("guard taken")
    }
}

impl std::ops::DerefMut for SyncJobGuard {
    fn deref_mut(&mut self) -> &mut VmInner {
        self.guard.as_mut().expect("guard taken")
    }
}

impl Drop for SyncJobGuard {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.job.sync_kind = JobKind::None;
            guard.job.sync_start = None;
            guard.job.owner = None;
            guard.job.being_destroyed = false;
        }
        self.vm.notify.notify_waiters();
    }
}

/// RAII guard returned by [`begin_async_job`]. Unlike the sync guard
/// this does *not* hold the VM mutex across its lifetime — an async job
/// only marks the slot, so that masked sync jobs and monitor calls can
/// interleave (§4.2). Callers must call [`AsyncJobGuard::end`]
/// explicitly when the async job completes; `Drop` is a best-effort
/// safety net that clears the slot via `try_lock` and logs if it could
/// not (the mutex should never be held across a drop point in correct
/// code, since async jobs don't hold it).
pub struct AsyncJobGuard {
    vm: Arc<Vm>,
    abort: Arc<AtomicBool>,
    ended: bool,
}

impl AsyncJobGuard {
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Poll whether `abort_async_job` has been called for this job.
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Clear the async slot. Must be called exactly once per
    /// [`begin_async_job`] (§8 property analogous to sync jobs).
    pub async fn end(mut self) {
        let mut inner = self.vm.inner.clone().lock_owned().await;
        inner.job.async_kind = AsyncJobKind::None;
        inner.job.async_start = None;
        inner.job.mask.clear();
        inner.job.abort = Arc::new(AtomicBool::new(false));
        drop(inner);
        self.vm.notify.notify_waiters();
        self.ended = true;
    }
}

impl Drop for AsyncJobGuard {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        match self.vm.inner.clone().try_lock_owned() {
            Ok(mut inner) => {
                inner.job.async_kind = AsyncJobKind::None;
                inner.job.async_start = None;
                inner.job.mask.clear();
                self.vm.notify.notify_waiters();
            }
            Err(_) => {
                warn!(
                    vm = %self.vm.uuid,
                    "async job guard dropped without end() while VM mutex contended; \
                     slot will be cleared by the next successful begin-async-job check"
                );
            }
        }
    }
}

/// Begin a synchronous job (§4.2 Begin-sync-job). `deadline` is
/// relative ("wait at most this long"); pass `None` to wait forever.
#[instrument(skip(vm), fields(vm = %vm.uuid, ?kind))]
pub async fn begin_sync_job(
    vm: &Arc<Vm>,
    kind: JobKind,
    deadline: Option<Duration>,
) -> Result<SyncJobGuard> {
    let deadline_at = deadline.map(|d| Instant::now() + d);
    let notified = vm.notify.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();

    loop {
        {
            let mut inner = vm.inner.clone().lock_owned().await;
            if inner.job.can_admit_sync(kind) {
                inner.job.sync_kind = kind;
                inner.job.sync_start = Some(Instant::now());
                inner.job.owner = Some(current_task_label());
                if kind == JobKind::Destroy {
                    inner.job.being_destroyed = true;
                }
                return Ok(SyncJobGuard {
                    vm: vm.clone(),
                    guard: Some(inner),
                });
            }
        }

        match deadline_at {
            Some(at) => {
                if tokio::time::timeout_at(at.into(), notified.as_mut())
                    .await
                    .is_err()
                {
                    return Err(DriverError::OperationTimedOut);
                }
            }
            None => notified.as_mut().await,
        }
        notified.set(vm.notify.notified());
        notified.as_mut().enable();
    }
}

/// Begin an async job (§4.2 Begin-async-job). Fails with
/// `OperationInvalid` if another async job is already active — a VM has
/// at most one async job at a time.
#[instrument(skip(vm), fields(vm = %vm.uuid, ?kind))]
pub async fn begin_async_job(vm: &Arc<Vm>, kind: AsyncJobKind) -> Result<AsyncJobGuard> {
    let mut inner = vm.inner.clone().lock_owned().await;
    if inner.job.async_kind != AsyncJobKind::None {
        return Err(DriverError::OperationInvalid(format!(
            "async job {:?} already active",
            inner.job.async_kind
        )));
    }
    inner.job.async_kind = kind;
    inner.job.async_start = Some(Instant::now());
    inner.job.mask = JobState::default_mask(kind);
    let abort = Arc::new(AtomicBool::new(false));
    inner.job.abort = abort.clone();
    inner.job.info = JobInfo::default();
    drop(inner);
    Ok(AsyncJobGuard { vm: vm.clone(), abort, ended: false })
}

/// Narrow or widen the interleave mask for the active async job
/// (§4.2 Set-async-mask) — used e.g. to forbid `suspend` briefly around
/// the header-rewrite step of save.
pub async fn set_async_mask(vm: &Arc<Vm>, mask: HashSet<JobKind>) -> Result<()> {
    let mut inner = vm.inner.clone().lock_owned().await;
    if inner.job.async_kind == AsyncJobKind::None {
        return Err(DriverError::OperationInvalid(
            "no async job active".to_string(),
        ));
    }
    inner.job.mask = mask;
    Ok(())
}

/// Request cancellation of the active async job (§5 Cancellation). The
/// in-flight monitor call, if any, is expected to be cancelled by the
/// caller issuing a cancel request on the session; this flag is what
/// `enter_monitor`/the save/snapshot/migration loops poll to notice it.
pub async fn abort_async_job(vm: &Arc<Vm>) -> Result<()> {
    let inner = vm.inner.clone().lock_owned().await;
    if inner.job.async_kind == AsyncJobKind::None {
        return Err(DriverError::OperationInvalid(
            "no async job active".to_string(),
        ));
    }
    inner.job.abort.store(true, Ordering::SeqCst);
    Ok(())
}

/// Non-blocking job-state snapshot for the control API (§4.2 Inquire).
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub sync_kind: JobKind,
    pub async_kind: AsyncJobKind,
    pub elapsed: Option<Duration>,
    pub info: JobInfo,
}

pub async fn inquire(vm: &Arc<Vm>) -> JobSnapshot {
    let inner = vm.inner.clone().lock_owned().await;
    let elapsed = inner
        .job
        .async_start
        .or(inner.job.sync_start)
        .map(|t| t.elapsed());
    JobSnapshot {
        sync_kind: inner.job.sync_kind,
        async_kind: inner.job.async_kind,
        elapsed,
        info: inner.job.info,
    }
}

fn current_task_label() -> String {
    format!("{:?}", std::thread::current().id())
}
