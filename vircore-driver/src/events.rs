//! Event & worker bus (C9, §4.9).
//!
//! Delivery uses a `tokio::sync::broadcast` channel: one send fans out
//! to every subscriber, and each VM's events keep enqueue order via a
//! per-VM sequence counter stamped before the send (broadcast itself
//! preserves send order for all existing receivers, but the counter
//! lets a subscriber that joined late detect gaps).
//!
//! The worker pool is a bounded, single-consumer queue for watchdog
//! auto-dump work, matching the specification's "single-threaded
//! ordered queue" requirement (§4.9) — a literal OS thread pool would
//! be unidiomatic here; a single background task draining an
//! `mpsc::channel` is the async-native equivalent the teacher's own
//! code reaches for (`tokio::spawn` background loops in `service.rs`).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::types::StateReason;
use crate::vm::Vm;

/// Coarse event kind (§4.9: "started/stopped/suspended/resumed/
/// defined/undefined/block-job/...").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Defined,
    Undefined,
    Started,
    Stopped,
    Suspended,
    Resumed,
    Crashed,
    PmSuspended,
    BlockJob,
}

/// A delivered event. `detail` reuses [`StateReason`] as the numeric
/// detail code the specification calls for, since the reason vocabulary
/// already covers every detail value events need (`booted`,
/// `destroyed`, `paused-for-migration`, ...).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Event {
    pub vm_uuid: Uuid,
    pub vm_name: String,
    pub kind: EventKind,
    pub detail: StateReason,
    /// Per-VM monotonic sequence number, assigned at enqueue time.
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct SeqTable {
    next: HashMap<Uuid, u64>,
}

impl SeqTable {
    fn next(&mut self, vm: Uuid) -> u64 {
        let entry = self.next.entry(vm).or_insert(0);
        let seq = *entry;
        *entry += 1;
        seq
    }
}

/// Work submitted to the single watchdog/auto-dump worker (§4.9).
pub struct DumpWork {
    pub vm: Arc<Vm>,
    pub dump_path: std::path::PathBuf,
}

/// The event bus plus its worker pool.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    seq: StdMutex<SeqTable>,
    worker_tx: mpsc::Sender<DumpWork>,
}

impl EventBus {
    /// Create the bus and spawn its single worker task (§4.10 step 7).
    /// `dump_fn` performs the actual dump-to-file + resume sequence;
    /// it is injected so the bus itself stays free of monitor-session
    /// dependencies (kept in `context.rs`, which wires the closure).
    pub fn new<F>(channel_capacity: usize, worker_queue: usize, dump_fn: F) -> Self
    where
        F: Fn(DumpWork) -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let (sender, _rx) = broadcast::channel(channel_capacity.max(16));
        let (worker_tx, mut worker_rx) = mpsc::channel::<DumpWork>(worker_queue.max(1));
        let dump_fn = Arc::new(dump_fn);

        tokio::spawn(async move {
            while let Some(work) = worker_rx.recv().await {
                let vm_uuid = work.vm.uuid;
                if let Err(e) = (dump_fn)(work).await {
                    error!(vm = %vm_uuid, error = %e, "auto-dump worker item failed");
                }
            }
            info!("auto-dump worker queue closed");
        });

        Self {
            sender,
            seq: StdMutex::new(SeqTable::default()),
            worker_tx,
        }
    }

    /// Subscribe to the bus; the snapshot-then-process pattern (§4.9,
    /// §9 re-architecture note on `virHashForEach`) is realized here by
    /// `broadcast::Receiver` owning its own cursor rather than the
    /// caller walking a shared list under a lock.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Enqueue one event. Never fails even with zero subscribers — a
    /// `SendError` from `broadcast::Sender::send` only means nobody is
    /// listening right now, which is not an error condition here.
    #[instrument(skip(self), fields(vm = %vm_uuid, ?kind, ?detail))]
    pub fn emit(&self, vm_uuid: Uuid, vm_name: &str, kind: EventKind, detail: StateReason) {
        let seq = self.seq.lock().expect("seq table poisoned").next(vm_uuid);
        let event = Event {
            vm_uuid,
            vm_name: vm_name.to_string(),
            kind,
            detail,
            seq,
            timestamp: chrono::Utc::now(),
        };
        let _ = self.sender.send(event);
    }

    /// Enqueue the two paused-start events in order (§5 ordering
    /// guarantee: "started" then "suspended", both must be delivered
    /// and in that order).
    pub fn emit_paused_start(&self, vm_uuid: Uuid, vm_name: &str) {
        self.emit(vm_uuid, vm_name, EventKind::Started, StateReason::Booted);
        self.emit(
            vm_uuid,
            vm_name,
            EventKind::Suspended,
            StateReason::PausedByUser,
        );
    }

    /// Submit watchdog/auto-dump work (§4.9). The VM's `Arc` strong
    /// count is the refcount the specification refers to: holding
    /// `work.vm` in the channel keeps the VM alive until the worker
    /// finishes, which is the refcount-increment-on-enqueue /
    /// decrement-on-completion behavior expressed without a manual
    /// counter.
    pub async fn submit_dump(&self, work: DumpWork) -> Result<()> {
        self.worker_tx.send(work).await.map_err(|_| {
            crate::error::DriverError::InternalError("auto-dump worker is gone".into())
        })
    }

    pub fn try_submit_dump(&self, work: DumpWork) {
        if self.worker_tx.try_send(work).is_err() {
            warn!("auto-dump worker queue full or closed; dropping watchdog dump request");
        }
    }
}
