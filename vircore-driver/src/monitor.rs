//! Control-socket session (C4, §4.4).
//!
//! [`MonitorSession`] implements the enter/exit-monitor discipline from
//! §4.2 on top of a [`MonitorTransport`]: stamp `monitor_start`, release
//! the VM mutex, issue the request, reacquire, clear `monitor_start`,
//! and — resolving the open question about the HMP path not
//! re-checking VM activity (§9) — always re-check that an async job is
//! still active and that abort wasn't requested while the call was in
//! flight, converting either condition to `OperationAborted`.
//!
//! Two reference transports ship for testing, mirroring the teacher's
//! habit of pairing a real backend with a `MockBackend` behind the same
//! trait (`libvirt/backend.rs` next to `mock.rs`).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as TokioMutex;
use tracing::{instrument, warn};

use crate::error::{DriverError, Result};
use crate::interfaces::{MonitorCommand, MonitorTransport};
use crate::vm::Vm;

/// Drives enter/exit-monitor around a single transport (§4.4).
pub struct MonitorSession {
    transport: Arc<dyn MonitorTransport>,
    timeout: Duration,
}

impl MonitorSession {
    pub fn new(transport: Arc<dyn MonitorTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn transport(&self) -> &Arc<dyn MonitorTransport> {
        &self.transport
    }

    /// Issue `cmd`, observing the Enter-monitor/Exit-monitor contract.
    /// Callers must already hold a sync or async job on `vm` (§4.2);
    /// this function does not itself begin one.
    #[instrument(skip(self, vm, cmd), fields(vm = %vm.uuid, verb = %cmd.verb))]
    pub async fn call(&self, vm: &Arc<Vm>, cmd: MonitorCommand) -> Result<Value> {
        let (abort, had_async_job) = {
            let mut inner = vm.lock().await;
            inner.job.monitor_start = Some(Instant::now());
            (
                inner.job.abort.clone(),
                inner.job.async_kind != crate::types::AsyncJobKind::None,
            )
        };

        let outcome = tokio::time::timeout(self.timeout, self.transport.request(cmd)).await;

        let mut inner = vm.lock().await;
        inner.job.monitor_start = None;
        let async_job_vanished = had_async_job && inner.job.async_kind == crate::types::AsyncJobKind::None;
        drop(inner);

        if async_job_vanished {
            warn!(vm = %vm.uuid, "async job no longer active after monitor call; discarding reply");
            return Err(DriverError::OperationAborted);
        }
        if abort.load(Ordering::SeqCst) {
            return Err(DriverError::OperationAborted);
        }

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DriverError::MonitorIO("reply timed out".into())),
        }
    }

    pub async fn is_alive(&self) -> bool {
        self.transport.is_alive().await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

/// Line-oriented legacy text transport: one request, one reply line,
/// no correlation id (§6 "line-oriented text (legacy)").
pub struct TextTransport<S> {
    io: TokioMutex<BufReader<S>>,
    alive: std::sync::atomic::AtomicBool,
}

impl<S> TextTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: S) -> Self {
        Self {
            io: TokioMutex::new(BufReader::new(io)),
            alive: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

#[async_trait::async_trait]
impl<S> MonitorTransport for TextTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn request(&self, cmd: MonitorCommand) -> Result<Value> {
        let mut io = self.io.lock().await;
        let line = format!("{} {}\n", cmd.verb, cmd.args);
        io.get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DriverError::MonitorIO(e.to_string()))?;
        let mut reply = String::new();
        let n = io
            .read_line(&mut reply)
            .await
            .map_err(|e| DriverError::MonitorIO(e.to_string()))?;
        if n == 0 {
            self.alive.store(false, Ordering::SeqCst);
            return Err(DriverError::MonitorIO("connection closed".into()));
        }
        Ok(Value::String(reply.trim_end().to_string()))
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Newline-delimited JSON transport with a correlation id (§6 "current"
/// mode). Only one outstanding request at a time, matching the
/// specification; enforced here by the session mutex rather than by a
/// pending-reply table, since this core only ever issues one request
/// per `MonitorSession::call`.
pub struct JsonTransport<S> {
    io: TokioMutex<BufReader<S>>,
    next_id: std::sync::atomic::AtomicU64,
    alive: std::sync::atomic::AtomicBool,
}

impl<S> JsonTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: S) -> Self {
        Self {
            io: TokioMutex::new(BufReader::new(io)),
            next_id: std::sync::atomic::AtomicU64::new(1),
            alive: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

#[async_trait::async_trait]
impl<S> MonitorTransport for JsonTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn request(&self, cmd: MonitorCommand) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = serde_json::json!({
            "id": id,
            "execute": cmd.verb,
            "arguments": cmd.args,
        });
        let mut io = self.io.lock().await;
        let mut line = serde_json::to_string(&envelope)
            .map_err(|e| DriverError::MonitorIO(e.to_string()))?;
        line.push('\n');
        io.get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DriverError::MonitorIO(e.to_string()))?;

        let mut reply_line = String::new();
        let n = io
            .read_line(&mut reply_line)
            .await
            .map_err(|e| DriverError::MonitorIO(e.to_string()))?;
        if n == 0 {
            self.alive.store(false, Ordering::SeqCst);
            return Err(DriverError::MonitorIO("connection closed".into()));
        }
        let reply: Value = serde_json::from_str(reply_line.trim_end())
            .map_err(|e| DriverError::MonitorIO(format!("malformed reply: {e}")))?;

        if let Some(err) = reply.get("error") {
            return Err(DriverError::MonitorIO(err.to_string()));
        }
        Ok(reply.get("return").cloned().unwrap_or(Value::Null))
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
