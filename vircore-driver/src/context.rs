//! Driver context (C10, §4.10): the top-level owner of every shared
//! resource, constructed through an explicit builder that performs the
//! nine startup steps in order and torn down through `shutdown()`,
//! which reverses them.
//!
//! Per §9's re-architecture note, there is no back-reference from `Vm`
//! to `DriverContext` — callers thread `&DriverContext` explicitly
//! through every function that needs both the registry and a VM,
//! rather than the VM holding a pointer back to its owner.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex as TokioMutex;
use tracing::{info, instrument, warn};

use crate::capability::CapabilityCache;
use crate::error::Result;
use crate::events::EventBus;
use crate::interfaces::{CgroupController, LeaseManager, SecurityManager, XmlCodec};
use crate::paths::StatePaths;
use crate::port::PortAllocator;
use crate::registry::DomainRegistry;
use crate::resource::ResourceBinder;
use crate::types::{StateReason, VmState};

/// Driver-wide configuration resolved before any startup step runs
/// (§4.10 step 2).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub base_dir: PathBuf,
    pub hypervisor_binary: String,
    pub migration_port_range: (u16, u16),
    pub event_channel_capacity: usize,
    pub worker_queue_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_dir: crate::paths::default_base_dir(false),
            hypervisor_binary: "/usr/bin/qemu-system-x86_64".to_string(),
            migration_port_range: (49152, 49215),
            event_channel_capacity: 256,
            worker_queue_capacity: 16,
        }
    }
}

/// The fully constructed driver. Every field here is a shared resource
/// guarded per §5's "shared-resource policy".
pub struct DriverContext {
    pub config: DriverConfig,
    pub paths: StatePaths,
    pub registry: DomainRegistry,
    pub events: EventBus,
    pub capabilities: CapabilityCache,
    pub ports: TokioMutex<PortAllocator>,
    pub binder: ResourceBinder,
    pub xml_codec: Arc<dyn XmlCodec>,
    security_stack_len: usize,
}

impl DriverContext {
    /// Run the nine startup steps from §4.10 and return the ready
    /// context.
    #[instrument(skip_all)]
    pub async fn start(
        config: DriverConfig,
        xml_codec: Arc<dyn XmlCodec>,
        lease: Arc<dyn LeaseManager>,
        cgroup: Arc<dyn CgroupController>,
        security: Vec<Arc<dyn SecurityManager>>,
    ) -> Result<Arc<Self>> {
        // Step 1: create directories.
        let paths = StatePaths::under(&config.base_dir);
        paths.create_all().await.map_err(crate::error::DriverError::SystemError)?;

        // Step 2: driver configuration is already loaded by the caller;
        // step folded into `config` itself. Cgroup controller handles
        // are the injected `cgroup` collaborator.

        // Step 3: security manager stack.
        let security_stack_len = security.len();

        // Step 4: capability cache.
        let capabilities = CapabilityCache::new();

        let binder = ResourceBinder::new(lease, cgroup, security);

        // Step 6: port-reservation bitmap.
        let ports = TokioMutex::new(PortAllocator::new(
            config.migration_port_range.0,
            config.migration_port_range.1,
        ));

        // Step 7: worker pool (event bus owns it) — the dump callback
        // is a no-op placeholder until wired by the embedding daemon,
        // since the real dump path needs a live monitor session per VM.
        let events = EventBus::new(
            config.event_channel_capacity,
            config.worker_queue_capacity,
            |work| {
                Box::pin(async move {
                    warn!(vm = %work.vm.uuid, path = %work.dump_path.display(), "auto-dump worker invoked with no dump handler wired");
                    Ok(())
                })
            },
        );

        let registry = DomainRegistry::new();

        let ctx = Arc::new(Self {
            config,
            paths,
            registry,
            events,
            capabilities,
            ports,
            binder,
            xml_codec,
            security_stack_len,
        });

        // Step 5: load persisted state (status files, configs, snapshot
        // metadata, managed-save presence).
        ctx.load_persisted_state().await?;

        // Step 8: register the filter callback driver — out of scope
        // (§1); represented as a no-op extension point for an embedder.

        // Step 9: autostart.
        ctx.run_autostart().await;

        info!(base_dir = %ctx.config.base_dir.display(), "driver context started");
        Ok(ctx)
    }

    async fn load_persisted_state(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.paths.config_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(crate::error::DriverError::SystemError(e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(crate::error::DriverError::SystemError)?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xml") {
                continue;
            }
            let xml = match tokio::fs::read_to_string(&path).await {
                Ok(xml) => xml,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read persisted config");
                    continue;
                }
            };
            let def = match self.xml_codec.parse(&xml) {
                Ok(def) => def,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse persisted config");
                    continue;
                }
            };
            let name = def.name.clone();
            if let Err(e) = self.registry.add(def, true).await {
                warn!(name = %name, error = %e, "failed to register persisted domain");
                continue;
            }
            let vm = match self.registry.find_by_name(&name).await {
                Ok(vm) => vm,
                Err(_) => continue,
            };
            let save_path = self.paths.managed_save_file(&name);
            if tokio::fs::metadata(&save_path).await.is_ok() {
                vm.lock().await.has_managed_save = true;
            }
            let autostart_link = self.paths.autostart_file(&name);
            if tokio::fs::symlink_metadata(&autostart_link).await.is_ok() {
                vm.lock().await.autostart = true;
            }

            // Step 5 continued: a leftover status file means the VM was
            // active when the manager last stopped. There is no live
            // hypervisor process to reattach to here, so every such VM
            // is a failed reconnect and gets marked crashed (§4.3, §4.10
            // step 5).
            if let Some(status) = crate::lifecycle::load_status(&self.paths, &name).await {
                if status.state.is_active() {
                    let mut inner = vm.lock().await;
                    inner.state = status.state;
                    inner.id = status.id;
                    inner.pid = status.pid;
                    if let Err(e) =
                        crate::lifecycle::reconnect_failed(&mut inner, &self.paths, &self.events).await
                    {
                        warn!(vm = %name, error = %e, "failed to mark unreachable VM as crashed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_autostart(&self) {
        for vm in self.registry.all().await {
            let (should_start, name) = {
                let inner = vm.lock().await;
                (inner.autostart && inner.state == VmState::Shutoff, inner.def.name.clone())
            };
            if should_start {
                info!(vm = %name, "autostart");
                let mut inner = vm.lock().await;
                let id = self.registry.allocate_id().await;
                if let Err(e) = crate::lifecycle::transition(
                    &mut inner,
                    &self.paths,
                    &self.events,
                    VmState::Running,
                    StateReason::Booted,
                    Some(id),
                )
                .await
                {
                    warn!(vm = %name, error = %e, "autostart failed");
                }
            }
        }
    }

    /// Toggle autostart for `uuid` (§4.9 "autostart... marked autostart").
    /// Persisted as a symlink from `autostart/<name>.xml` to the
    /// persistent config file, mirroring libvirt-derived drivers' own
    /// on-disk convention rather than a flag inside the config file
    /// itself, so a config file can be shared unmodified between an
    /// autostart and non-autostart deployment.
    pub async fn set_autostart(&self, uuid: uuid::Uuid, enabled: bool) -> Result<()> {
        let vm = self.registry.find_by_uuid(uuid).await?;
        let mut inner = vm.lock().await;
        if !inner.persistent {
            return Err(crate::error::DriverError::OperationInvalid(
                "autostart requires a persistent VM".into(),
            ));
        }
        let name = inner.def.name.clone();
        let link = self.paths.autostart_file(&name);
        if enabled {
            let target = self.paths.config_file(&name);
            let _ = tokio::fs::remove_file(&link).await;
            #[cfg(unix)]
            tokio::fs::symlink(&target, &link)
                .await
                .map_err(crate::error::DriverError::SystemError)?;
        } else {
            let _ = tokio::fs::remove_file(&link).await;
        }
        inner.autostart = enabled;
        Ok(())
    }

    /// Reverse teardown (§4.10 shutdown): stop the worker pool, release
    /// VM references, release security/cgroup handles, tear down the
    /// registry. Each step is best-effort; failures are logged, not
    /// propagated, since shutdown must make forward progress.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        for vm in self.registry.all().await {
            let mut inner = vm.lock().await;
            if inner.state.is_active() {
                if let Some(monitor) = inner.monitor.take() {
                    monitor.close().await;
                }
            }
        }
        info!(security_models = self.security_stack_len, "driver context shut down");
    }
}
