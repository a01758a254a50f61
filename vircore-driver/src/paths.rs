//! Persisted state layout (§6).
//!
//! Everything the core owns on disk lives under one base directory, in
//! the same shape libvirt-derived drivers use: a `state/` tree for
//! ephemeral per-process records and a `config/` tree for definitions
//! that must survive a reboot, plus dedicated trees for save images,
//! snapshot metadata, auto-dumps and autostart symlinks.

use std::path::{Path, PathBuf};

/// Resolved set of directories the driver context creates and uses.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub config_dir: PathBuf,
    pub autostart_dir: PathBuf,
    pub save_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub dump_dir: PathBuf,
    pub log_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub lib_dir: PathBuf,
}

impl StatePaths {
    /// Derive the standard layout under `base`, matching the
    /// privileged (`/var/lib/vircore`-style) or per-user base a
    /// deployment chooses.
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            state_dir: base.join("run"),
            config_dir: base.join("config"),
            autostart_dir: base.join("autostart"),
            save_dir: base.join("save"),
            snapshot_dir: base.join("snapshot"),
            dump_dir: base.join("dump"),
            log_dir: base.join("log"),
            cache_dir: base.join("cache"),
            lib_dir: base.join("lib"),
        }
    }

    /// All directories, for the create-directories startup step
    /// (§4.10 step 1).
    pub fn all(&self) -> [&Path; 9] {
        [
            &self.state_dir,
            &self.config_dir,
            &self.autostart_dir,
            &self.save_dir,
            &self.snapshot_dir,
            &self.dump_dir,
            &self.log_dir,
            &self.cache_dir,
            &self.lib_dir,
        ]
    }

    pub fn status_file(&self, vm_name: &str) -> PathBuf {
        self.state_dir.join(format!("{vm_name}.xml"))
    }

    pub fn config_file(&self, vm_name: &str) -> PathBuf {
        self.config_dir.join(format!("{vm_name}.xml"))
    }

    pub fn autostart_file(&self, vm_name: &str) -> PathBuf {
        self.autostart_dir.join(format!("{vm_name}.xml"))
    }

    pub fn managed_save_file(&self, vm_name: &str) -> PathBuf {
        self.save_dir.join(format!("{vm_name}.save"))
    }

    pub fn snapshot_dir_for(&self, vm_name: &str) -> PathBuf {
        self.snapshot_dir.join(vm_name)
    }

    pub fn snapshot_file(&self, vm_name: &str, snapshot_name: &str) -> PathBuf {
        self.snapshot_dir_for(vm_name)
            .join(format!("{snapshot_name}.xml"))
    }

    /// `dump/<vm-name>-<epoch>` (§6); `epoch` is passed in rather than
    /// computed here so callers control the time source.
    pub fn dump_file(&self, vm_name: &str, epoch_secs: u64) -> PathBuf {
        self.dump_dir.join(format!("{vm_name}-{epoch_secs}"))
    }

    /// Create every directory in [`Self::all`], matching §4.10 step 1.
    pub async fn create_all(&self) -> std::io::Result<()> {
        for dir in self.all() {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// Default connection-URI-derived privilege level; the core does not
/// parse connection URIs itself (that belongs to the out-of-scope
/// connection layer) but exposes the default roots so a front end can
/// pick one without re-deriving the convention.
pub fn default_base_dir(privileged: bool) -> PathBuf {
    if privileged {
        PathBuf::from("/var/lib/vircore")
    } else {
        dirs_home().join(".local/share/vircore")
    }
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}
