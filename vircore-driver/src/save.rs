//! Save/restore engine (C6, §4.6).
//!
//! The on-disk header is bit-exact with the specification's layout so
//! existing save images stay loadable across implementations: 16-byte
//! magic, four `u32` fields, 15 reserved `u32`s, all little-endian, with
//! a byte-swap-and-retry fallback on load for images written on a
//! big-endian host.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, instrument};

use crate::error::{DriverError, Result};
use crate::interfaces::{MonitorCommand, XmlCodec};
use crate::job::{begin_async_job, AsyncJobGuard};
use crate::lifecycle;
use crate::monitor::MonitorSession;
use crate::paths::StatePaths;
use crate::types::{AsyncJobKind, Compression, DomainDefinition, StateReason, VmState};
use crate::vm::Vm;

pub const MAGIC_COMPLETE: &[u8; 16] = b"LibvirtQemudSave";
pub const MAGIC_PARTIAL: &[u8; 16] = b"LibvirtQemudPart";
pub const CURRENT_VERSION: u32 = 2;
/// 16 (magic) + 4 * 4 (version/xml_len/was_running/compressed) + 15 * 4
/// (reserved) = 92 bytes (§6 offsets 0..91).
pub const HEADER_LEN: usize = 16 + 4 * 4 + 15 * 4;
const MIN_SLACK: usize = 1024;
const ALIGN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveHeader {
    pub complete: bool,
    pub version: u32,
    pub xml_len: u32,
    pub was_running: bool,
    pub compressed: Compression,
}

impl SaveHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let magic = if self.complete { MAGIC_COMPLETE } else { MAGIC_PARTIAL };
        buf[0..16].copy_from_slice(magic);
        buf[16..20].copy_from_slice(&self.version.to_le_bytes());
        buf[20..24].copy_from_slice(&self.xml_len.to_le_bytes());
        buf[24..28].copy_from_slice(&(self.was_running as u32).to_le_bytes());
        buf[28..32].copy_from_slice(&(self.compressed as u32).to_le_bytes());
        // bytes 32..91 (15 reserved u32s) are already zero.
        buf
    }

    /// Decode a header, applying the byte-swap-and-retry fallback from
    /// §6 ("if version > current, attempt a single header byte-swap and
    /// retry; if still > current, reject").
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(DriverError::SaveImageCorrupt("header truncated".into()));
        }
        let magic = &buf[0..16];
        let complete = if magic == MAGIC_COMPLETE {
            true
        } else if magic == MAGIC_PARTIAL {
            false
        } else {
            return Err(DriverError::SaveImageCorrupt("bad magic".into()));
        };

        let mut version = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let mut xml_len = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let mut was_running = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        let mut compressed = u32::from_le_bytes(buf[28..32].try_into().unwrap());

        if version > CURRENT_VERSION {
            version = version.swap_bytes();
            xml_len = xml_len.swap_bytes();
            was_running = was_running.swap_bytes();
            compressed = compressed.swap_bytes();
            if version > CURRENT_VERSION {
                return Err(DriverError::SaveImageCorrupt(format!(
                    "unsupported version {version} after byte-swap retry"
                )));
            }
        }

        if xml_len == 0 {
            return Err(DriverError::SaveImageCorrupt("xml_len is zero".into()));
        }

        let compressed = Compression::from_u32(compressed)
            .ok_or_else(|| DriverError::SaveImageCorrupt(format!("bad compression code {compressed}")))?;

        if !complete {
            return Err(DriverError::SaveImageIncomplete);
        }

        Ok(Self {
            complete,
            version,
            xml_len,
            was_running: was_running != 0,
            compressed,
        })
    }
}

/// XML region length including NUL padding, rounded so that
/// `header + xml_len + padding` is a multiple of 512 with at least 1024
/// bytes of slack past the XML content (§6).
pub fn padded_xml_region_len(xml_len: usize) -> usize {
    let minimum = HEADER_LEN + xml_len + MIN_SLACK;
    minimum.div_ceil(ALIGN) * ALIGN - HEADER_LEN
}

/// Options controlling one save operation.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub bypass_cache: bool,
    pub compression: Compression,
}

/// Run the save protocol (§4.6 steps 1-9) against `path`.
#[instrument(skip(vm, codec, session), fields(vm = %vm.uuid, path = %path.display()))]
pub async fn save(
    vm: &std::sync::Arc<Vm>,
    codec: &dyn XmlCodec,
    session: &MonitorSession,
    paths: &StatePaths,
    bus: &crate::events::EventBus,
    path: &Path,
    options: SaveOptions,
) -> Result<()> {
    {
        let inner = vm.lock().await;
        if !inner.block_copy_active.is_empty() {
            return Err(DriverError::BlockCopyActive);
        }
    }

    let guard = begin_async_job(vm, AsyncJobKind::Save).await?;
    let result = save_inner(vm, &guard, codec, session, paths, bus, path, &options).await;
    guard.end().await;
    result
}

async fn save_inner(
    vm: &std::sync::Arc<Vm>,
    guard: &AsyncJobGuard,
    codec: &dyn XmlCodec,
    session: &MonitorSession,
    paths: &StatePaths,
    bus: &crate::events::EventBus,
    path: &Path,
    options: &SaveOptions,
) -> Result<()> {
    let was_running = {
        let inner = vm.lock().await;
        matches!(inner.state, VmState::Running | VmState::Blocked)
    };

    if was_running {
        let mut inner = vm.lock().await;
        lifecycle::transition(
            &mut inner,
            paths,
            bus,
            VmState::Paused,
            StateReason::PausedForSave,
            None,
        )
        .await?;
    }

    let save_result = write_save_file(vm, guard, codec, session, path, options, was_running).await;

    match save_result {
        Ok(()) => {
            let mut inner = vm.lock().await;
            lifecycle::transition(
                &mut inner,
                paths,
                bus,
                VmState::Shutoff,
                StateReason::Saved,
                None,
            )
            .await?;
            Ok(())
        }
        Err(e) => {
            // §4.6 step 9: on failure after pausing, resume if we were
            // the ones who paused it.
            if was_running {
                let mut inner = vm.lock().await;
                if inner.state == VmState::Paused {
                    let resumed = lifecycle::transition(
                        &mut inner,
                        paths,
                        bus,
                        VmState::Running,
                        StateReason::Unknown,
                        None,
                    )
                    .await;
                    if resumed.is_err() {
                        let _ = lifecycle::transition(
                            &mut inner,
                            paths,
                            bus,
                            VmState::Paused,
                            StateReason::SuspendedApiError,
                            None,
                        )
                        .await;
                    }
                }
            }
            Err(e)
        }
    }
}

async fn write_save_file(
    vm: &std::sync::Arc<Vm>,
    guard: &AsyncJobGuard,
    codec: &dyn XmlCodec,
    session: &MonitorSession,
    path: &Path,
    options: &SaveOptions,
    was_running: bool,
) -> Result<()> {
    let def = {
        let inner = vm.lock().await;
        inner.def.to_migratable()
    };
    let xml = codec.render(&def)?;
    let xml_bytes = xml.as_bytes();
    let region_len = padded_xml_region_len(xml_bytes.len());

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(DriverError::SystemError)?;

    let header = SaveHeader {
        complete: false,
        version: CURRENT_VERSION,
        xml_len: xml_bytes.len() as u32,
        was_running,
        compressed: options.compression,
    };
    file.write_all(&header.encode()).await.map_err(DriverError::SystemError)?;
    file.write_all(xml_bytes).await.map_err(DriverError::SystemError)?;
    let padding = region_len - xml_bytes.len();
    file.write_all(&vec![0u8; padding]).await.map_err(DriverError::SystemError)?;
    file.flush().await.map_err(DriverError::SystemError)?;
    drop(file);

    let offset = (HEADER_LEN + region_len) as u64;
    let reply = session
        .call(
            vm,
            MonitorCommand::new("save_virtual_memory").with_args(serde_json::json!({
                "path": path.to_string_lossy(),
                "offset": offset,
                "bypass_cache": options.bypass_cache,
            })),
        )
        .await;

    if guard.aborted() {
        return Err(DriverError::OperationAborted);
    }
    reply?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(DriverError::SystemError)?;
    file.seek(std::io::SeekFrom::Start(0)).await.map_err(DriverError::SystemError)?;
    let complete_header = SaveHeader { complete: true, ..header };
    file.write_all(&complete_header.encode()).await.map_err(DriverError::SystemError)?;
    file.flush().await.map_err(DriverError::SystemError)?;

    info!(path = %path.display(), "save image finalized");
    Ok(())
}

/// Managed-save file path for `vm_name` (§4.6 "Managed save").
pub fn managed_save_path(paths: &StatePaths, vm_name: &str) -> std::path::PathBuf {
    paths.managed_save_file(vm_name)
}

pub async fn managed_save(
    vm: &std::sync::Arc<Vm>,
    codec: &dyn XmlCodec,
    session: &MonitorSession,
    paths: &StatePaths,
    bus: &crate::events::EventBus,
) -> Result<()> {
    let name = vm.lock().await.def.name.clone();
    let path = managed_save_path(paths, &name);
    save(vm, codec, session, paths, bus, &path, SaveOptions::default()).await?;
    vm.lock().await.has_managed_save = true;
    Ok(())
}

/// Options controlling restore; `force_state` overrides the header's
/// `was_running` flag (§4.6 step 5, scenario 3's "override flag paused").
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub replacement_xml: Option<String>,
    pub force_paused: bool,
    pub unlink_corrupt: bool,
}

/// Result of reading just the header + XML, before any hypervisor
/// process is started — split out so restore can be driven by
/// `context.rs`, which owns process startup.
pub struct RestorePlan {
    pub header: SaveHeader,
    pub def: DomainDefinition,
    pub data_offset: u64,
}

/// Read and validate a save image's header and XML region (§4.6 restore
/// steps 1-2). Does not start the hypervisor process or touch the file
/// beyond this prefix.
#[instrument(skip(codec), fields(path = %path.display()))]
pub async fn plan_restore(
    codec: &dyn XmlCodec,
    path: &Path,
    options: &RestoreOptions,
) -> Result<RestorePlan> {
    let mut file = tokio::fs::File::open(path).await.map_err(DriverError::SystemError)?;
    let mut header_buf = [0u8; HEADER_LEN];
    file.read_exact(&mut header_buf).await.map_err(DriverError::SystemError)?;

    let header = match SaveHeader::decode(&header_buf) {
        Err(DriverError::SaveImageIncomplete) if options.unlink_corrupt => {
            drop(file);
            tokio::fs::remove_file(path).await.ok();
            return Err(DriverError::SaveImageIncomplete);
        }
        other => other?,
    };

    let region_len = padded_xml_region_len(header.xml_len as usize);
    let mut xml_buf = vec![0u8; header.xml_len as usize];
    file.read_exact(&mut xml_buf).await.map_err(DriverError::SystemError)?;
    let xml = String::from_utf8(xml_buf)
        .map_err(|e| DriverError::SaveImageCorrupt(format!("xml not utf-8: {e}")))?;
    let def = codec.parse(&xml)?;

    if let Some(replacement) = &options.replacement_xml {
        let replacement_def = codec.parse(replacement)?;
        if !def.abi_stable_equivalent(&replacement_def) {
            return Err(DriverError::InvalidArgument(
                "replacement XML is not ABI-stable with the saved definition".into(),
            ));
        }
    }

    Ok(RestorePlan {
        header,
        def,
        data_offset: (HEADER_LEN + region_len) as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = SaveHeader {
            complete: true,
            version: CURRENT_VERSION,
            xml_len: 123,
            was_running: true,
            compressed: Compression::Gzip,
        };
        let bytes = header.encode();
        let decoded = SaveHeader::decode(&bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn rejects_partial_magic() {
        let header = SaveHeader {
            complete: false,
            version: CURRENT_VERSION,
            xml_len: 10,
            was_running: false,
            compressed: Compression::Raw,
        };
        let bytes = header.encode();
        let err = SaveHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, DriverError::SaveImageIncomplete));
    }

    #[test]
    fn rejects_zero_xml_len() {
        let header = SaveHeader {
            complete: true,
            version: CURRENT_VERSION,
            xml_len: 0,
            was_running: false,
            compressed: Compression::Raw,
        };
        let bytes = header.encode();
        let err = SaveHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, DriverError::SaveImageCorrupt(_)));
    }

    #[test]
    fn byte_swap_retry_recovers_big_endian_header() {
        let header = SaveHeader {
            complete: true,
            version: CURRENT_VERSION,
            xml_len: 50,
            was_running: true,
            compressed: Compression::Xz,
        };
        let mut bytes = header.encode();
        // Simulate a big-endian writer: swap the four u32 fields.
        for field in bytes[16..32].chunks_mut(4) {
            field.reverse();
        }
        let decoded = SaveHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn padding_respects_minimum_slack_and_alignment() {
        let len = padded_xml_region_len(10);
        assert_eq!((HEADER_LEN + len) % ALIGN, 0);
        assert!(len - 10 >= MIN_SLACK);
    }
}
