//! GPU compute process inventory.
//!
//! Two sources are provided: [`NvmlInventory`] talks to the driver through
//! NVML, [`NvidiaSmiInventory`] shells out to `nvidia-smi` and parses its CSV
//! output. Both report a full snapshot or an error, never a partial view.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::Mutex;

use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::RegulatorError;
use crate::error::Result;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// One compute process as reported by the GPU accounting layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProcess {
    pub device_id: String,
    pub pid: u32,
    pub memory_used_mb: u64,
}

pub trait InventorySource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Returns every active compute process on every device.
    fn query(&self) -> Result<Vec<RawProcess>>;
}

/// Inventory backed by NVML. The library is loaded on first use and the
/// load is retried on later queries if it failed.
#[derive(Default)]
pub struct NvmlInventory {
    nvml: Mutex<Option<Arc<Nvml>>>,
}

impl NvmlInventory {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self) -> Result<Arc<Nvml>> {
        let mut guard = self
            .nvml
            .lock()
            .map_err(|_| RegulatorError::Unexpected("nvml handle lock poisoned".to_string()))?;
        if let Some(nvml) = guard.as_ref() {
            return Ok(Arc::clone(nvml));
        }
        let nvml = Arc::new(init_nvml()?);
        *guard = Some(Arc::clone(&nvml));
        Ok(nvml)
    }
}

fn init_nvml() -> Result<Nvml> {
    match Nvml::init() {
        Ok(nvml) => {
            info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()?;
            info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}

impl InventorySource for NvmlInventory {
    fn name(&self) -> &'static str {
        "nvml"
    }

    fn query(&self) -> Result<Vec<RawProcess>> {
        let nvml = self.handle()?;
        let mut processes = Vec::new();

        for i in 0..nvml.device_count()? {
            let device = nvml.device_by_index(i)?;
            let device_id = device.uuid()?;

            for process_info in device.running_compute_processes()? {
                match process_info.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => processes.push(RawProcess {
                        device_id: device_id.clone(),
                        pid: process_info.pid,
                        memory_used_mb: bytes / BYTES_PER_MB,
                    }),
                    UsedGpuMemory::Unavailable => {
                        let err = RegulatorError::MalformedRecord {
                            line: format!("{device_id},{}", process_info.pid),
                            reason: "used memory unavailable".to_string(),
                        };
                        warn!(error = %err, "Discarding inventory record");
                    }
                }
            }
        }

        debug!(count = processes.len(), "Queried NVML compute processes");
        Ok(processes)
    }
}

/// Inventory backed by the `nvidia-smi` command line tool.
pub struct NvidiaSmiInventory {
    binary: PathBuf,
}

impl NvidiaSmiInventory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl InventorySource for NvidiaSmiInventory {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    fn query(&self) -> Result<Vec<RawProcess>> {
        let output = Command::new(&self.binary)
            .args([
                "--query-compute-apps=gpu_uuid,pid,used_gpu_memory",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| RegulatorError::SourceUnavailable {
                source_name: self.name(),
                reason: format!("cannot execute {}: {e}", self.binary.display()),
            })?;

        if !output.status.success() {
            return Err(RegulatorError::SourceUnavailable {
                source_name: self.name(),
                reason: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(parse_csv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses `gpu_uuid, pid, used_gpu_memory` lines, dropping any that do not parse.
pub fn parse_csv(output: &str) -> Vec<RawProcess> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_line(line) {
            Ok(process) => Some(process),
            Err(err) => {
                warn!(error = %err, "Discarding inventory record");
                None
            }
        })
        .collect()
}

fn parse_line(line: &str) -> Result<RawProcess> {
    let malformed = |reason: String| RegulatorError::MalformedRecord {
        line: line.to_string(),
        reason,
    };

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [device_id, pid, memory] = fields.as_slice() else {
        return Err(malformed(format!("expected 3 fields, got {}", fields.len())));
    };

    if device_id.is_empty() {
        return Err(malformed("empty device id".to_string()));
    }
    let pid = pid
        .parse::<u32>()
        .map_err(|e| malformed(format!("invalid pid `{pid}`: {e}")))?;
    let memory_used_mb = memory
        .parse::<u64>()
        .map_err(|e| malformed(format!("invalid memory value `{memory}`: {e}")))?;

    Ok(RawProcess {
        device_id: device_id.to_string(),
        pid,
        memory_used_mb,
    })
}
