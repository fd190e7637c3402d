//! Device inventory scanner.
//!
//! Walks the FPGA class directories of sysfs and reports one entry per
//! accelerator port. Two driver layouts are understood:
//!
//! ```text
//! OPAE  class/fpga/intel-fpga-dev.N/intel-fpga-fme.N/pr/interface_id
//!       class/fpga/intel-fpga-dev.N/intel-fpga-port.N/afu_id
//! DFL   class/fpga_region/regionN/dfl-fme.N/dfl-fme-region.M/fpga_region/regionK/compat_id
//!       class/fpga_region/regionN/dfl-port.N/afu_id
//! ```
//!
//! A device that cannot be read is skipped and reported as a [`ScanError`];
//! it never fails the scan as a whole.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use api_types::FunctionId;
use api_types::InterfaceId;
use api_types::LogicalFunctionId;
use api_types::NamingError;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::config::PluginMode;

const OPAE_CLASS: &str = "class/fpga";
const OPAE_DEVICE_PREFIX: &str = "intel-fpga-dev.";
const OPAE_FME_PREFIX: &str = "intel-fpga-fme.";
const OPAE_PORT_PREFIX: &str = "intel-fpga-port.";

const DFL_CLASS: &str = "class/fpga_region";
const DFL_DEVICE_PREFIX: &str = "region";
const DFL_FME_PREFIX: &str = "dfl-fme.";
const DFL_FME_REGION_PREFIX: &str = "dfl-fme-region.";
const DFL_PORT_PREFIX: &str = "dfl-port.";

/// Node-local identifier of a port, e.g. `intel-fpga-port.0`.
///
/// This is also the device id reported to kubelet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RegionId(String);

impl RegionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reprogrammable region discovered in `region` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedRegion {
    pub id: RegionId,
    pub interface_id: InterfaceId,
    /// `None` when the port reports an all-zero AFU id.
    pub loaded: Option<FunctionId>,
    pub healthy: bool,
    pub device_node: PathBuf,
}

/// A preprogrammed port discovered in `af` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedFunction {
    pub id: RegionId,
    pub function: LogicalFunctionId,
    pub healthy: bool,
    pub device_node: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Discovered {
    Region(ScannedRegion),
    FixedFunction(ScannedFunction),
}

impl Discovered {
    pub fn id(&self) -> &RegionId {
        match self {
            Self::Region(region) => &region.id,
            Self::FixedFunction(function) => &function.id,
        }
    }
}

/// A device that could not be read. Logged and skipped.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid id in {path}: {source}")]
    InvalidId {
        path: PathBuf,
        #[source]
        source: NamingError,
    },
    #[error("device {device} has no management engine with an interface id")]
    NoInterface { device: PathBuf },
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub devices: Vec<Discovered>,
    pub errors: Vec<ScanError>,
}

/// Port found on one FPGA card, before mode-specific classification.
struct Port {
    name: String,
    afu_id: FunctionId,
    healthy: bool,
}

#[derive(Debug, Clone)]
pub struct Scanner {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    mode: PluginMode,
}

impl Scanner {
    pub fn new(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>, mode: PluginMode) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: dev_root.into(),
            mode,
        }
    }

    /// Enumerates every port under both driver layouts.
    ///
    /// Idempotent; unreadable devices end up in [`ScanOutcome::errors`].
    pub fn scan(&self) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        for layout in [Layout::Opae, Layout::Dfl] {
            let class_dir = self.sysfs_root.join(layout.class_dir());
            let Some(devices) = sorted_entries(&class_dir, layout.device_prefix()) else {
                debug!(path = %class_dir.display(), "fpga class directory not present");
                continue;
            };
            for device in devices {
                if let Err(e) = self.scan_device(layout, &device, &mut outcome) {
                    warn!("skipping fpga device: {e}");
                    outcome.errors.push(e);
                }
            }
        }

        outcome.devices.sort_by(|a, b| a.id().cmp(b.id()));
        outcome
    }

    fn scan_device(
        &self,
        layout: Layout,
        device: &Path,
        outcome: &mut ScanOutcome,
    ) -> Result<(), ScanError> {
        let ports = sorted_entries(device, layout.port_prefix()).unwrap_or_default();
        if ports.is_empty() {
            // DFL region directories without ports are the nested FME regions
            debug!(device = %device.display(), "no ports on fpga device");
            return Ok(());
        }

        let interface_id = layout.interface_id(device)?;

        for port_dir in ports {
            match read_port(&port_dir) {
                Ok(port) => outcome.devices.extend(self.classify(&interface_id, port)),
                Err(e) => {
                    warn!("skipping fpga port: {e}");
                    outcome.errors.push(e);
                }
            }
        }
        Ok(())
    }

    fn classify(&self, interface_id: &InterfaceId, port: Port) -> Option<Discovered> {
        let device_node = self.dev_root.join(&port.name);
        let id = RegionId::new(port.name);

        match self.mode {
            PluginMode::Region => Some(Discovered::Region(ScannedRegion {
                id,
                interface_id: interface_id.clone(),
                loaded: (!port.afu_id.is_blank()).then_some(port.afu_id),
                healthy: port.healthy,
                device_node,
            })),
            PluginMode::Af if port.afu_id.is_blank() => {
                debug!(port = %id, "unprogrammed port not offered in af mode");
                None
            }
            PluginMode::Af => Some(Discovered::FixedFunction(ScannedFunction {
                id,
                function: LogicalFunctionId::new(interface_id.clone(), port.afu_id),
                healthy: port.healthy,
                device_node,
            })),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Opae,
    Dfl,
}

impl Layout {
    fn class_dir(self) -> &'static str {
        match self {
            Self::Opae => OPAE_CLASS,
            Self::Dfl => DFL_CLASS,
        }
    }

    fn device_prefix(self) -> &'static str {
        match self {
            Self::Opae => OPAE_DEVICE_PREFIX,
            Self::Dfl => DFL_DEVICE_PREFIX,
        }
    }

    fn port_prefix(self) -> &'static str {
        match self {
            Self::Opae => OPAE_PORT_PREFIX,
            Self::Dfl => DFL_PORT_PREFIX,
        }
    }

    fn interface_id(self, device: &Path) -> Result<InterfaceId, ScanError> {
        let candidates = match self {
            Self::Opae => sorted_entries(device, OPAE_FME_PREFIX)
                .unwrap_or_default()
                .into_iter()
                .map(|fme| fme.join("pr").join("interface_id"))
                .collect::<Vec<_>>(),
            Self::Dfl => dfl_compat_ids(device),
        };

        let path = candidates
            .into_iter()
            .find(|path| path.is_file())
            .ok_or_else(|| ScanError::NoInterface {
                device: device.to_path_buf(),
            })?;
        let raw = read_trimmed(&path)?;
        InterfaceId::parse(&raw).map_err(|source| ScanError::InvalidId { path, source })
    }
}

fn dfl_compat_ids(device: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for fme in sorted_entries(device, DFL_FME_PREFIX).unwrap_or_default() {
        for fme_region in sorted_entries(&fme, DFL_FME_REGION_PREFIX).unwrap_or_default() {
            let nested = fme_region.join("fpga_region");
            for region in sorted_entries(&nested, DFL_DEVICE_PREFIX).unwrap_or_default() {
                paths.push(region.join("compat_id"));
            }
        }
    }
    paths
}

fn read_port(port_dir: &Path) -> Result<Port, ScanError> {
    let name = port_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let afu_path = port_dir.join("afu_id");
    let afu_id = FunctionId::parse(&read_trimmed(&afu_path)?)
        .map_err(|source| ScanError::InvalidId {
            path: afu_path,
            source,
        })?;

    Ok(Port {
        healthy: port_healthy(&port_dir.join("errors").join("errors")),
        name,
        afu_id,
    })
}

/// A port is healthy unless its error register holds a non-zero value.
/// Kernels without the register report nothing, which counts as healthy.
fn port_healthy(errors_path: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(errors_path) else {
        return true;
    };
    let raw = raw.trim();
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    match u64::from_str_radix(digits, 16) {
        Ok(0) => true,
        Ok(value) => {
            warn!(path = %errors_path.display(), "port error register is {value:#x}");
            false
        }
        Err(_) => {
            warn!(path = %errors_path.display(), "unreadable port error register `{raw}`");
            false
        }
    }
}

fn read_trimmed(path: &Path) -> Result<String, ScanError> {
    fs::read_to_string(path)
        .map(|raw| raw.trim().to_string())
        .map_err(|source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Directory entries whose names start with `prefix`, sorted by name.
fn sorted_entries(dir: &Path, prefix: &str) -> Option<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).ok()?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    Some(paths)
}
