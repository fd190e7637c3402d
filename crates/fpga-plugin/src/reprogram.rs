//! Reprogramming state machine.
//!
//! ```text
//! Loaded(F) --F--> Loaded(F)                      no hardware access
//! Idle | Loaded(F) --G--> Programming(G) --ok-->  Loaded(G)
//!                                        --err--> Unhealthy
//!                                        --timeout--> Unhealthy
//! ```
//!
//! Callers must hold the region's transition lock for the whole call.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use api_types::LogicalFunctionId;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::inventory::Inventory;
use crate::inventory::RegionPhase;
use crate::inventory::Slot;
use crate::scanner::RegionId;

const BITSTREAM_EXTENSIONS: [&str; 2] = ["gbs", "aocx"];

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("no bitstream for {function} under {dir}")]
    BitstreamMissing {
        function: LogicalFunctionId,
        dir: PathBuf,
    },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

impl ProgramError {
    /// Whether the failure says something about the hardware. A missing
    /// bitstream does not.
    pub fn taints_region(&self) -> bool {
        !matches!(self, Self::BitstreamMissing { .. })
    }
}

/// Writes a bitstream into one region.
#[async_trait]
pub trait Programmer: Send + Sync {
    async fn program(
        &self,
        region: &RegionId,
        device_node: &Path,
        function: &LogicalFunctionId,
    ) -> Result<(), ProgramError>;
}

/// Runs an external tool as `<command> -D <device node> <bitstream>`.
#[derive(Debug, Clone)]
pub struct CommandProgrammer {
    command: String,
    bitstream_dir: PathBuf,
}

impl CommandProgrammer {
    pub fn new(command: impl Into<String>, bitstream_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            bitstream_dir: bitstream_dir.into(),
        }
    }

    /// `<bitstream-dir>/<interfaceId>/<functionId>.gbs`, falling back to `.aocx`.
    pub fn bitstream_path(&self, function: &LogicalFunctionId) -> Result<PathBuf, ProgramError> {
        let dir = self.bitstream_dir.join(function.interface_id.as_str());
        BITSTREAM_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{ext}", function.function_id)))
            .find(|path| path.is_file())
            .ok_or_else(|| ProgramError::BitstreamMissing {
                function: function.clone(),
                dir,
            })
    }
}

#[async_trait]
impl Programmer for CommandProgrammer {
    async fn program(
        &self,
        region: &RegionId,
        device_node: &Path,
        function: &LogicalFunctionId,
    ) -> Result<(), ProgramError> {
        let bitstream = self.bitstream_path(function)?;
        info!(%region, bitstream = %bitstream.display(), "running {}", self.command);

        let output = Command::new(&self.command)
            .arg("-D")
            .arg(device_node)
            .arg(&bitstream)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProgramError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ProgramError::Failed {
                command: self.command.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Result of driving one region to a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Function was already loaded; hardware untouched.
    Reused,
    Reprogrammed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("region {region} is unhealthy")]
    Unhealthy { region: RegionId },
    #[error("reprogramming region {region} failed: {source}")]
    Failed {
        region: RegionId,
        #[source]
        source: ProgramError,
    },
    #[error("reprogramming region {region} did not finish within {timeout:?}")]
    Timeout { region: RegionId, timeout: Duration },
}

pub struct StateMachine {
    programmer: Arc<dyn Programmer>,
    timeout: Duration,
}

impl StateMachine {
    pub fn new(programmer: Arc<dyn Programmer>, timeout: Duration) -> Self {
        Self {
            programmer,
            timeout,
        }
    }

    /// Makes `slot` hold `function`, programming it only when needed.
    pub async fn ensure_loaded(
        &self,
        inventory: &Inventory,
        slot: &Slot,
        function: &LogicalFunctionId,
    ) -> Result<Transition, TransitionError> {
        let previous = slot.phase();
        match &previous {
            RegionPhase::Loaded(loaded) if loaded == &function.function_id => {
                return Ok(Transition::Reused);
            }
            RegionPhase::Unhealthy | RegionPhase::Programming(_) => {
                return Err(TransitionError::Unhealthy {
                    region: slot.id.clone(),
                });
            }
            RegionPhase::Idle | RegionPhase::Loaded(_) => {}
        }

        info!(region = %slot.id, from = ?previous, to = %function.function_id, "reprogramming region");
        inventory.set_phase(slot, RegionPhase::Programming(function.function_id.clone()));

        let programming = self
            .programmer
            .program(&slot.id, &slot.device_node, function);
        match tokio::time::timeout(self.timeout, programming).await {
            Ok(Ok(())) => {
                inventory.set_phase(slot, RegionPhase::Loaded(function.function_id.clone()));
                info!(region = %slot.id, function = %function.function_id, "region reprogrammed");
                Ok(Transition::Reprogrammed)
            }
            Ok(Err(e)) if !e.taints_region() => {
                warn!(region = %slot.id, "reprogramming skipped: {e}");
                inventory.set_phase(slot, previous);
                Err(TransitionError::Failed {
                    region: slot.id.clone(),
                    source: e,
                })
            }
            Ok(Err(e)) => {
                error!(region = %slot.id, "reprogramming failed, marking region unhealthy: {e}");
                inventory.set_phase(slot, RegionPhase::Unhealthy);
                Err(TransitionError::Failed {
                    region: slot.id.clone(),
                    source: e,
                })
            }
            Err(_) => {
                error!(region = %slot.id, timeout = ?self.timeout, "reprogramming timed out, marking region unhealthy");
                inventory.set_phase(slot, RegionPhase::Unhealthy);
                Err(TransitionError::Timeout {
                    region: slot.id.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }
}
