//! Returns granted regions to the pool once kubelet stops holding them.
//!
//! Kubelet has no "deallocate" call. Its checkpoint file lists every device
//! currently bound to a pod, so a region that is assigned here but absent
//! from the checkpoint for longer than a grace period has been freed.
//!
//! The device ids in the checkpoint are kubelet's picks. A grant may hand out
//! another region when a pick is taken, so the region a pod really holds is
//! read from the allocate response kubelet stores next to the ids.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use api_types::naming::strip_namespace;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use prost::Message;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device_plugin::api::ContainerAllocateResponse;
use crate::inventory::Inventory;
use crate::scanner::RegionId;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Failed to read kubelet checkpoint: {message}")]
    CheckpointUnreadable { message: String },
}

/// Kubelet device manager checkpoint, as written to disk.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct KubeletDeviceState {
    data: DeviceStateData,
    checksum: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceStateData {
    pod_device_entries: Option<Vec<PodDeviceEntry>>,
    #[serde(default)]
    registered_devices: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PodDeviceEntry {
    #[serde(rename = "PodUID")]
    pod_uid: String,
    container_name: String,
    resource_name: String,
    // key is the NUMA node, usually "-1"
    #[serde(rename = "DeviceIDs")]
    device_ids: HashMap<String, Vec<String>>,
    #[serde(rename = "AllocResp", default)]
    alloc_resp: String,
}

/// What one reconcile pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub released: Vec<RegionId>,
    pub adopted: Vec<RegionId>,
}

pub struct LeaseReconciler {
    checkpoint_path: PathBuf,
    inventory: Arc<Inventory>,
    grace: Duration,
}

impl LeaseReconciler {
    pub fn new(checkpoint_path: impl Into<PathBuf>, inventory: Arc<Inventory>, grace: Duration) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            inventory,
            grace,
        }
    }

    #[tracing::instrument(skip(self, cancellation_token), fields(checkpoint = %self.checkpoint_path.display()))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting lease reconciler");

        let (fs_tx, mut fs_rx) = mpsc::channel(10);
        // the watcher stops when dropped, keep it for the whole loop
        let _watcher = match self.setup_filesystem_watcher(fs_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Failed to setup filesystem watcher, falling back to polling only: {e:?}");
                None
            }
        };

        let mut poll_interval = interval(Duration::from_secs(10));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("Lease reconciler shutdown requested");
                    break;
                }
                Some(_event) = fs_rx.recv() => {
                    debug!("Checkpoint changed, reconciling");
                    self.reconcile_logged().await;
                }
                _ = poll_interval.tick() => {
                    self.reconcile_logged().await;
                }
            }
        }
    }

    async fn reconcile_logged(&self) {
        match self.reconcile().await {
            Ok(outcome) if outcome != ReconcileOutcome::default() => {
                info!(released = ?outcome.released, adopted = ?outcome.adopted, "leases reconciled");
            }
            Ok(_) => {}
            Err(e) => error!("Failed to reconcile leases: {e:?}"),
        }
    }

    /// One pass over the checkpoint.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome, Report<LeaseError>> {
        let device_state = self.read_device_state_file().await?;
        let held = held_regions(&device_state, &self.inventory);
        let mut outcome = ReconcileOutcome::default();

        for slot in self.inventory.slots() {
            let state = slot.state();
            let in_checkpoint = held.contains(&slot.id);

            if state.assigned && !in_checkpoint {
                let expired = state
                    .assigned_at
                    .is_some_and(|at| at.elapsed() >= self.grace);
                // a transition in flight belongs to an allocation not yet checkpointed
                if expired && self.inventory.try_acquire(&slot.id).is_some() {
                    self.inventory.release([&slot.id]);
                    outcome.released.push(slot.id.clone());
                }
            } else if !state.assigned && in_checkpoint && self.inventory.adopt(&slot.id) {
                outcome.adopted.push(slot.id.clone());
            }
        }
        Ok(outcome)
    }

    fn setup_filesystem_watcher(
        &self,
        fs_tx: mpsc::Sender<Event>,
    ) -> Result<RecommendedWatcher, Report<LeaseError>> {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!("Filesystem watch error: {:?}", e),
            },
            Config::default(),
        )
        .change_context(LeaseError::CheckpointUnreadable {
            message: "Failed to create filesystem watcher".to_string(),
        })?;

        // kubelet replaces the file on write, so watch its directory
        let dir = self
            .checkpoint_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .change_context(LeaseError::CheckpointUnreadable {
                message: format!("Failed to watch {}", dir.display()),
            })?;

        let checkpoint = self.checkpoint_path.clone();
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = rx.recv() {
                if !event.paths.iter().any(|path| path == &checkpoint) {
                    continue;
                }
                if fs_tx.blocking_send(event).is_err() {
                    break;
                }
            }
        });

        Ok(watcher)
    }

    async fn read_device_state_file(&self) -> Result<KubeletDeviceState, Report<LeaseError>> {
        let content = fs::read_to_string(&self.checkpoint_path)
            .await
            .change_context(LeaseError::CheckpointUnreadable {
                message: format!("Failed to read {}", self.checkpoint_path.display()),
            })?;

        serde_json::from_str(&content).change_context(LeaseError::CheckpointUnreadable {
            message: "Failed to parse device state JSON".to_string(),
        })
    }
}

/// Regions held by every `fpga.intel.com/*` entry in the checkpoint.
///
/// The device nodes of the stored allocate response name the granted
/// regions. Entries without a usable response fall back to their device ids.
fn held_regions(device_state: &KubeletDeviceState, inventory: &Inventory) -> HashSet<RegionId> {
    let mut held = HashSet::new();
    let entries = device_state
        .data
        .pod_device_entries
        .iter()
        .flatten()
        .filter(|entry| strip_namespace(&entry.resource_name).is_some());

    for entry in entries {
        let granted: Vec<RegionId> = granted_device_nodes(&entry.alloc_resp)
            .iter()
            .filter_map(|node| inventory.slot_by_device_node(node))
            .map(|slot| slot.id.clone())
            .collect();
        if granted.is_empty() {
            held.extend(
                entry
                    .device_ids
                    .values()
                    .flatten()
                    .map(|id| RegionId::new(id.as_str())),
            );
        } else {
            held.extend(granted);
        }
    }
    held
}

/// Host device paths of a base64 `ContainerAllocateResponse`.
fn granted_device_nodes(alloc_resp: &str) -> Vec<PathBuf> {
    if alloc_resp.is_empty() {
        return Vec::new();
    }
    let response = STANDARD
        .decode(alloc_resp)
        .map_err(|e| e.to_string())
        .and_then(|bytes| {
            ContainerAllocateResponse::decode(bytes.as_slice()).map_err(|e| e.to_string())
        });
    match response {
        Ok(response) => response
            .devices
            .into_iter()
            .map(|device| PathBuf::from(device.host_path))
            .collect(),
        Err(e) => {
            debug!("undecodable allocate response in checkpoint: {e}");
            Vec::new()
        }
    }
}
