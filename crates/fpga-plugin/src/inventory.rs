//! Node inventory: the single owner of every region's state.
//!
//! Each slot keeps its state behind its own mutex; transitions that touch
//! hardware additionally hold the slot's entry in a [`KeyedAsyncLock`], so at
//! most one transition per region is in flight. Readers get consistent
//! snapshots and a generation counter that ticks on every change that can
//! alter the advertised capacity.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Instant;

use api_types::FunctionId;
use api_types::InterfaceId;
use api_types::LogicalFunctionId;
use api_types::ResourceName;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedAsyncLock;
use utils::keyed_lock::KeyedLockGuard;

use crate::scanner::Discovered;
use crate::scanner::RegionId;

/// Programming state of one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "function", rename_all = "camelCase")]
pub enum RegionPhase {
    Idle,
    Loaded(FunctionId),
    Programming(FunctionId),
    Unhealthy,
}

impl RegionPhase {
    pub fn is_healthy(&self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    fn from_scan(healthy: bool, loaded: Option<&FunctionId>) -> Self {
        match (healthy, loaded) {
            (false, _) => Self::Unhealthy,
            (true, Some(function)) => Self::Loaded(function.clone()),
            (true, None) => Self::Idle,
        }
    }
}

/// What a slot can be handed out as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SlotKind {
    Region { interface_id: InterfaceId },
    FixedFunction { function: LogicalFunctionId },
}

impl SlotKind {
    pub fn resource_name(&self) -> ResourceName {
        match self {
            Self::Region { interface_id } => ResourceName::orchestrated(interface_id.clone()),
            Self::FixedFunction { function } => ResourceName::preprogrammed(function.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub phase: RegionPhase,
    /// Granted to a container and not yet released.
    pub assigned: bool,
    pub assigned_at: Option<Instant>,
}

#[derive(Debug)]
pub struct Slot {
    pub id: RegionId,
    pub kind: SlotKind,
    pub device_node: PathBuf,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(id: RegionId, kind: SlotKind, device_node: PathBuf, phase: RegionPhase) -> Self {
        Self {
            id,
            kind,
            device_node,
            state: Mutex::new(SlotState {
                phase,
                assigned: false,
                assigned_at: None,
            }),
        }
    }

    pub fn state(&self) -> SlotState {
        self.lock_state().clone()
    }

    pub fn phase(&self) -> RegionPhase {
        self.lock_state().phase.clone()
    }

    pub fn resource_name(&self) -> ResourceName {
        self.kind.resource_name()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Healthy device ids per resource name, as offered to kubelet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventorySnapshot {
    pub resources: BTreeMap<ResourceName, Vec<RegionId>>,
}

impl InventorySnapshot {
    pub fn devices(&self, resource: &ResourceName) -> &[RegionId] {
        self.resources
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Row of the `scan` subcommand output.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotReport {
    pub id: RegionId,
    pub resource: String,
    #[serde(flatten)]
    pub kind: SlotKind,
    pub device_node: PathBuf,
    #[serde(flatten)]
    pub phase: RegionPhase,
}

pub struct Inventory {
    slots: RwLock<BTreeMap<RegionId, Arc<Slot>>>,
    locks: KeyedAsyncLock<RegionId>,
    generation: watch::Sender<u64>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            slots: RwLock::new(BTreeMap::new()),
            locks: KeyedAsyncLock::new(),
            generation,
        }
    }

    /// Builds an inventory from one scan.
    pub fn from_scan(devices: Vec<Discovered>) -> Self {
        let inventory = Self::new();
        inventory.apply_scan(devices);
        inventory
    }

    /// Receiver that sees a new value whenever advertised capacity may have
    /// changed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn get(&self, id: &RegionId) -> Option<Arc<Slot>> {
        self.read_slots().get(id).cloned()
    }

    pub fn slots(&self) -> Vec<Arc<Slot>> {
        self.read_slots().values().cloned().collect()
    }

    /// All slots serving `resource`, in id order.
    pub fn slots_for(&self, resource: &ResourceName) -> Vec<Arc<Slot>> {
        self.read_slots()
            .values()
            .filter(|slot| &slot.resource_name() == resource)
            .cloned()
            .collect()
    }

    /// Slot whose device node is `path`.
    pub fn slot_by_device_node(&self, path: &Path) -> Option<Arc<Slot>> {
        self.read_slots()
            .values()
            .find(|slot| slot.device_node == path)
            .cloned()
    }

    /// Exclusive transition rights on one region, or `None` when another
    /// transition holds it.
    pub fn try_acquire(&self, id: &RegionId) -> Option<KeyedLockGuard<RegionId>> {
        self.locks.try_lock(id)
    }

    /// Exclusive transition rights on one region, waiting for the current
    /// holder to finish.
    pub async fn acquire(&self, id: &RegionId) -> KeyedLockGuard<RegionId> {
        self.locks.lock(id).await
    }

    /// Healthy slots grouped by resource name. Names without a healthy slot
    /// are absent, which withdraws them.
    pub fn snapshot(&self) -> InventorySnapshot {
        let mut resources: BTreeMap<ResourceName, Vec<RegionId>> = BTreeMap::new();
        for slot in self.read_slots().values() {
            if slot.phase().is_healthy() {
                resources
                    .entry(slot.resource_name())
                    .or_default()
                    .push(slot.id.clone());
            }
        }
        InventorySnapshot { resources }
    }

    /// Count of healthy regions (orchestrated) or fixed functions
    /// (preprogrammed) per resource name.
    pub fn advertise(&self) -> BTreeMap<ResourceName, usize> {
        self.snapshot()
            .resources
            .into_iter()
            .map(|(name, ids)| (name, ids.len()))
            .collect()
    }

    pub fn report(&self) -> Vec<SlotReport> {
        self.read_slots()
            .values()
            .map(|slot| SlotReport {
                id: slot.id.clone(),
                resource: slot.resource_name().qualified(),
                kind: slot.kind.clone(),
                device_node: slot.device_node.clone(),
                phase: slot.phase(),
            })
            .collect()
    }

    /// Merges a fresh scan into the inventory.
    ///
    /// Hardware state wins for regions nobody is transitioning. Regions with
    /// a transition in flight are left alone until the next scan, and the
    /// scan never takes a transition lock itself. An unhealthy region that
    /// scans healthy again recovers here.
    pub fn apply_scan(&self, devices: Vec<Discovered>) -> bool {
        let mut changed = false;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let seen: BTreeSet<RegionId> = devices.iter().map(|d| d.id().clone()).collect();

        for device in devices {
            let (id, kind, device_node, phase) = match device {
                Discovered::Region(region) => (
                    region.id,
                    SlotKind::Region {
                        interface_id: region.interface_id,
                    },
                    region.device_node,
                    RegionPhase::from_scan(region.healthy, region.loaded.as_ref()),
                ),
                Discovered::FixedFunction(function) => {
                    let phase = RegionPhase::from_scan(
                        function.healthy,
                        Some(&function.function.function_id),
                    );
                    (
                        function.id,
                        SlotKind::FixedFunction {
                            function: function.function,
                        },
                        function.device_node,
                        phase,
                    )
                }
            };

            match slots.get(&id) {
                Some(slot) if slot.kind == kind && slot.device_node == device_node => {
                    // never wait on a transition, the allocation owns the region
                    if self.locks.is_locked(&id) {
                        debug!(region = %id, "region busy, skipping rescan update");
                        continue;
                    }
                    let mut state = slot.lock_state();
                    if matches!(state.phase, RegionPhase::Programming(_)) {
                        continue;
                    }
                    if state.phase != phase {
                        if state.phase.is_healthy() != phase.is_healthy() {
                            info!(region = %id, from = ?state.phase, to = ?phase, "region health changed");
                            changed = true;
                        } else {
                            debug!(region = %id, from = ?state.phase, to = ?phase, "region state refreshed");
                        }
                        state.phase = phase;
                    }
                }
                _ => {
                    info!(region = %id, resource = %kind.resource_name(), ?phase, "region discovered");
                    slots.insert(id.clone(), Arc::new(Slot::new(id, kind, device_node, phase)));
                    changed = true;
                }
            }
        }

        let gone: Vec<RegionId> = slots
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            if self.locks.is_locked(&id) {
                debug!(region = %id, "vanished region busy, removing on a later scan");
                continue;
            }
            warn!(region = %id, "region disappeared");
            slots.remove(&id);
            changed = true;
        }
        drop(slots);

        if changed {
            self.notify();
        }
        changed
    }

    /// Reserves `slot` for a grant. Caller holds the slot's transition lock.
    pub fn reserve(&self, slot: &Slot) -> bool {
        let mut state = slot.lock_state();
        if state.assigned || !state.phase.is_healthy() {
            return false;
        }
        state.assigned = true;
        state.assigned_at = Some(Instant::now());
        true
    }

    /// Returns regions to the unassigned pool. Their function stays loaded.
    pub fn release<'a>(&self, ids: impl IntoIterator<Item = &'a RegionId>) {
        for id in ids {
            let Some(slot) = self.get(id) else {
                continue;
            };
            let mut state = slot.lock_state();
            if state.assigned {
                debug!(region = %id, phase = ?state.phase, "region released");
            }
            state.assigned = false;
            state.assigned_at = None;
        }
    }

    /// Marks a region as granted without going through allocation, e.g. for
    /// grants found in the kubelet checkpoint after a restart.
    pub fn adopt(&self, id: &RegionId) -> bool {
        let Some(slot) = self.get(id) else {
            return false;
        };
        let mut state = slot.lock_state();
        if state.assigned {
            return false;
        }
        state.assigned = true;
        state.assigned_at = Some(Instant::now());
        true
    }

    /// Moves `slot` to `phase`. Caller holds the slot's transition lock.
    pub fn set_phase(&self, slot: &Slot, phase: RegionPhase) {
        let health_flipped = {
            let mut state = slot.lock_state();
            let flipped = state.phase.is_healthy() != phase.is_healthy();
            state.phase = phase;
            flipped
        };
        if health_flipped {
            self.notify();
        }
    }

    fn notify(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<RegionId, Arc<Slot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::scanner::ScannedFunction;
    use crate::scanner::ScannedRegion;
    use crate::scanner::tests::ARRIA10;
    use crate::scanner::tests::NLB0;

    fn region(id: &str, loaded: Option<&str>, healthy: bool) -> Discovered {
        Discovered::Region(ScannedRegion {
            id: RegionId::new(id),
            interface_id: InterfaceId::parse(ARRIA10).unwrap(),
            loaded: loaded.map(|f| FunctionId::parse(f).unwrap()),
            healthy,
            device_node: PathBuf::from(format!("/dev/{id}")),
        })
    }

    fn arria10() -> ResourceName {
        ResourceName::orchestrated(InterfaceId::parse(ARRIA10).unwrap())
    }

    #[test]
    fn advertise_counts_healthy_regions_only() {
        let inventory = Inventory::from_scan(vec![
            region("port.0", Some(NLB0), true),
            region("port.1", None, true),
            region("port.2", None, false),
        ]);

        assert_eq!(inventory.advertise(), BTreeMap::from([(arria10(), 2)]));
    }

    #[test]
    fn health_flip_changes_only_that_region() {
        let inventory = Inventory::from_scan(vec![
            region("port.0", Some(NLB0), true),
            region("port.1", None, true),
        ]);
        let mut changes = inventory.subscribe();

        assert!(inventory.apply_scan(vec![
            region("port.0", Some(NLB0), false),
            region("port.1", None, true),
        ]));

        assert!(changes.has_changed().unwrap());
        assert_eq!(inventory.advertise(), BTreeMap::from([(arria10(), 1)]));
        assert_eq!(
            inventory.get(&RegionId::new("port.1")).unwrap().phase(),
            RegionPhase::Idle
        );
    }

    #[test]
    fn all_unhealthy_withdraws_the_name() {
        let inventory = Inventory::from_scan(vec![region("port.0", None, true)]);
        inventory.apply_scan(vec![region("port.0", None, false)]);
        assert!(inventory.advertise().is_empty());

        // recovery only through a rescan
        inventory.apply_scan(vec![region("port.0", None, true)]);
        assert_eq!(inventory.advertise(), BTreeMap::from([(arria10(), 1)]));
    }

    #[test]
    fn rescan_skips_busy_regions() {
        let inventory = Inventory::from_scan(vec![region("port.0", None, true)]);
        let id = RegionId::new("port.0");
        let guard = inventory.try_acquire(&id).unwrap();

        inventory.apply_scan(vec![region("port.0", Some(NLB0), true)]);
        assert_eq!(inventory.get(&id).unwrap().phase(), RegionPhase::Idle);

        drop(guard);
        inventory.apply_scan(vec![region("port.0", Some(NLB0), true)]);
        assert_eq!(
            inventory.get(&id).unwrap().phase(),
            RegionPhase::Loaded(FunctionId::parse(NLB0).unwrap())
        );
    }

    #[test]
    fn rescan_keeps_programming_phase() {
        let inventory = Inventory::from_scan(vec![region("port.0", None, true)]);
        let slot = inventory.get(&RegionId::new("port.0")).unwrap();

        inventory.set_phase(&slot, RegionPhase::Programming(FunctionId::parse(NLB0).unwrap()));
        inventory.apply_scan(vec![region("port.0", None, true)]);
        assert_eq!(
            slot.phase(),
            RegionPhase::Programming(FunctionId::parse(NLB0).unwrap())
        );
    }

    #[test]
    fn device_nodes_resolve_to_slots() {
        let inventory = Inventory::from_scan(vec![
            region("port.0", None, true),
            region("port.1", None, true),
        ]);
        let slot = inventory.slot_by_device_node(Path::new("/dev/port.1")).unwrap();
        assert_eq!(slot.id, RegionId::new("port.1"));
        assert!(inventory.slot_by_device_node(Path::new("/dev/port.7")).is_none());
    }

    #[test]
    fn vanished_regions_are_removed() {
        let inventory = Inventory::from_scan(vec![
            region("port.0", None, true),
            region("port.1", None, true),
        ]);
        assert!(inventory.apply_scan(vec![region("port.1", None, true)]));
        assert!(inventory.get(&RegionId::new("port.0")).is_none());
    }

    #[test]
    fn reserve_is_exclusive_and_release_keeps_function() {
        let inventory = Inventory::from_scan(vec![region("port.0", Some(NLB0), true)]);
        let slot = inventory.get(&RegionId::new("port.0")).unwrap();

        assert!(inventory.reserve(&slot));
        assert!(!inventory.reserve(&slot));

        inventory.release([&slot.id]);
        let state = slot.state();
        assert!(!state.assigned);
        assert_eq!(
            state.phase,
            RegionPhase::Loaded(FunctionId::parse(NLB0).unwrap())
        );
    }

    #[test]
    fn fixed_functions_are_named_by_function() {
        let function = LogicalFunctionId::parse(&format!("{ARRIA10}-{NLB0}")).unwrap();
        let inventory = Inventory::from_scan(vec![Discovered::FixedFunction(ScannedFunction {
            id: RegionId::new("port.0"),
            function: function.clone(),
            healthy: true,
            device_node: PathBuf::from("/dev/port.0"),
        })]);

        assert_eq!(
            inventory.advertise(),
            BTreeMap::from([(ResourceName::preprogrammed(function), 1)])
        );
    }
}
