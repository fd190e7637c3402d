//! Allocation server core.
//!
//! Grants are all-or-nothing: either every requested region is reserved and
//! holds the requested function, or every reservation is rolled back and the
//! caller gets an error.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api_types::FunctionId;
use api_types::LogicalFunctionId;
use api_types::NamingError;
use api_types::ResourceName;
use api_types::FUNCTION_ANNOTATION;
use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::keyed_lock::KeyedLockGuard;

use crate::config::PluginMode;
use crate::inventory::Inventory;
use crate::inventory::RegionPhase;
use crate::inventory::Slot;
use crate::reprogram::StateMachine;
use crate::reprogram::Transition;
use crate::reprogram::TransitionError;
use crate::scanner::RegionId;

/// One `allocate` call as seen by the node.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub resource: ResourceName,
    pub count: usize,
    pub annotations: BTreeMap<String, String>,
    /// Regions to try first, typically the ids kubelet picked.
    pub preferred: Vec<RegionId>,
}

impl AllocationRequest {
    pub fn new(resource: ResourceName, count: usize) -> Self {
        Self {
            resource,
            count,
            annotations: BTreeMap::new(),
            preferred: Vec::new(),
        }
    }

    pub fn with_function(mut self, function: &LogicalFunctionId) -> Self {
        self.annotations
            .insert(FUNCTION_ANNOTATION.to_string(), function.to_string());
        self
    }

    pub fn with_preferred(mut self, preferred: Vec<RegionId>) -> Self {
        self.preferred = preferred;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedRegion {
    pub id: RegionId,
    pub device_node: PathBuf,
    /// `None` for preprogrammed grants, which never touch hardware.
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationGrant {
    pub resource: ResourceName,
    pub function: LogicalFunctionId,
    pub regions: Vec<GrantedRegion>,
}

impl AllocationGrant {
    pub fn region_ids(&self) -> impl Iterator<Item = &RegionId> {
        self.regions.iter().map(|region| &region.id)
    }

    /// Environment handed to the container, numbered from 1 per region.
    pub fn envs(&self) -> HashMap<String, String> {
        let mut envs = HashMap::new();
        for (index, region) in self.regions.iter().enumerate() {
            let n = index + 1;
            envs.insert(format!("FPGA_REGION_{n}"), self.function.interface_id.to_string());
            envs.insert(format!("FPGA_AFU_{n}"), self.function.function_id.to_string());
            envs.insert(
                format!("FPGA_DEVICE_{n}"),
                region.device_node.display().to_string(),
            );
        }
        envs
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("resource {resource} is not served by this node in {mode:?} mode")]
    UnknownResource { resource: String, mode: PluginMode },
    #[error("request for {resource} carries no {FUNCTION_ANNOTATION} annotation")]
    MissingFunction { resource: String },
    #[error("invalid {FUNCTION_ANNOTATION} annotation: {source}")]
    InvalidFunction {
        #[source]
        source: NamingError,
    },
    #[error("function {function} cannot be served by resource {resource}")]
    ResourceMismatch { resource: String, function: String },
    #[error("requested {requested} of {resource}, only {available} available")]
    InsufficientResources {
        resource: String,
        requested: usize,
        available: usize,
    },
    #[error("reprogramming region {region} failed: {reason}")]
    ReprogramFailed { region: RegionId, reason: String },
    #[error("reprogramming region {region} timed out after {timeout:?}")]
    ReprogramTimeout { region: RegionId, timeout: Duration },
    #[error("allocation task ended without a result")]
    Aborted,
}

impl From<TransitionError> for AllocationError {
    fn from(value: TransitionError) -> Self {
        match value {
            TransitionError::Unhealthy { region } => Self::ReprogramFailed {
                region,
                reason: "region is unhealthy".to_string(),
            },
            TransitionError::Failed { region, source } => Self::ReprogramFailed {
                region,
                reason: source.to_string(),
            },
            TransitionError::Timeout { region, timeout } => {
                Self::ReprogramTimeout { region, timeout }
            }
        }
    }
}

pub struct Allocator {
    mode: PluginMode,
    inventory: Arc<Inventory>,
    machine: StateMachine,
}

type Reservation = (Arc<Slot>, KeyedLockGuard<RegionId>);

impl Allocator {
    pub fn new(mode: PluginMode, inventory: Arc<Inventory>, machine: StateMachine) -> Self {
        Self {
            mode,
            inventory,
            machine,
        }
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    /// Reserves `count` regions for `resource` and makes them hold the
    /// requested function.
    ///
    /// The work runs in its own task. If the caller goes away before the
    /// grant, in-flight reprogramming still completes and the regions go
    /// back to the unassigned pool.
    pub async fn allocate(
        self: &Arc<Self>,
        request: AllocationRequest,
    ) -> Result<AllocationGrant, AllocationError> {
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.allocate_now(request).await;
            if let Err(Ok(grant)) = tx.send(result) {
                warn!(resource = %grant.resource, "consumer went away before the grant, releasing regions");
                this.inventory.release(grant.region_ids());
            }
        });
        rx.await.unwrap_or(Err(AllocationError::Aborted))
    }

    #[tracing::instrument(skip(self, request), fields(resource = %request.resource, count = request.count))]
    async fn allocate_now(
        &self,
        request: AllocationRequest,
    ) -> Result<AllocationGrant, AllocationError> {
        let function = self.resolve_function(&request)?;

        let mut reserved: Vec<Reservation> = Vec::with_capacity(request.count);

        // kubelet has already recorded its picks for the pod, so wait for
        // them instead of handing out another region
        for slot in self.picked_slots(&request) {
            let guard = self.inventory.acquire(&slot.id).await;
            if self.inventory.reserve(&slot) {
                reserved.push((slot, guard));
            } else {
                info!(region = %slot.id, "picked region is taken or unhealthy, substituting");
            }
        }

        for slot in self.candidates(&request.resource, &request.preferred, &function.function_id) {
            if reserved.len() == request.count {
                break;
            }
            if request.preferred.contains(&slot.id) {
                continue;
            }
            let Some(guard) = self.inventory.try_acquire(&slot.id) else {
                debug!(region = %slot.id, "region busy, trying next candidate");
                continue;
            };
            if self.inventory.reserve(&slot) {
                reserved.push((slot, guard));
            }
        }

        if reserved.len() < request.count {
            let available = reserved.len();
            self.inventory.release(reserved.iter().map(|(slot, _)| &slot.id));
            return Err(AllocationError::InsufficientResources {
                resource: request.resource.qualified(),
                requested: request.count,
                available,
            });
        }

        let transitions = if request.resource.is_orchestrated() {
            self.program_all(&reserved, &function).await?
        } else {
            vec![None; reserved.len()]
        };

        let regions = reserved
            .iter()
            .zip(transitions)
            .map(|((slot, _), transition)| GrantedRegion {
                id: slot.id.clone(),
                device_node: slot.device_node.clone(),
                transition,
            })
            .collect::<Vec<_>>();

        info!(
            function = %function,
            regions = ?regions.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            "allocation granted"
        );
        Ok(AllocationGrant {
            resource: request.resource,
            function,
            regions,
        })
    }

    /// Runs the state machine on every reserved region. Any failure rolls
    /// back every reservation.
    async fn program_all(
        &self,
        reserved: &[Reservation],
        function: &LogicalFunctionId,
    ) -> Result<Vec<Option<Transition>>, AllocationError> {
        let results = join_all(
            reserved
                .iter()
                .map(|(slot, _)| self.machine.ensure_loaded(&self.inventory, slot, function)),
        )
        .await;

        let mut transitions = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(transition) => transitions.push(Some(transition)),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => {
                self.inventory.release(reserved.iter().map(|(slot, _)| &slot.id));
                Err(e.into())
            }
            None => Ok(transitions),
        }
    }

    /// Function the request must end up with, checked against the resource.
    fn resolve_function(
        &self,
        request: &AllocationRequest,
    ) -> Result<LogicalFunctionId, AllocationError> {
        let resource = &request.resource;
        let served = match resource {
            ResourceName::Orchestrated(_) => self.mode == PluginMode::Region,
            ResourceName::Preprogrammed(_) => self.mode == PluginMode::Af,
        };
        if !served {
            return Err(AllocationError::UnknownResource {
                resource: resource.qualified(),
                mode: self.mode,
            });
        }

        let annotated = request
            .annotations
            .get(FUNCTION_ANNOTATION)
            .map(|value| LogicalFunctionId::parse(value))
            .transpose()
            .map_err(|source| AllocationError::InvalidFunction { source })?;

        let function = match (resource, annotated) {
            (ResourceName::Orchestrated(_), None) => {
                return Err(AllocationError::MissingFunction {
                    resource: resource.qualified(),
                })
            }
            (ResourceName::Orchestrated(_), Some(function)) => function,
            (ResourceName::Preprogrammed(fixed), Some(function)) if &function != fixed => {
                return Err(AllocationError::ResourceMismatch {
                    resource: resource.qualified(),
                    function: function.to_string(),
                })
            }
            (ResourceName::Preprogrammed(fixed), _) => fixed.clone(),
        };

        if &function.interface_id != resource.interface_id() {
            return Err(AllocationError::ResourceMismatch {
                resource: resource.qualified(),
                function: function.to_string(),
            });
        }
        Ok(function)
    }

    /// Slots of the requested resource among the preferred ids, in id order
    /// so that concurrent waiters lock them in the same order.
    fn picked_slots(&self, request: &AllocationRequest) -> Vec<Arc<Slot>> {
        let picked: BTreeSet<&RegionId> = request.preferred.iter().collect();
        picked
            .into_iter()
            .filter_map(|id| self.inventory.get(id))
            .filter(|slot| slot.resource_name() == request.resource)
            .take(request.count)
            .collect()
    }

    /// Preferred ids first, then regions already holding `target`, then idle
    /// regions, then regions holding something else.
    fn candidates(
        &self,
        resource: &ResourceName,
        preferred: &[RegionId],
        target: &FunctionId,
    ) -> Vec<Arc<Slot>> {
        let mut slots = self.inventory.slots_for(resource);
        slots.sort_by_key(|slot| {
            let rank = preferred
                .iter()
                .position(|id| id == &slot.id)
                .unwrap_or(usize::MAX);
            (rank, phase_rank(&slot.phase(), target))
        });
        slots
    }

    /// Picks `size` ids out of `available` for kubelet, keeping
    /// `must_include` and favouring regions that already hold `function`.
    pub fn preferred_allocation(
        &self,
        available: &[RegionId],
        must_include: &[RegionId],
        size: usize,
        function: Option<&LogicalFunctionId>,
    ) -> Vec<RegionId> {
        let mut picked: Vec<RegionId> = must_include.iter().take(size).cloned().collect();

        let mut rest: Vec<(usize, &RegionId)> = available
            .iter()
            .filter(|id| !picked.contains(id))
            .map(|id| {
                let rank = match (self.inventory.get(id), function) {
                    (Some(slot), Some(function)) => {
                        phase_rank(&slot.phase(), &function.function_id)
                    }
                    (Some(slot), None) => usize::from(!slot.phase().is_healthy()) * 3,
                    (None, _) => 4,
                };
                (rank, id)
            })
            .collect();
        rest.sort();

        picked.extend(
            rest.into_iter()
                .map(|(_, id)| id.clone())
                .take(size.saturating_sub(picked.len())),
        );
        picked
    }
}

fn phase_rank(phase: &RegionPhase, target: &FunctionId) -> usize {
    match phase {
        RegionPhase::Loaded(loaded) if loaded == target => 0,
        RegionPhase::Idle => 1,
        RegionPhase::Loaded(_) => 2,
        RegionPhase::Programming(_) | RegionPhase::Unhealthy => 3,
    }
}
