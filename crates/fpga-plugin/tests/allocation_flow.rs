//! End-to-end checks of admission translation, node allocation and
//! reprogramming against a fake sysfs tree.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use api_types::parse_collection;
use api_types::FunctionId;
use api_types::InterfaceId;
use api_types::LogicalFunctionId;
use api_types::MappingSource;
use api_types::ResourceName;
use api_types::SharedMappingTable;
use api_types::FUNCTION_ANNOTATION;
use async_trait::async_trait;
use fpga_admission::Translator;
use fpga_plugin::allocator::AllocationError;
use fpga_plugin::allocator::AllocationRequest;
use fpga_plugin::allocator::Allocator;
use fpga_plugin::config::PluginMode;
use fpga_plugin::inventory::Inventory;
use fpga_plugin::inventory::RegionPhase;
use fpga_plugin::reprogram::ProgramError;
use fpga_plugin::reprogram::Programmer;
use fpga_plugin::reprogram::StateMachine;
use fpga_plugin::reprogram::Transition;
use fpga_plugin::scanner::RegionId;
use fpga_plugin::scanner::Scanner;
use k8s_openapi::api::core::v1::Pod;
use similar_asserts::assert_eq;
use tempfile::TempDir;
use test_log::test;

const ARRIA10: &str = "69528db6eb31577a8c3668f9faa081f6";
const OTHER_INTERFACE: &str = "bfac4d851ee856fe8c95865ce1bbaa2d";
const NLB0: &str = "d8424dc4a4a3c413f89e433683f9040b";
const NLB3: &str = "f7df405cbd7acf7222f144b0b93acd18";
const BLANK: &str = "00000000000000000000000000000000";

const MAPPINGS: &str = r#"
kind: AcceleratorFunction
metadata:
  name: arria10.dcp1.2-nlb0-orchestrated
spec:
  afuId: d8424dc4a4a3c413f89e433683f9040b
  interfaceId: 69528db6eb31577a8c3668f9faa081f6
  mode: region
---
kind: AcceleratorFunction
metadata:
  name: arria10.dcp1.2-nlb3-orchestrated
spec:
  afuId: f7df405cbd7acf7222f144b0b93acd18
  interfaceId: 69528db6eb31577a8c3668f9faa081f6
  mode: region
---
kind: AcceleratorFunction
metadata:
  name: arria10.dcp1.2-nlb0-preprogrammed
spec:
  afuId: d8424dc4a4a3c413f89e433683f9040b
  interfaceId: 69528db6eb31577a8c3668f9faa081f6
  mode: af
"#;

/// Node with one OPAE card whose ports are described by `(afu_id, errors)`.
struct FakeNode {
    sysfs: TempDir,
}

impl FakeNode {
    fn new(ports: &[(&str, &str)]) -> Self {
        let sysfs = TempDir::new().unwrap();
        let device = sysfs.path().join("class/fpga/intel-fpga-dev.0");
        write(&device.join("intel-fpga-fme.0/pr/interface_id"), ARRIA10);
        let node = Self { sysfs };
        for (port, (afu, errors)) in ports.iter().enumerate() {
            node.set_port(port, afu, errors);
        }
        node
    }

    fn port_dir(sysfs: &Path, port_name: &str) -> PathBuf {
        sysfs.join("class/fpga/intel-fpga-dev.0").join(port_name)
    }

    fn set_port(&self, port: usize, afu: &str, errors: &str) {
        let dir = Self::port_dir(self.sysfs.path(), &format!("intel-fpga-port.{port}"));
        write(&dir.join("afu_id"), afu);
        write(&dir.join("errors/errors"), errors);
    }

    fn scanner(&self, mode: PluginMode) -> Scanner {
        Scanner::new(self.sysfs.path(), "/dev", mode)
    }

    fn inventory(&self, mode: PluginMode) -> Arc<Inventory> {
        let outcome = self.scanner(mode).scan();
        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        Arc::new(Inventory::from_scan(outcome.devices))
    }

    fn rescan(&self, inventory: &Inventory, mode: PluginMode) -> bool {
        inventory.apply_scan(self.scanner(mode).scan().devices)
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, format!("{content}\n")).unwrap();
}

/// Stands in for the programming tool: writes the new afu id where the
/// driver would expose it.
struct SysfsProgrammer {
    sysfs: PathBuf,
    calls: AtomicUsize,
    delay: Duration,
}

impl SysfsProgrammer {
    fn new(node: &FakeNode) -> Arc<Self> {
        Arc::new(Self {
            sysfs: node.sysfs.path().to_path_buf(),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Programmer for SysfsProgrammer {
    async fn program(
        &self,
        _region: &RegionId,
        device_node: &Path,
        function: &LogicalFunctionId,
    ) -> Result<(), ProgramError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let port_name = device_node
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let afu_id = FakeNode::port_dir(&self.sysfs, port_name).join("afu_id");
        fs::write(&afu_id, format!("{}\n", function.function_id)).map_err(|source| {
            ProgramError::Spawn {
                command: "fake-fpgaconf".to_string(),
                source,
            }
        })
    }
}

fn allocator(
    mode: PluginMode,
    inventory: Arc<Inventory>,
    programmer: Arc<SysfsProgrammer>,
) -> Arc<Allocator> {
    Arc::new(Allocator::new(
        mode,
        inventory,
        StateMachine::new(programmer, Duration::from_secs(5)),
    ))
}

fn translator() -> Translator {
    Translator::new(Arc::new(SharedMappingTable::with_entries(
        MappingSource::File,
        parse_collection(MAPPINGS).entries,
    )))
}

fn pod_requesting(label: &str, count: usize) -> Pod {
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": "job", "namespace": "default" },
        "spec": { "containers": [{
            "name": "main",
            "image": "fpga-app",
            "resources": { "limits": { format!("fpga.intel.com/{label}"): count.to_string() } },
        }] },
    }))
    .unwrap()
}

/// Runs the admission translation and turns its result into the request the
/// node daemon sees.
fn translated_request(label: &str, count: usize) -> AllocationRequest {
    let translation = translator().translate(None, &pod_requesting(label, count)).unwrap();
    let (_, resource) = translation.rewritten[0].clone();
    let mut request = AllocationRequest::new(ResourceName::parse(&resource).unwrap(), count);
    if let Some(function) = &translation.function {
        request = request.with_function(function);
    }
    request
}

fn function(afu: &str) -> LogicalFunctionId {
    LogicalFunctionId::new(
        InterfaceId::parse(ARRIA10).unwrap(),
        FunctionId::parse(afu).unwrap(),
    )
}

fn loaded(afu: &str) -> RegionPhase {
    RegionPhase::Loaded(FunctionId::parse(afu).unwrap())
}

fn region_resource() -> ResourceName {
    ResourceName::orchestrated(InterfaceId::parse(ARRIA10).unwrap())
}

#[test(tokio::test)]
async fn translated_request_ends_loaded_with_its_function() {
    let node = FakeNode::new(&[(BLANK, "0")]);
    let inventory = node.inventory(PluginMode::Region);
    let programmer = SysfsProgrammer::new(&node);
    let allocator = allocator(PluginMode::Region, inventory.clone(), programmer.clone());

    let request = translated_request("arria10.dcp1.2-nlb3-orchestrated", 1);
    assert_eq!(request.resource, region_resource());
    assert_eq!(
        request.annotations.get(FUNCTION_ANNOTATION),
        Some(&function(NLB3).to_string())
    );

    let grant = allocator.allocate(request).await.unwrap();

    let region = &grant.regions[0];
    assert_eq!(region.transition, Some(Transition::Reprogrammed));
    assert_eq!(inventory.get(&region.id).unwrap().phase(), loaded(NLB3));

    // the hardware agrees on the next scan
    node.rescan(&inventory, PluginMode::Region);
    assert_eq!(inventory.get(&region.id).unwrap().phase(), loaded(NLB3));
    assert_eq!(programmer.calls(), 1);
}

#[test(tokio::test)]
async fn nlb0_region_is_reprogrammed_then_mismatch_is_refused() {
    let node = FakeNode::new(&[(NLB0, "0")]);
    let inventory = node.inventory(PluginMode::Region);
    let programmer = SysfsProgrammer::new(&node);
    let allocator = allocator(PluginMode::Region, inventory.clone(), programmer.clone());
    let port = RegionId::new("intel-fpga-port.0");

    let grant = allocator
        .allocate(translated_request("arria10.dcp1.2-nlb3-orchestrated", 1))
        .await
        .unwrap();
    assert_eq!(grant.regions[0].transition, Some(Transition::Reprogrammed));
    assert_eq!(inventory.get(&port).unwrap().phase(), loaded(NLB3));
    inventory.release(grant.region_ids());

    // an arria10 function annotated onto another region class
    let other = ResourceName::orchestrated(InterfaceId::parse(OTHER_INTERFACE).unwrap());
    let request = AllocationRequest::new(other, 1).with_function(&function(NLB0));
    let error = allocator.allocate(request).await.unwrap_err();

    assert!(matches!(error, AllocationError::ResourceMismatch { .. }));
    assert_eq!(programmer.calls(), 1);
    assert_eq!(inventory.get(&port).unwrap().phase(), loaded(NLB3));
}

#[test(tokio::test)]
async fn loaded_function_is_reused_without_the_tool() {
    let node = FakeNode::new(&[(NLB0, "0"), (NLB0, "0")]);
    let inventory = node.inventory(PluginMode::Region);
    let programmer = SysfsProgrammer::new(&node);
    let allocator = allocator(PluginMode::Region, inventory, programmer.clone());

    let grant = allocator
        .allocate(translated_request("arria10.dcp1.2-nlb0-orchestrated", 2))
        .await
        .unwrap();

    assert!(grant
        .regions
        .iter()
        .all(|region| region.transition == Some(Transition::Reused)));
    assert_eq!(programmer.calls(), 0);
}

#[test(tokio::test)]
async fn over_count_fails_and_leaves_regions_untouched() {
    let node = FakeNode::new(&[(NLB0, "0"), (BLANK, "0")]);
    let inventory = node.inventory(PluginMode::Region);
    let programmer = SysfsProgrammer::new(&node);
    let allocator = allocator(PluginMode::Region, inventory.clone(), programmer.clone());
    let before: Vec<_> = inventory.slots().iter().map(|slot| slot.state()).collect();

    let error = allocator
        .allocate(translated_request("arria10.dcp1.2-nlb3-orchestrated", 3))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        AllocationError::InsufficientResources {
            requested: 3,
            available: 2,
            ..
        }
    ));
    let after: Vec<_> = inventory.slots().iter().map(|slot| slot.state()).collect();
    assert_eq!(
        before.iter().map(|s| (&s.phase, s.assigned)).collect::<Vec<_>>(),
        after.iter().map(|s| (&s.phase, s.assigned)).collect::<Vec<_>>()
    );
    assert_eq!(programmer.calls(), 0);
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_allocations_never_share_a_region() {
    let node = FakeNode::new(&[(BLANK, "0"), (NLB0, "0"), (BLANK, "0"), (NLB3, "0")]);
    let inventory = node.inventory(PluginMode::Region);
    let programmer = SysfsProgrammer::new(&node);
    let allocator = allocator(PluginMode::Region, inventory, programmer);

    let requests = (0..8).map(|i| {
        let allocator = allocator.clone();
        let label = if i % 2 == 0 {
            "arria10.dcp1.2-nlb0-orchestrated"
        } else {
            "arria10.dcp1.2-nlb3-orchestrated"
        };
        let request = translated_request(label, 1);
        tokio::spawn(async move { allocator.allocate(request).await })
    });
    let results = futures::future::join_all(requests).await;

    let mut granted = HashSet::new();
    let mut refused = 0;
    for result in results {
        match result.unwrap() {
            Ok(grant) => {
                for id in grant.region_ids() {
                    assert!(granted.insert(id.clone()), "{id} granted twice");
                }
            }
            Err(AllocationError::InsufficientResources { .. }) => refused += 1,
            Err(e) => panic!("unexpected allocation error: {e}"),
        }
    }
    assert_eq!(granted.len(), 4);
    assert_eq!(refused, 4);
}

#[test(tokio::test)]
async fn health_flip_only_withdraws_the_failing_region() {
    let node = FakeNode::new(&[(NLB0, "0"), (NLB0, "0")]);
    let inventory = node.inventory(PluginMode::Region);
    assert_eq!(inventory.advertise(), BTreeMap::from([(region_resource(), 2)]));

    node.set_port(1, NLB0, "0x10");
    assert!(node.rescan(&inventory, PluginMode::Region));

    assert_eq!(inventory.advertise(), BTreeMap::from([(region_resource(), 1)]));
    assert_eq!(
        inventory.get(&RegionId::new("intel-fpga-port.0")).unwrap().phase(),
        loaded(NLB0)
    );

    node.set_port(0, NLB0, "0x1");
    node.rescan(&inventory, PluginMode::Region);
    assert!(inventory.advertise().is_empty());

    // recovery only through a rescan
    node.set_port(1, NLB0, "0");
    node.rescan(&inventory, PluginMode::Region);
    assert_eq!(inventory.advertise(), BTreeMap::from([(region_resource(), 1)]));
}

#[test(tokio::test)]
async fn preprogrammed_requests_never_enter_programming() {
    let node = FakeNode::new(&[(NLB0, "0"), (NLB0, "0")]);
    let inventory = node.inventory(PluginMode::Af);
    let programmer = SysfsProgrammer::new(&node);
    let allocator = allocator(PluginMode::Af, inventory.clone(), programmer.clone());
    let mut changes = inventory.subscribe();

    let request = translated_request("arria10.dcp1.2-nlb0-preprogrammed", 2);
    assert_eq!(request.resource, ResourceName::preprogrammed(function(NLB0)));
    assert!(request.annotations.is_empty());

    let grant = allocator.allocate(request).await.unwrap();

    assert_eq!(grant.regions.len(), 2);
    assert!(grant.regions.iter().all(|region| region.transition.is_none()));
    assert_eq!(programmer.calls(), 0);
    assert!(!changes.has_changed().unwrap());
    for slot in inventory.slots() {
        assert_eq!(slot.phase(), loaded(NLB0));
    }

    // an orchestrated name is not served in this mode
    let error = allocator
        .allocate(translated_request("arria10.dcp1.2-nlb3-orchestrated", 1))
        .await
        .unwrap_err();
    assert!(matches!(error, AllocationError::UnknownResource { .. }));
}
