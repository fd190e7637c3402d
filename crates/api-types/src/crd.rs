use kube::CustomResource;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::mapping::MappingMode;

/// Binds a workload-facing label (the object name) to a bitstream identity.
///
/// ```yaml
/// apiVersion: fpga.intel.com/v2
/// kind: AcceleratorFunction
/// metadata:
///   name: arria10.dcp1.2-nlb0-orchestrated
/// spec:
///   afuId: d8424dc4a4a3c413f89e433683f9040b
///   interfaceId: 69528db6eb31577a8c3668f9faa081f6
///   mode: region
/// ```
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "fpga.intel.com",
    version = "v2",
    kind = "AcceleratorFunction",
    plural = "acceleratorfunctions",
    shortname = "af",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorFunctionSpec {
    pub afu_id: String,
    pub interface_id: String,
    pub mode: MappingMode,
}
