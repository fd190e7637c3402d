//! Shared API type definitions
//!
//! This crate contains the identifiers and naming rules shared by the node
//! daemon and the admission webhook: hardware interface and function ids,
//! the resource names advertised to the scheduler, and the label mapping
//! table that turns a workload author's logical request into one of those
//! names.

pub mod crd;
pub mod ids;
pub mod mapping;
pub mod naming;

pub use crd::AcceleratorFunction;
pub use crd::AcceleratorFunctionSpec;
pub use ids::FunctionId;
pub use ids::InterfaceId;
pub use ids::LogicalFunctionId;
pub use mapping::MappingEntry;
pub use mapping::MappingMode;
pub use mapping::MappingSource;
pub use mapping::parse_collection;
pub use mapping::MappingTable;
pub use mapping::ParsedCollection;
pub use mapping::SharedMappingTable;
pub use naming::ResourceName;

/// Extended resource namespace for every name advertised by the plugin.
pub const RESOURCE_NAMESPACE: &str = "fpga.intel.com";

/// Pod annotation carrying the [`LogicalFunctionId`] an orchestrated request
/// must be programmed with.
pub const FUNCTION_ANNOTATION: &str = "fpga.intel.com/function";

/// Errors produced while parsing identifiers and resource names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamingError {
    #[error("invalid interface id `{0}`: expected 32 hex digits")]
    InvalidInterfaceId(String),
    #[error("invalid function id `{0}`: expected 32 hex digits")]
    InvalidFunctionId(String),
    #[error("invalid function reference `{0}`: expected <interfaceId>-<functionId>")]
    InvalidFunctionRef(String),
    #[error("`{0}` is not a region or accelerator function resource name")]
    UnknownResource(String),
}
