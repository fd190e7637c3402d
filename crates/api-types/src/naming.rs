//! Resource naming table.
//!
//! Orchestrated names are keyed by interface id only (`region-<interfaceId>`),
//! so every region of a hardware family lands in the same fungible pool.
//! Preprogrammed names are keyed by interface id and function id:
//!
//! ```text
//! af-<if[0..3]>.<fn[0..3]>.<base64url(if bytes ++ fn bytes)>
//! ```
//!
//! The base64 payload keeps the name reversible while staying under the
//! 63 character limit Kubernetes puts on the name part of a resource.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::ids::ID_BYTES;
use crate::FunctionId;
use crate::InterfaceId;
use crate::LogicalFunctionId;
use crate::NamingError;
use crate::RESOURCE_NAMESPACE;

const REGION_PREFIX: &str = "region-";
const AF_PREFIX: &str = "af-";
const AF_ID_PREFIX_LEN: usize = 3;

/// A countable resource advertised to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceName {
    /// Any region of this interface; reprogramming allowed.
    Orchestrated(InterfaceId),
    /// A port already holding this function; never reprogrammed.
    Preprogrammed(LogicalFunctionId),
}

impl ResourceName {
    pub fn orchestrated(interface_id: InterfaceId) -> Self {
        Self::Orchestrated(interface_id)
    }

    pub fn preprogrammed(function: LogicalFunctionId) -> Self {
        Self::Preprogrammed(function)
    }

    pub fn interface_id(&self) -> &InterfaceId {
        match self {
            Self::Orchestrated(interface_id) => interface_id,
            Self::Preprogrammed(function) => &function.interface_id,
        }
    }

    pub fn is_orchestrated(&self) -> bool {
        matches!(self, Self::Orchestrated(_))
    }

    /// Name without the `fpga.intel.com/` namespace.
    pub fn short_name(&self) -> String {
        match self {
            Self::Orchestrated(interface_id) => format!("{REGION_PREFIX}{interface_id}"),
            Self::Preprogrammed(function) => {
                let interface = function.interface_id.as_str();
                let afu = function.function_id.as_str();
                let mut bytes = [0u8; ID_BYTES * 2];
                bytes[..ID_BYTES].copy_from_slice(&function.interface_id.to_bytes());
                bytes[ID_BYTES..].copy_from_slice(&function.function_id.to_bytes());
                format!(
                    "{AF_PREFIX}{}.{}.{}",
                    &interface[..AF_ID_PREFIX_LEN],
                    &afu[..AF_ID_PREFIX_LEN],
                    URL_SAFE_NO_PAD.encode(bytes)
                )
            }
        }
    }

    /// Fully qualified extended resource name.
    pub fn qualified(&self) -> String {
        format!("{RESOURCE_NAMESPACE}/{}", self.short_name())
    }

    /// Parses a concrete name, with or without the resource namespace.
    pub fn parse(name: &str) -> Result<Self, NamingError> {
        let short = strip_namespace(name).unwrap_or(name);
        let unknown = || NamingError::UnknownResource(name.to_string());

        if let Some(interface) = short.strip_prefix(REGION_PREFIX) {
            return InterfaceId::parse(interface)
                .map(Self::Orchestrated)
                .map_err(|_| unknown());
        }

        let rest = short.strip_prefix(AF_PREFIX).ok_or_else(unknown)?;
        let Some(payload) = rest.splitn(3, '.').nth(2) else {
            return Err(unknown());
        };
        let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| unknown())?;
        if bytes.len() != ID_BYTES * 2 {
            return Err(unknown());
        }
        let interface_id =
            InterfaceId::parse(&hex::encode(&bytes[..ID_BYTES])).map_err(|_| unknown())?;
        let function_id =
            FunctionId::parse(&hex::encode(&bytes[ID_BYTES..])).map_err(|_| unknown())?;
        let parsed = Self::Preprogrammed(LogicalFunctionId::new(interface_id, function_id));
        // both prefixes must be the 3-char heads of the decoded ids
        if parsed.short_name() != short {
            return Err(unknown());
        }
        Ok(parsed)
    }

    /// True when `name` has the shape of a concrete region or function name.
    pub fn is_concrete(name: &str) -> bool {
        Self::parse(name).is_ok()
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// Returns the part after `fpga.intel.com/`, if `name` is in that namespace.
pub fn strip_namespace(name: &str) -> Option<&str> {
    name.strip_prefix(RESOURCE_NAMESPACE)
        .and_then(|rest| rest.strip_prefix('/'))
}
