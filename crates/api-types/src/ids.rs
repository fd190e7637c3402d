use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::NamingError;

/// Number of raw bytes in an interface or function id.
pub const ID_BYTES: usize = 16;

fn normalize_hex_id(value: &str) -> Option<String> {
    let value = value.trim().to_ascii_lowercase();
    match hex::decode(&value) {
        Ok(bytes) if bytes.len() == ID_BYTES => Some(value),
        _ => None,
    }
}

/// Identifies a hardware family (the static part of the FPGA, e.g. an
/// Arria 10 DCP 1.2 FIU). Regions with the same interface id are fungible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InterfaceId(String);

impl InterfaceId {
    pub fn parse(value: &str) -> Result<Self, NamingError> {
        normalize_hex_id(value)
            .map(Self)
            .ok_or_else(|| NamingError::InvalidInterfaceId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; ID_BYTES] {
        let mut out = [0u8; ID_BYTES];
        // validated at construction
        let _ = hex::decode_to_slice(&self.0, &mut out);
        out
    }
}

/// Identifies an accelerator function (AFU), i.e. one bitstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionId(String);

impl FunctionId {
    pub fn parse(value: &str) -> Result<Self, NamingError> {
        normalize_hex_id(value)
            .map(Self)
            .ok_or_else(|| NamingError::InvalidFunctionId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An all-zero AFU id is what the driver reports for an unprogrammed port.
    pub fn is_blank(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    pub fn to_bytes(&self) -> [u8; ID_BYTES] {
        let mut out = [0u8; ID_BYTES];
        let _ = hex::decode_to_slice(&self.0, &mut out);
        out
    }
}

macro_rules! impl_id_conversions {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = NamingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = NamingError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }
    };
}

impl_id_conversions!(InterfaceId);
impl_id_conversions!(FunctionId);

/// Cluster-wide name of "this bitstream for this hardware family".
///
/// Rendered as `<interfaceId>-<functionId>`, which is the value the admission
/// webhook writes into [`crate::FUNCTION_ANNOTATION`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalFunctionId {
    pub interface_id: InterfaceId,
    pub function_id: FunctionId,
}

impl LogicalFunctionId {
    pub fn new(interface_id: InterfaceId, function_id: FunctionId) -> Self {
        Self {
            interface_id,
            function_id,
        }
    }

    pub fn parse(value: &str) -> Result<Self, NamingError> {
        let (interface, function) = value
            .trim()
            .split_once('-')
            .ok_or_else(|| NamingError::InvalidFunctionRef(value.to_string()))?;
        Ok(Self {
            interface_id: InterfaceId::parse(interface)?,
            function_id: FunctionId::parse(function)?,
        })
    }
}

impl fmt::Display for LogicalFunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.interface_id, self.function_id)
    }
}

impl FromStr for LogicalFunctionId {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LogicalFunctionId {
    type Error = NamingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LogicalFunctionId> for String {
    fn from(value: LogicalFunctionId) -> Self {
        value.to_string()
    }
}
