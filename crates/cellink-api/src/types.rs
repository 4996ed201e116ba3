// ── Protocol value types ──
//
// Node addressing, typed values, status codes, and the discovery /
// monitoring descriptors exchanged with a tag server.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ── NodeId ──────────────────────────────────────────────────────────

/// Address of a tag on the server: namespace index plus string identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: String,
}

impl NodeId {
    pub fn new(namespace: u16, identifier: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};s={}", self.namespace, self.identifier)
    }
}

// ── Values ──────────────────────────────────────────────────────────

/// Wire type of a tag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum ValueType {
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    UInt64,
    Double,
    String,
    ByteString,
}

/// A typed tag value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Variant {
    #[default]
    Empty,
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    UInt64(u64),
    Double(f64),
    String(String),
    ByteString(Bytes),
}

impl Variant {
    /// Wire type of this value, `None` for [`Variant::Empty`].
    pub fn value_type(&self) -> Option<ValueType> {
        Some(match self {
            Self::Empty => return None,
            Self::Boolean(_) => ValueType::Boolean,
            Self::Int16(_) => ValueType::Int16,
            Self::UInt16(_) => ValueType::UInt16,
            Self::Int32(_) => ValueType::Int32,
            Self::UInt32(_) => ValueType::UInt32,
            Self::UInt64(_) => ValueType::UInt64,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
            Self::ByteString(_) => ValueType::ByteString,
        })
    }

    /// Lossless conversion to `u16`. Booleans map to 0/1.
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Self::UInt16(v) => Some(*v),
            Self::Boolean(b) => Some(u16::from(*b)),
            Self::Int16(v) => u16::try_from(*v).ok(),
            Self::Int32(v) => u16::try_from(*v).ok(),
            Self::UInt32(v) => u16::try_from(*v).ok(),
            Self::UInt64(v) => u16::try_from(*v).ok(),
            Self::Empty | Self::Double(_) | Self::String(_) | Self::ByteString(_) => None,
        }
    }

    /// Lossless conversion to `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt16(v) => Some(u64::from(*v)),
            Self::UInt32(v) => Some(u64::from(*v)),
            Self::UInt64(v) => Some(*v),
            Self::Int16(v) => u64::try_from(*v).ok(),
            Self::Int32(v) => u64::try_from(*v).ok(),
            Self::Boolean(b) => Some(u64::from(*b)),
            Self::Empty | Self::Double(_) | Self::String(_) | Self::ByteString(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            other => other.as_u16().map(|v| v != 0),
        }
    }

    /// Raw bytes of a byte string. Strings are accepted as their UTF-8 bytes.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Self::ByteString(b) => Some(b.clone()),
            Self::String(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        }
    }

    /// Re-type this value for a write of the given wire type.
    ///
    /// Returns `None` when the conversion would lose information.
    pub fn coerce(&self, target: ValueType) -> Option<Self> {
        if self.value_type() == Some(target) {
            return Some(self.clone());
        }
        match target {
            ValueType::Boolean => self.as_bool().map(Self::Boolean),
            ValueType::UInt16 => self.as_u16().map(Self::UInt16),
            ValueType::Int16 => self.as_u64().and_then(|v| i16::try_from(v).ok()).map(Self::Int16),
            ValueType::UInt32 => self.as_u64().and_then(|v| u32::try_from(v).ok()).map(Self::UInt32),
            ValueType::Int32 => self.as_u64().and_then(|v| i32::try_from(v).ok()).map(Self::Int32),
            ValueType::UInt64 => self.as_u64().map(Self::UInt64),
            ValueType::ByteString => self.as_bytes().map(Self::ByteString),
            ValueType::String => match self {
                Self::ByteString(b) => std::str::from_utf8(b).ok().map(|s| Self::String(s.into())),
                _ => None,
            },
            ValueType::Double => match self {
                Self::Int16(v) => Some(Self::Double(f64::from(*v))),
                Self::UInt16(v) => Some(Self::Double(f64::from(*v))),
                Self::Int32(v) => Some(Self::Double(f64::from(*v))),
                Self::UInt32(v) => Some(Self::Double(f64::from(*v))),
                _ => None,
            },
        }
    }
}

impl From<u16> for Variant {
    fn from(v: u16) -> Self {
        Self::UInt16(v)
    }
}

impl From<u64> for Variant {
    fn from(v: u64) -> Self {
        Self::UInt64(v)
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<Bytes> for Variant {
    fn from(v: Bytes) -> Self {
        Self::ByteString(v)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("<empty>"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::ByteString(b) => {
                f.write_str("0x")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
        }
    }
}

/// A value together with the per-item status the server reported for it.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
}

impl DataValue {
    pub fn good(value: Variant) -> Self {
        Self {
            value,
            status: StatusCode::GOOD,
        }
    }

    pub fn bad(status: StatusCode) -> Self {
        Self {
            value: Variant::Empty,
            status,
        }
    }
}

/// One item of a batched write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteValue {
    pub node: NodeId,
    pub value: Variant,
}

/// Result of a batched service call: the service status plus one entry
/// per requested item, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResult<T> {
    pub status: StatusCode,
    pub results: Vec<T>,
}

// ── Status codes ────────────────────────────────────────────────────

/// Service / item status code. The top two bits carry the severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: Self = Self(0);
    pub const UNCERTAIN: Self = Self(0x4000_0000);
    pub const BAD_UNEXPECTED_ERROR: Self = Self(0x8001_0000);
    pub const BAD_INTERNAL_ERROR: Self = Self(0x8002_0000);
    pub const BAD_COMMUNICATION_ERROR: Self = Self(0x8005_0000);
    pub const BAD_TIMEOUT: Self = Self(0x800A_0000);
    pub const BAD_NOTHING_TO_DO: Self = Self(0x800F_0000);
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);
    pub const BAD_NOT_WRITABLE: Self = Self(0x803B_0000);
    pub const BAD_NOT_FOUND: Self = Self(0x803E_0000);
    pub const BAD_TYPE_MISMATCH: Self = Self(0x8074_0000);
    pub const BAD_NOT_CONNECTED: Self = Self(0x808A_0000);

    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    pub fn is_uncertain(self) -> bool {
        self.0 & 0xC000_0000 == 0x4000_0000
    }

    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::GOOD => "Good",
            Self::UNCERTAIN => "Uncertain",
            Self::BAD_UNEXPECTED_ERROR => "BadUnexpectedError",
            Self::BAD_INTERNAL_ERROR => "BadInternalError",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_NOTHING_TO_DO => "BadNothingToDo",
            Self::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            Self::BAD_NOT_WRITABLE => "BadNotWritable",
            Self::BAD_NOT_FOUND => "BadNotFound",
            Self::BAD_TYPE_MISMATCH => "BadTypeMismatch",
            Self::BAD_NOT_CONNECTED => "BadNotConnected",
            _ => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

// ── Discovery ───────────────────────────────────────────────────────

/// A server returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescription {
    pub application_uri: String,
    pub discovery_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum SecurityMode {
    Invalid,
    None,
    Sign,
    SignAndEncrypt,
}

/// An endpoint offered by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescription {
    pub endpoint_url: String,
    pub security_mode: SecurityMode,
    pub security_policy_uri: String,
}

impl EndpointDescription {
    /// An endpoint the client can open a session on.
    pub fn is_viable(&self) -> bool {
        self.security_mode != SecurityMode::Invalid && !self.endpoint_url.is_empty()
    }
}

// ── Monitoring ──────────────────────────────────────────────────────

/// Live change-subscription state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MonitoringState {
    Inactive,
    Active,
}

/// Parameters for enabling change notification on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringParameters {
    pub sampling_interval: Duration,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub reporting: bool,
}

impl Default for MonitoringParameters {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_millis(100),
            queue_size: 1,
            discard_oldest: true,
            reporting: true,
        }
    }
}

// ── Backend events ──────────────────────────────────────────────────

/// Unsolicited notifications from a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A monitored node reported a new value.
    DataChange { node: NodeId, value: Variant },
    /// The session dropped without a disconnect request.
    SessionLost { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_severity_bits() {
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode::UNCERTAIN.is_uncertain());
        assert!(!StatusCode::UNCERTAIN.is_good());
        assert!(StatusCode::BAD_TYPE_MISMATCH.is_bad());
        assert_eq!(StatusCode(0x8123_0000).to_string(), "0x81230000");
    }

    #[test]
    fn u16_conversion_rejects_out_of_range() {
        assert_eq!(Variant::UInt32(7).as_u16(), Some(7));
        assert_eq!(Variant::UInt32(70_000).as_u16(), None);
        assert_eq!(Variant::Int16(-1).as_u16(), None);
        assert_eq!(Variant::String("3".into()).as_u16(), None);
    }

    #[test]
    fn coerce_follows_write_type() {
        assert_eq!(Variant::UInt16(2).coerce(ValueType::UInt64), Some(Variant::UInt64(2)));
        assert_eq!(Variant::UInt64(1 << 20).coerce(ValueType::UInt16), None);
        assert_eq!(
            Variant::String("ab".into()).coerce(ValueType::ByteString),
            Some(Variant::ByteString(Bytes::from_static(b"ab")))
        );
    }

    #[test]
    fn byte_string_displays_as_hex() {
        let v = Variant::ByteString(Bytes::from_static(&[0xAB, 0x12]));
        assert_eq!(v.to_string(), "0xAB12");
    }

    #[test]
    fn node_id_display() {
        assert_eq!(NodeId::new(2, "DeviceType").to_string(), "ns=2;s=DeviceType");
    }
}
