// ── Domain model ──

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Transfer direction, seen from the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Direction {
    /// Tooling moves into the station (the station receives).
    PutIn,
    /// Tooling moves out of the station (the station sends).
    TakeOut,
}

/// Identifier of a tooling carrier as read from the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolingIdentifier {
    pub kind: u16,
    pub code: Bytes,
}

impl ToolingIdentifier {
    pub fn new(kind: u16, code: impl Into<Bytes>) -> Self {
        Self {
            kind,
            code: code.into(),
        }
    }
}

impl fmt::Display for ToolingIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TYPE={}, ID=0x", self.kind)?;
        for byte in &self.code {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Work data attached to a tooling carrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolingData {
    pub identifier: ToolingIdentifier,
    pub index: u64,
    pub content: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_display_is_hex() {
        let id = ToolingIdentifier::new(1, vec![0xAB, 0x12]);
        assert_eq!(id.to_string(), "TYPE=1, ID=0xAB12");
    }
}
