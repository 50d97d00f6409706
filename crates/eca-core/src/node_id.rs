//! Node identifiers.
//!
//! A node is identified by a 12-byte value, exchanged on the wire as a
//! 24-character hex string (the same layout as a document-database object id).

use crate::error::{EcaError, EcaResult};
use std::fmt;
use std::str::FromStr;

/// Length of a node identifier in bytes.
pub const NODE_ID_LEN: usize = 12;

/// A 12-byte node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; NODE_ID_LEN] {
        self.0
    }

    /// Parse a 24-character hex string. Upper and lower case are accepted.
    pub fn parse_hex(s: &str) -> EcaResult<Self> {
        if s.len() != NODE_ID_LEN * 2 {
            return Err(EcaError::MalformedCredential(format!(
                "expected {} hex characters, got {}",
                NODE_ID_LEN * 2,
                s.len()
            )));
        }
        let mut bytes = [0u8; NODE_ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| EcaError::MalformedCredential(format!("invalid hex: {e}")))?;
        Ok(Self(bytes))
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for NodeId {
    type Err = EcaError;

    fn from_str(s: &str) -> EcaResult<Self> {
        Self::parse_hex(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
