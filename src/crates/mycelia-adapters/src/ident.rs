//! Wire-level identity primitives shared by the broker and storage adapters
//!
//! A [`CallId`] is a SHA-256 content hash over a call's node reference and
//! argument tree. Two calls with the same id are the same entity everywhere
//! in the system: in the scheduler cache, on the queue, and in storage.
//! The hash itself is computed by the engine crate; adapters only transport
//! and compare ids.

use crate::error::{AdapterError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Content-derived identity of a call
///
/// Wraps a 32-byte digest. Displayed and serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId([u8; 32]);

impl CallId {
    /// Wrap a raw digest.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character lowercase hex string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(AdapterError::Custom(format!(
                "invalid call id '{}': expected 64 hex characters",
                s
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| AdapterError::Custom(format!("invalid call id '{}'", s)))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| AdapterError::Custom(format!("invalid call id '{}'", s)))?;
        }
        Ok(Self(bytes))
    }

    /// Abbreviated form for log output.
    pub fn short(&self) -> String {
        let mut s = String::with_capacity(12);
        for byte in &self.0[..6] {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.short())
    }
}

impl Serialize for CallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CallId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Reference to a node within a graph namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    /// Graph the node belongs to
    pub graph: String,
    /// Node name, unique within the graph
    pub node: String,
}

impl NodeRef {
    pub fn new(graph: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            graph: graph.into(),
            node: node.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.graph, self.node)
    }
}

/// Classified failure kind recorded against a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NodeNotRegistered,
    NodeExecution,
    DependencyFailed,
    NonSerializableResult,
    NonSerializableArgument,
    NonDeterministicArgument,
    UnreachableDeferredCall,
    SessionCancelled,
    Other,
}

/// Serializable error descriptor stored as a failed call's result
///
/// Propagated to dependents unchanged: a transitive dependent of a failed
/// call records the same `DependencyFailed` descriptor, pointing at the
/// original failing call, as the direct dependent does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// For `DependencyFailed`: the call whose failure is being propagated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency: Option<CallId>,
    /// For `DependencyFailed`: the error the dependency recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            dependency: None,
            inner: None,
        }
    }

    /// Descriptor for a call that never ran because `dependency` failed.
    pub fn dependency_failed(dependency: CallId, inner: ErrorInfo) -> Self {
        Self {
            kind: ErrorKind::DependencyFailed,
            message: format!("dependency {} failed: {}", dependency.short(), inner.message),
            dependency: Some(dependency),
            inner: Some(Box::new(inner)),
        }
    }

    /// Follow `inner` links to the originating error.
    pub fn root_cause(&self) -> &ErrorInfo {
        let mut current = self;
        while let Some(inner) = &current.inner {
            current = inner;
        }
        current
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with(byte: u8) -> CallId {
        CallId::from_bytes([byte; 32])
    }

    #[test]
    fn test_call_id_hex_round_trip() {
        let id = id_with(0xab);
        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(CallId::parse(&hex).unwrap(), id);
    }

    #[test]
    fn test_call_id_parse_rejects_bad_input() {
        assert!(CallId::parse("abc").is_err());
        assert!(CallId::parse(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_call_id_serde_round_trip() {
        let id = id_with(0x17);
        let json = serde_json::to_string(&id).unwrap();
        let restored: CallId = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, id);
    }

    #[test]
    fn test_dependency_failed_propagates_unchanged() {
        let origin = ErrorInfo::new(ErrorKind::NodeExecution, "boom");
        let propagated = ErrorInfo::dependency_failed(id_with(1), origin.clone());

        assert_eq!(propagated.kind, ErrorKind::DependencyFailed);
        assert_eq!(propagated.dependency, Some(id_with(1)));
        assert_eq!(propagated.root_cause(), &origin);
    }
}
