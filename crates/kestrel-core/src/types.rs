//! Common types used across Kestrel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Account identifier (public-key-hash or contract address).
pub type Address = String;

/// Identifier of an injected operation.
pub type OperationHash = String;

/// Hash of a block, used as an envelope branch.
pub type BlockHash = String;

/// Kind of an operation content record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Reveal,
    Transaction,
    Origination,
    Delegation,
    Activation,
}

impl OperationKind {
    /// Returns true for kinds that carry a counter and a fee (manager operations).
    pub fn is_manager(&self) -> bool {
        !matches!(self, OperationKind::Activation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Reveal => "reveal",
            OperationKind::Transaction => "transaction",
            OperationKind::Origination => "origination",
            OperationKind::Delegation => "delegation",
            OperationKind::Activation => "activate_account",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The node returns integers either as JSON numbers or decimal strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum StringOrNumber {
    Number(u64),
    String(String),
}

impl StringOrNumber {
    pub(crate) fn into_u64(self) -> Result<u64, String> {
        match self {
            StringOrNumber::Number(n) => Ok(n),
            StringOrNumber::String(s) => s
                .parse()
                .map_err(|_| format!("expected an unsigned integer, got {s:?}")),
        }
    }
}

/// Serde adapter for `u64` fields the node encodes as decimal strings
/// (counters, gas and storage limits).
pub mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::StringOrNumber;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        StringOrNumber::deserialize(deserializer)?
            .into_u64()
            .map_err(serde::de::Error::custom)
    }
}

/// Parse an integer the node returned as a JSON number or string.
pub fn parse_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_kinds() {
        assert!(OperationKind::Reveal.is_manager());
        assert!(OperationKind::Transaction.is_manager());
        assert!(!OperationKind::Activation.is_manager());
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64(&serde_json::json!("41")), Some(41));
        assert_eq!(parse_u64(&serde_json::json!(41)), Some(41));
        assert_eq!(parse_u64(&serde_json::json!(null)), None);
    }
}
