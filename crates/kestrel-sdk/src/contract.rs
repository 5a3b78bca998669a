//! Contract-bound read accessors.

use std::sync::Arc;

use kestrel_chain::codec::{big_map_types, storage_type};
use kestrel_chain::{Codec, NodeRpc};
use kestrel_core::{Address, ContractScript, KestrelError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// Reads storage and big map entries of one contract.
#[derive(Clone)]
pub struct Contract {
    address: Address,
    rpc: Arc<dyn NodeRpc>,
    codec: Arc<dyn Codec>,
}

impl Contract {
    pub fn new(address: impl Into<Address>, rpc: Arc<dyn NodeRpc>, codec: Arc<dyn Codec>) -> Self {
        Self {
            address: address.into(),
            rpc,
            codec,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn script(&self) -> Result<ContractScript> {
        self.rpc.script(&self.address).await
    }

    /// Storage type from `schema`, or from the contract's code when absent.
    async fn storage_schema(&self, schema: Option<&Value>) -> Result<Value> {
        if let Some(schema) = schema {
            return Ok(schema.clone());
        }
        let script = self.script().await?;
        storage_type(&script.code).cloned().ok_or_else(|| {
            KestrelError::Serialization(format!("{} declares no storage type", self.address))
        })
    }

    /// Current storage decoded through `schema` (the storage type).
    pub async fn storage<T: DeserializeOwned>(&self, schema: Option<&Value>) -> Result<T> {
        let (raw, ty) = futures::try_join!(self.rpc.storage(&self.address), self.storage_schema(schema))?;
        let decoded = self.codec.decode(&raw, &ty)?;
        debug!(contract = %self.address, "decoded storage");
        Ok(serde_json::from_value(decoded)?)
    }

    /// Value under `key` in the contract's big map, `None` when absent.
    ///
    /// `schema` may be the storage type or the big map type itself.
    pub async fn big_map_key<T: DeserializeOwned>(
        &self,
        key: &Value,
        schema: Option<&Value>,
    ) -> Result<Option<T>> {
        let ty = self.storage_schema(schema).await?;
        let (key_ty, value_ty) = big_map_types(&ty).ok_or_else(|| {
            KestrelError::Serialization(format!("no big map in storage type of {}", self.address))
        })?;

        let encoded = self.codec.encode_key(key, key_ty)?;
        let Some(raw) = self.rpc.big_map_get(&self.address, &encoded, key_ty).await? else {
            return Ok(None);
        };
        let decoded = self.codec.decode(&raw, value_ty)?;
        Ok(Some(serde_json::from_value(decoded)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_chain::{InMemoryNode, JsonCodec};
    use kestrel_core::Mutez;
    use serde_json::json;

    fn storage_ty() -> Value {
        json!({"prim": "pair", "args": [
            {"prim": "big_map", "args": [{"prim": "address"}, {"prim": "nat"}]},
            {"prim": "string"}
        ]})
    }

    async fn ledger() -> (InMemoryNode, Contract) {
        let node = InMemoryNode::new();
        node.add_contract(
            "KT1ledger",
            ContractScript {
                code: json!([
                    {"prim": "parameter", "args": [{"prim": "unit"}]},
                    {"prim": "storage", "args": [storage_ty()]},
                    {"prim": "code", "args": [[]]}
                ]),
                storage: json!({"prim": "Pair", "args": [{"int": "17"}, {"string": "tok"}]}),
            },
            Mutez::ZERO,
        )
        .await;
        node.set_big_map_value("KT1ledger", &json!({"string": "tz1holder"}), json!({"int": "250"}))
            .await
            .unwrap();
        let contract = Contract::new("KT1ledger", Arc::new(node.clone()), Arc::new(JsonCodec));
        (node, contract)
    }

    #[tokio::test]
    async fn test_storage_with_fetched_schema() {
        let (_node, contract) = ledger().await;
        let (map_id, name): (String, String) = contract.storage(None).await.unwrap();
        assert_eq!(map_id, "17");
        assert_eq!(name, "tok");
    }

    #[tokio::test]
    async fn test_storage_with_supplied_schema() {
        let (_node, contract) = ledger().await;
        let raw: Value = contract.storage(Some(&json!({"prim": "unit"}))).await.unwrap();
        assert_eq!(raw, Value::Null);
    }

    #[tokio::test]
    async fn test_big_map_key() {
        let (_node, contract) = ledger().await;
        let balance: Option<String> = contract.big_map_key(&json!("tz1holder"), None).await.unwrap();
        assert_eq!(balance.as_deref(), Some("250"));

        let missing: Option<String> = contract.big_map_key(&json!("tz1nobody"), None).await.unwrap();
        assert_eq!(missing, None);

        let big_map_ty = json!({"prim": "big_map", "args": [{"prim": "address"}, {"prim": "nat"}]});
        let direct: Option<String> = contract
            .big_map_key(&json!("tz1holder"), Some(&big_map_ty))
            .await
            .unwrap();
        assert_eq!(direct.as_deref(), Some("250"));
    }

    #[tokio::test]
    async fn test_key_type_mismatch_is_validation() {
        let (_node, contract) = ledger().await;
        let err = contract
            .big_map_key::<String>(&json!(true), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Validation(_)));
    }
}
