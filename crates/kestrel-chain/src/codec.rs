//! Encoding layer: forging envelopes and converting Micheline values.

use kestrel_core::{KestrelError, OperationEnvelope, OperationHash, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::micheline;

/// Converts operations and contract values to and from the node's wire form.
pub trait Codec: Send + Sync {
    /// Forge an envelope to wire bytes.
    fn forge(&self, envelope: &OperationEnvelope) -> Result<Vec<u8>>;

    /// Parse forged bytes back to an envelope.
    fn parse(&self, bytes: &[u8]) -> Result<OperationEnvelope>;

    /// Content-addressed hash of signed bytes.
    fn operation_hash(&self, signed_bytes: &[u8]) -> OperationHash;

    /// Convert human-readable contract code to wire form.
    fn code_from_text(&self, text: &str) -> Result<Value>;

    /// Convert a human-readable value (storage, parameter) to wire form.
    fn value_from_text(&self, text: &str) -> Result<Value>;

    /// Decode a wire value of type `ty` into plain JSON.
    fn decode(&self, value: &Value, ty: &Value) -> Result<Value>;

    /// Encode a plain JSON key of type `ty` into wire form.
    fn encode_key(&self, key: &Value, ty: &Value) -> Result<Value>;
}

/// Codec whose wire form is the JSON rendering of the envelope and of
/// Micheline expressions. Forged bytes are the compact JSON of the envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn forge(&self, envelope: &OperationEnvelope) -> Result<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| KestrelError::Forge(e.to_string()))
    }

    fn parse(&self, bytes: &[u8]) -> Result<OperationEnvelope> {
        serde_json::from_slice(bytes).map_err(|e| KestrelError::Forge(e.to_string()))
    }

    fn operation_hash(&self, signed_bytes: &[u8]) -> OperationHash {
        format!("o{}", hex::encode(Sha256::digest(signed_bytes)))
    }

    fn code_from_text(&self, text: &str) -> Result<Value> {
        let code = parse_micheline(text)?;
        let Some(sections) = code.as_array() else {
            return Err(KestrelError::Validation(
                "contract code must be a sequence".to_string(),
            ));
        };
        for required in ["parameter", "storage", "code"] {
            if !sections.iter().any(|s| prim(s) == Some(required)) {
                return Err(KestrelError::Validation(format!(
                    "contract code has no {required} section"
                )));
            }
        }
        Ok(code)
    }

    fn value_from_text(&self, text: &str) -> Result<Value> {
        parse_micheline(text)
    }

    fn decode(&self, value: &Value, ty: &Value) -> Result<Value> {
        decode_value(value, ty)
    }

    fn encode_key(&self, key: &Value, ty: &Value) -> Result<Value> {
        encode_value(key, ty)
    }
}

/// JSON Micheline is taken as is; anything else goes through the text reader.
fn parse_micheline(text: &str) -> Result<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Array(_) | Value::Object(_))) if is_micheline(&value) => Ok(value),
        Ok(Value::Object(obj)) if !obj.is_empty() => Err(KestrelError::Validation(format!(
            "not a Micheline expression: {}",
            Value::Object(obj)
        ))),
        _ => micheline::read(text),
    }
}

fn is_micheline(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(is_micheline),
        Value::Object(obj) => {
            if let Some(args) = obj.get("args") {
                if !args.as_array().is_some_and(|a| a.iter().all(is_micheline)) {
                    return false;
                }
            }
            obj.get("prim").is_some_and(Value::is_string)
                || ["int", "string", "bytes"]
                    .iter()
                    .any(|k| obj.get(*k).is_some_and(Value::is_string))
        }
        _ => false,
    }
}

fn prim(value: &Value) -> Option<&str> {
    value.get("prim").and_then(Value::as_str)
}

fn args(value: &Value) -> &[Value] {
    value
        .get("args")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn mismatch(value: &Value, ty: &Value) -> KestrelError {
    KestrelError::Serialization(format!("value {value} does not match type {ty}"))
}

fn decode_value(value: &Value, ty: &Value) -> Result<Value> {
    let Some(ty_prim) = prim(ty) else {
        return Err(KestrelError::Serialization(format!("not a type: {ty}")));
    };
    let ty_args = args(ty);

    match ty_prim {
        // Numbers stay decimal strings: Micheline integers are unbounded.
        "int" | "nat" | "mutez" => value
            .get("int")
            .filter(|raw| raw.is_string())
            .cloned()
            .ok_or_else(|| mismatch(value, ty)),
        "string" | "address" | "key_hash" | "key" | "signature" | "timestamp" | "contract" => value
            .get("string")
            .or_else(|| value.get("int"))
            .or_else(|| value.get("bytes"))
            .cloned()
            .ok_or_else(|| mismatch(value, ty)),
        "bytes" => value.get("bytes").cloned().ok_or_else(|| mismatch(value, ty)),
        "bool" => match prim(value) {
            Some("True") => Ok(Value::Bool(true)),
            Some("False") => Ok(Value::Bool(false)),
            _ => Err(mismatch(value, ty)),
        },
        "unit" => Ok(Value::Null),
        "pair" if ty_args.len() == 2 => {
            let items = match (prim(value), value.as_array()) {
                (Some("Pair"), _) => args(value),
                (_, Some(seq)) => seq.as_slice(),
                _ => return Err(mismatch(value, ty)),
            };
            if items.len() != 2 {
                return Err(mismatch(value, ty));
            }
            Ok(json!([
                decode_value(&items[0], &ty_args[0])?,
                decode_value(&items[1], &ty_args[1])?
            ]))
        }
        "option" if ty_args.len() == 1 => match prim(value) {
            Some("None") => Ok(Value::Null),
            Some("Some") => match args(value) {
                [inner] => decode_value(inner, &ty_args[0]),
                _ => Err(mismatch(value, ty)),
            },
            _ => Err(mismatch(value, ty)),
        },
        "or" if ty_args.len() == 2 => match (prim(value), args(value)) {
            (Some("Left"), [inner]) => Ok(json!({ "Left": decode_value(inner, &ty_args[0])? })),
            (Some("Right"), [inner]) => Ok(json!({ "Right": decode_value(inner, &ty_args[1])? })),
            _ => Err(mismatch(value, ty)),
        },
        "list" | "set" if ty_args.len() == 1 => value
            .as_array()
            .ok_or_else(|| mismatch(value, ty))?
            .iter()
            .map(|item| decode_value(item, &ty_args[0]))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        "map" | "big_map" if ty_args.len() == 2 => {
            // A big map held in storage is referenced by its id.
            if let Some(id) = value.get("int") {
                return Ok(id.clone());
            }
            value
                .as_array()
                .ok_or_else(|| mismatch(value, ty))?
                .iter()
                .map(|elt| match (prim(elt), args(elt)) {
                    (Some("Elt"), [k, v]) => Ok(json!([
                        decode_value(k, &ty_args[0])?,
                        decode_value(v, &ty_args[1])?
                    ])),
                    _ => Err(mismatch(elt, ty)),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Array)
        }
        _ => Ok(value.clone()),
    }
}

fn encode_value(key: &Value, ty: &Value) -> Result<Value> {
    let invalid = || KestrelError::Validation(format!("key {key} does not match type {ty}"));
    let Some(ty_prim) = prim(ty) else {
        return Err(KestrelError::Validation(format!("not a type: {ty}")));
    };
    let ty_args = args(ty);

    match (ty_prim, key) {
        ("int" | "nat" | "mutez", Value::Number(n)) => Ok(json!({ "int": n.to_string() })),
        ("int" | "nat" | "mutez", Value::String(s)) if s.parse::<i128>().is_ok() => {
            Ok(json!({ "int": s }))
        }
        ("string" | "address" | "key_hash" | "key" | "timestamp", Value::String(s)) => {
            Ok(json!({ "string": s }))
        }
        ("bytes", Value::String(s)) => Ok(json!({ "bytes": s })),
        ("bool", Value::Bool(b)) => Ok(json!({ "prim": if *b { "True" } else { "False" } })),
        ("pair", Value::Array(items)) if items.len() == 2 && ty_args.len() == 2 => Ok(json!({
            "prim": "Pair",
            "args": [encode_value(&items[0], &ty_args[0])?, encode_value(&items[1], &ty_args[1])?]
        })),
        (_, value) if is_micheline(value) => Ok(value.clone()),
        _ => Err(invalid()),
    }
}

/// Storage type declared in contract code (`storage` section).
pub fn storage_type(code: &Value) -> Option<&Value> {
    code.as_array()?
        .iter()
        .find(|section| prim(section) == Some("storage"))
        .and_then(|section| args(section).first())
}

/// Key and value types of the first big map in a storage type.
pub fn big_map_types(ty: &Value) -> Option<(&Value, &Value)> {
    if prim(ty) == Some("big_map") {
        if let [key, value] = args(ty) {
            return Some((key, value));
        }
    }
    args(ty).iter().find_map(big_map_types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{Delegation, Mutez, OperationContent};

    fn storage_ty() -> Value {
        json!({"prim": "pair", "args": [
            {"prim": "big_map", "args": [{"prim": "address"}, {"prim": "nat"}]},
            {"prim": "option", "args": [{"prim": "string"}]}
        ]})
    }

    #[test]
    fn test_forge_parse_round_trip() {
        let envelope = OperationEnvelope::new(
            "BLhead",
            vec![OperationContent::Delegation(Delegation {
                source: "tz1a".into(),
                fee: Mutez(1420),
                counter: 7,
                gas_limit: 10_600,
                storage_limit: 0,
                delegate: None,
            })],
        );
        let codec = JsonCodec::new();
        let bytes = codec.forge(&envelope).unwrap();
        assert_eq!(codec.parse(&bytes).unwrap(), envelope);
        assert!(codec.parse(b"not json").is_err());
    }

    #[test]
    fn test_operation_hash_is_stable() {
        let codec = JsonCodec::new();
        let a = codec.operation_hash(b"abc");
        assert_eq!(a, codec.operation_hash(b"abc"));
        assert_ne!(a, codec.operation_hash(b"abd"));
        assert!(a.starts_with('o'));
    }

    #[test]
    fn test_text_conversion_rejects_garbage() {
        let codec = JsonCodec::new();
        assert!(codec.value_from_text(r#"{"int": "5"}"#).is_ok());
        assert!(matches!(
            codec.value_from_text("Pair 1 (2"),
            Err(KestrelError::Validation(_))
        ));
        assert!(codec.value_from_text(r#"{"foo": 1}"#).is_err());
        assert!(codec.code_from_text(r#"{"int": "5"}"#).is_err());
        assert!(codec.code_from_text("parameter unit; storage int").is_err());
    }

    #[test]
    fn test_text_and_json_forms_agree() {
        let codec = JsonCodec::new();
        assert_eq!(
            codec.value_from_text("Pair 1 2").unwrap(),
            json!({"prim": "Pair", "args": [{"int": "1"}, {"int": "2"}]})
        );
        assert_eq!(codec.value_from_text("Unit").unwrap(), json!({"prim": "Unit"}));
        assert_eq!(codec.value_from_text("{}").unwrap(), json!([]));

        let text = codec
            .code_from_text("parameter unit; storage int; code { CDR ; NIL operation ; PAIR }")
            .unwrap();
        let braced = codec
            .code_from_text("{ parameter unit ; storage int ; code { CDR ; NIL operation ; PAIR } }")
            .unwrap();
        assert_eq!(text, braced);
        assert_eq!(storage_type(&text), Some(&json!({"prim": "int"})));
        let json_form = codec.code_from_text(&text.to_string()).unwrap();
        assert_eq!(json_form, text);
    }

    #[test]
    fn test_decode_storage() {
        let value = json!({"prim": "Pair", "args": [
            {"int": "12"},
            {"prim": "Some", "args": [{"string": "hello"}]}
        ]});
        let decoded = JsonCodec.decode(&value, &storage_ty()).unwrap();
        assert_eq!(decoded, json!(["12", "hello"]));

        let huge = json!({"int": "340282366920938463463374607431768211456"});
        assert_eq!(
            JsonCodec.decode(&huge, &json!({"prim": "nat"})).unwrap(),
            json!("340282366920938463463374607431768211456")
        );
    }

    #[test]
    fn test_decode_mismatch() {
        let err = JsonCodec.decode(&json!({"string": "x"}), &json!({"prim": "nat"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_encode_key() {
        let ty = json!({"prim": "address"});
        assert_eq!(
            JsonCodec.encode_key(&json!("tz1abc"), &ty).unwrap(),
            json!({"string": "tz1abc"})
        );
        assert_eq!(
            JsonCodec.encode_key(&json!(5), &json!({"prim": "nat"})).unwrap(),
            json!({"int": "5"})
        );
        assert!(JsonCodec.encode_key(&json!(true), &ty).is_err());
    }

    #[test]
    fn test_type_lookup() {
        let code = json!([
            {"prim": "parameter", "args": [{"prim": "unit"}]},
            {"prim": "storage", "args": [storage_ty()]},
            {"prim": "code", "args": [[]]}
        ]);
        let ty = storage_type(&code).unwrap();
        let (key, value) = big_map_types(ty).unwrap();
        assert_eq!(key, &json!({"prim": "address"}));
        assert_eq!(value, &json!({"prim": "nat"}));
    }
}
