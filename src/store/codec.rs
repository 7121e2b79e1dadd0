//! Binary-safe value codec for cached payloads.
//!
//! Plain JSON cannot tell a byte buffer from an array of small numbers, and
//! cannot carry typed numeric arrays at all. Values are therefore modeled as
//! a [`Payload`] tree and encoded to JSON with explicit tags:
//!
//! - raw bytes: `{"__bin": "bytes", "b64": "<base64>"}`
//! - typed arrays: `{"__bin": "<kind>", "b64": "<base64 of little-endian elements>"}`
//! - user objects that already contain a `__bin` key:
//!   `{"__bin": "object", "value": {...}}`
//!
//! Decoding is the exact inverse of encoding at any nesting depth.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Number, Value};

use crate::error::{CacheError, Result};

/// Marker key identifying a tagged value.
pub const TAG: &str = "__bin";

const BYTES_TAG: &str = "bytes";
const OBJECT_TAG: &str = "object";

/// Fixed-width numeric array, stored little-endian.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedArray {
    I8(Vec<i8>),
    U8(Vec<u8>),
    /// Clamped byte array: same storage as `U8`, distinct kind.
    U8Clamped(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
    U64(Vec<u64>),
}

fn pack<T, const N: usize>(values: &[T], to_le: impl Fn(&T) -> [u8; N]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * N);
    for v in values {
        out.extend_from_slice(&to_le(v));
    }
    out
}

fn unpack<T, const N: usize>(kind: &str, bytes: &[u8], from_le: impl Fn([u8; N]) -> T) -> Result<Vec<T>> {
    if bytes.len() % N != 0 {
        return Err(CacheError::Codec(format!(
            "{kind} payload of {} bytes is not a multiple of {N}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut arr = [0u8; N];
            arr.copy_from_slice(chunk);
            from_le(arr)
        })
        .collect())
}

impl TypedArray {
    pub fn kind(&self) -> &'static str {
        match self {
            TypedArray::I8(_) => "i8",
            TypedArray::U8(_) => "u8",
            TypedArray::U8Clamped(_) => "u8c",
            TypedArray::I16(_) => "i16",
            TypedArray::U16(_) => "u16",
            TypedArray::I32(_) => "i32",
            TypedArray::U32(_) => "u32",
            TypedArray::F32(_) => "f32",
            TypedArray::F64(_) => "f64",
            TypedArray::I64(_) => "i64",
            TypedArray::U64(_) => "u64",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TypedArray::I8(v) => v.len(),
            TypedArray::U8(v) | TypedArray::U8Clamped(v) => v.len(),
            TypedArray::I16(v) => v.len(),
            TypedArray::U16(v) => v.len(),
            TypedArray::I32(v) => v.len(),
            TypedArray::U32(v) => v.len(),
            TypedArray::F32(v) => v.len(),
            TypedArray::F64(v) => v.len(),
            TypedArray::I64(v) => v.len(),
            TypedArray::U64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TypedArray::I8(v) => pack(v, |x| x.to_le_bytes()),
            TypedArray::U8(v) | TypedArray::U8Clamped(v) => v.clone(),
            TypedArray::I16(v) => pack(v, |x| x.to_le_bytes()),
            TypedArray::U16(v) => pack(v, |x| x.to_le_bytes()),
            TypedArray::I32(v) => pack(v, |x| x.to_le_bytes()),
            TypedArray::U32(v) => pack(v, |x| x.to_le_bytes()),
            TypedArray::F32(v) => pack(v, |x| x.to_le_bytes()),
            TypedArray::F64(v) => pack(v, |x| x.to_le_bytes()),
            TypedArray::I64(v) => pack(v, |x| x.to_le_bytes()),
            TypedArray::U64(v) => pack(v, |x| x.to_le_bytes()),
        }
    }

    fn from_le_bytes(kind: &str, bytes: &[u8]) -> Result<Self> {
        Ok(match kind {
            "i8" => TypedArray::I8(unpack(kind, bytes, i8::from_le_bytes)?),
            "u8" => TypedArray::U8(bytes.to_vec()),
            "u8c" => TypedArray::U8Clamped(bytes.to_vec()),
            "i16" => TypedArray::I16(unpack(kind, bytes, i16::from_le_bytes)?),
            "u16" => TypedArray::U16(unpack(kind, bytes, u16::from_le_bytes)?),
            "i32" => TypedArray::I32(unpack(kind, bytes, i32::from_le_bytes)?),
            "u32" => TypedArray::U32(unpack(kind, bytes, u32::from_le_bytes)?),
            "f32" => TypedArray::F32(unpack(kind, bytes, f32::from_le_bytes)?),
            "f64" => TypedArray::F64(unpack(kind, bytes, f64::from_le_bytes)?),
            "i64" => TypedArray::I64(unpack(kind, bytes, i64::from_le_bytes)?),
            "u64" => TypedArray::U64(unpack(kind, bytes, u64::from_le_bytes)?),
            other => return Err(CacheError::Codec(format!("unknown binary tag \"{other}\""))),
        })
    }

    /// Elements as plain JSON numbers. Non-finite floats become `null`.
    fn to_json_numbers(&self) -> Vec<Value> {
        fn float(f: f64) -> Value {
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        match self {
            TypedArray::I8(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TypedArray::U8(v) | TypedArray::U8Clamped(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TypedArray::I16(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TypedArray::U16(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TypedArray::I32(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TypedArray::U32(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TypedArray::F32(v) => v.iter().map(|x| float(*x as f64)).collect(),
            TypedArray::F64(v) => v.iter().map(|x| float(*x)).collect(),
            TypedArray::I64(v) => v.iter().map(|x| Value::from(*x)).collect(),
            TypedArray::U64(v) => v.iter().map(|x| Value::from(*x)).collect(),
        }
    }
}

/// A cached value: JSON plus first-class binary leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
    Bytes(Vec<u8>),
    Typed(TypedArray),
}

impl Payload {
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Payload)>) -> Self {
        Payload::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Lossy view as plain JSON: bytes and typed arrays become number
    /// arrays, which is the shape `Vec<u8>`/`Vec<f32>` fields deserialize
    /// from.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(b),
            Payload::Number(n) => Value::Number(n),
            Payload::String(s) => Value::String(s),
            Payload::Array(items) => Value::Array(items.into_iter().map(Payload::into_json).collect()),
            Payload::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, v.into_json()))
                    .collect::<Map<String, Value>>(),
            ),
            Payload::Bytes(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
            Payload::Typed(typed) => Value::Array(typed.to_json_numbers()),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::Array(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => {
                Payload::Object(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect())
            }
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<TypedArray> for Payload {
    fn from(typed: TypedArray) -> Self {
        Payload::Typed(typed)
    }
}

fn tagged(tag: &str, bytes: &[u8]) -> Value {
    let mut obj = Map::new();
    obj.insert(TAG.to_string(), Value::String(tag.to_string()));
    obj.insert("b64".to_string(), Value::String(STANDARD.encode(bytes)));
    Value::Object(obj)
}

fn encode_entries(map: &BTreeMap<String, Payload>) -> Map<String, Value> {
    map.iter().map(|(k, v)| (k.clone(), encode(v))).collect()
}

/// Encode a payload into tagged JSON.
pub fn encode(payload: &Payload) -> Value {
    match payload {
        Payload::Null => Value::Null,
        Payload::Bool(b) => Value::Bool(*b),
        Payload::Number(n) => Value::Number(n.clone()),
        Payload::String(s) => Value::String(s.clone()),
        Payload::Array(items) => Value::Array(items.iter().map(encode).collect()),
        Payload::Object(map) if map.contains_key(TAG) => {
            let mut obj = Map::new();
            obj.insert(TAG.to_string(), Value::String(OBJECT_TAG.to_string()));
            obj.insert("value".to_string(), Value::Object(encode_entries(map)));
            Value::Object(obj)
        }
        Payload::Object(map) => Value::Object(encode_entries(map)),
        Payload::Bytes(bytes) => tagged(BYTES_TAG, bytes),
        Payload::Typed(typed) => tagged(typed.kind(), &typed.to_le_bytes()),
    }
}

fn decode_b64(obj: &Map<String, Value>) -> Result<Vec<u8>> {
    let b64 = obj
        .get("b64")
        .and_then(Value::as_str)
        .ok_or_else(|| CacheError::Codec("tagged binary value missing b64 field".to_string()))?;
    STANDARD
        .decode(b64)
        .map_err(|e| CacheError::Codec(format!("invalid base64 in tagged value: {e}")))
}

fn decode_entries(obj: &Map<String, Value>) -> Result<BTreeMap<String, Payload>> {
    obj.iter()
        .map(|(k, v)| Ok((k.clone(), decode(v)?)))
        .collect()
}

/// Decode tagged JSON produced by [`encode`].
pub fn decode(value: &Value) -> Result<Payload> {
    Ok(match value {
        Value::Null => Payload::Null,
        Value::Bool(b) => Payload::Bool(*b),
        Value::Number(n) => Payload::Number(n.clone()),
        Value::String(s) => Payload::String(s.clone()),
        Value::Array(items) => Payload::Array(items.iter().map(decode).collect::<Result<_>>()?),
        Value::Object(obj) => match obj.get(TAG) {
            None => Payload::Object(decode_entries(obj)?),
            Some(Value::String(tag)) if tag == BYTES_TAG => Payload::Bytes(decode_b64(obj)?),
            Some(Value::String(tag)) if tag == OBJECT_TAG => {
                let inner = obj.get("value").and_then(Value::as_object).ok_or_else(|| {
                    CacheError::Codec("escaped object missing value field".to_string())
                })?;
                Payload::Object(decode_entries(inner)?)
            }
            Some(Value::String(tag)) => Payload::Typed(TypedArray::from_le_bytes(tag, &decode_b64(obj)?)?),
            Some(other) => {
                return Err(CacheError::Codec(format!(
                    "binary tag must be a string, got {other}"
                )))
            }
        },
    })
}

/// Encode a payload to bytes ready for encryption.
pub fn to_bytes(payload: &Payload) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&encode(payload))?)
}

/// Inverse of [`to_bytes`].
pub fn from_bytes(bytes: &[u8]) -> Result<Payload> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode(&value)
}
