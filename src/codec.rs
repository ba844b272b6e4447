//! Serializer pair for persistent stream backends.
//!
//! Line-oriented backends store one encoded record per newline-terminated
//! line. A [`Codec`] bundles the encode/decode pair a backend applies at its
//! write and read edges. The default codec passes byte and text payloads
//! through verbatim and rejects everything else; decoding returns the raw
//! bytes of the record.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::Value;

type EncodeFn = dyn Fn(&Value) -> Result<Vec<u8>> + Send + Sync;
type DecodeFn = dyn Fn(&[u8]) -> Result<Value> + Send + Sync;

/// An encode/decode pair applied by a persistent backend.
#[derive(Clone)]
pub struct Codec {
    encode: Arc<EncodeFn>,
    decode: Arc<DecodeFn>,
}

impl Codec {
    /// Build a codec from an arbitrary encode/decode pair.
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&Value) -> Result<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }

    /// A codec that decodes records as UTF-8 text (lossily).
    ///
    /// Encoding behaves like the default codec.
    pub fn text() -> Self {
        Self::new(default_encode, |raw| {
            Ok(Value::Text(String::from_utf8_lossy(raw).into_owned()))
        })
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        (self.encode)(value)
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Value> {
        (self.decode)(raw)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(default_encode, |raw| Ok(Value::Bytes(raw.to_vec())))
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Codec")
    }
}

fn default_encode(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::Text(s) => Ok(s.as_bytes().to_vec()),
        other => Err(Error::Serialize(format!(
            "unsupported payload type: {}",
            other.type_name()
        ))),
    }
}
