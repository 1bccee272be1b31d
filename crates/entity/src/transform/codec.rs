//! Secure id codecs.
//!
//! Primary keys declared `secure` leave the service encoded and come back
//! decoded, so callers never see raw backend ids.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::Value;

use crate::adapter::id_key;
use crate::error::{EntityResult, ResourceError};

/// Encodes ids on the way out and decodes them on the way in.
pub trait IdCodec: Send + Sync + fmt::Debug {
    /// Encodes a stored id for callers.
    fn encode(&self, id: &Value) -> EntityResult<Value>;

    /// Decodes a caller-supplied id.
    fn decode(&self, id: &Value) -> EntityResult<Value>;
}

/// Leaves ids untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl IdCodec for IdentityCodec {
    fn encode(&self, id: &Value) -> EntityResult<Value> {
        Ok(id.clone())
    }

    fn decode(&self, id: &Value) -> EntityResult<Value> {
        Ok(id.clone())
    }
}

/// URL-safe, unpadded base64 of the id's string form.
///
/// Decoded ids are always strings.
///
/// # Examples
///
/// ```
/// use helios_entity::transform::{Base64IdCodec, IdCodec};
/// use serde_json::json;
///
/// let codec = Base64IdCodec;
/// let encoded = codec.encode(&json!("abc-123")).unwrap();
/// assert_eq!(encoded, json!("YWJjLTEyMw"));
/// assert_eq!(codec.decode(&encoded).unwrap(), json!("abc-123"));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64IdCodec;

impl IdCodec for Base64IdCodec {
    fn encode(&self, id: &Value) -> EntityResult<Value> {
        Ok(Value::String(URL_SAFE_NO_PAD.encode(id_key(id))))
    }

    fn decode(&self, id: &Value) -> EntityResult<Value> {
        let encoded = id_key(id);
        let invalid = || ResourceError::InvalidId {
            id: encoded.clone(),
        };
        let bytes = URL_SAFE_NO_PAD.decode(&encoded).map_err(|_| invalid())?;
        let decoded = String::from_utf8(bytes).map_err(|_| invalid())?;
        Ok(Value::String(decoded))
    }
}
