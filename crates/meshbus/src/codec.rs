//! # Payload Codec Selection
//!
//! The bus core does not define an encoding of its own; it only selects one.
//! `String` and `Vec<u8>` pass through as raw bytes, `()` means "no
//! payload", and every other type goes through its serde implementation as
//! self-describing JSON. The serde bounds are the codec capability: a type
//! without them cannot reach `emit` or a typed registration at all, and
//! runtime failures surface as [`CodecError`] rather than being silently
//! dropped.

use std::any::{Any, TypeId};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Move a value into `T` after a `TypeId` equality check.
fn cast<V: Any, T: Any>(value: V) -> T {
    let boxed: Box<dyn Any> = Box::new(value);
    match boxed.downcast::<T>() {
        Ok(v) => *v,
        // Callers compare TypeIds before casting.
        Err(_) => unreachable!("cast after TypeId equality check"),
    }
}

/// Encode a value into payload bytes.
///
/// Returns `None` for the payload-free `()` case.
pub fn encode<T>(value: &T) -> Result<Option<Vec<u8>>, CodecError>
where
    T: Serialize + Any,
{
    let any: &dyn Any = value;
    if any.is::<()>() {
        return Ok(None);
    }
    if let Some(s) = any.downcast_ref::<String>() {
        return Ok(Some(s.as_bytes().to_vec()));
    }
    if let Some(s) = any.downcast_ref::<&str>() {
        return Ok(Some(s.as_bytes().to_vec()));
    }
    if let Some(b) = any.downcast_ref::<Vec<u8>>() {
        return Ok(Some(b.clone()));
    }
    serde_json::to_vec(value).map(Some).map_err(CodecError::Encode)
}

/// Decode payload bytes as the declared type.
///
/// The inverse selection of [`encode`]: `()` tolerates a missing payload,
/// `String`/`Vec<u8>` read the bytes directly, everything else parses JSON.
pub fn decode<T>(payload: Option<&[u8]>) -> Result<T, CodecError>
where
    T: DeserializeOwned + Any,
{
    if TypeId::of::<T>() == TypeId::of::<()>() {
        return Ok(cast(()));
    }
    let bytes = payload.ok_or(CodecError::MissingPayload)?;
    if TypeId::of::<T>() == TypeId::of::<String>() {
        let s = String::from_utf8(bytes.to_vec())?;
        return Ok(cast(s));
    }
    if TypeId::of::<T>() == TypeId::of::<Vec<u8>>() {
        return Ok(cast::<Vec<u8>, T>(bytes.to_vec()));
    }
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
