//! Thin wrappers around [ciborium] used for protocol messages and the
//! authentication contract.
//!
//! Keeping every encode/decode behind these two functions means the rest of the
//! crate never names the CBOR library directly.
use std::io::Cursor;

use serde::de;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CborError {
    /// CBOR decoding failure.
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(String),
    /// CBOR encoding failure.
    #[error("CBOR encoding failure: {0}")]
    EncodeFailed(String),
    /// CBOR input had extra data.
    #[error("extraneous data")]
    ExtraneousData,
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: serde::Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    let mut cursor = Cursor::new(slice);
    let value =
        ciborium::from_reader(&mut cursor).map_err(|e| CborError::DecodeFailed(e.to_string()))?;
    if cursor.position() as usize != slice.len() {
        return Err(CborError::ExtraneousData);
    }
    Ok(value)
}
