use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque binary payload carried in protocol messages.
///
/// Serialized as a CBOR byte string rather than an array of integers.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ByteStr(#[serde(with = "serde_bytes")] Vec<u8>);

impl ByteStr {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ByteStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 16;
        if self.0.len() <= SHOWN {
            write!(f, "ByteStr({})", hex::encode(&self.0))
        } else {
            write!(
                f,
                "ByteStr({}.. {} bytes)",
                hex::encode(&self.0[..SHOWN]),
                self.0.len()
            )
        }
    }
}

impl From<Vec<u8>> for ByteStr {
    fn from(bytes: Vec<u8>) -> ByteStr {
        ByteStr(bytes)
    }
}

impl From<&[u8]> for ByteStr {
    fn from(bytes: &[u8]) -> ByteStr {
        ByteStr(bytes.to_vec())
    }
}

impl From<ByteStr> for Vec<u8> {
    fn from(ByteStr(bytes): ByteStr) -> Vec<u8> {
        bytes
    }
}

impl AsRef<[u8]> for ByteStr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
