//! Digest algorithms named by the relying party.
//!
//! Sign requests carry an externally computed digest together with the name of the
//! algorithm that produced it. Before such a digest reaches an RSA PKCS#1 v1.5 key it
//! is wrapped in a DER `DigestInfo` structure, which is what the prefixes below encode.
use digest::DynDigest;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Algorithms the files-digest operation accepts. MD5 is deliberately absent.
const FILES_DIGEST_ALGORITHMS: [DigestAlgorithm; 4] = [
    DigestAlgorithm::Sha1,
    DigestAlgorithm::Sha256,
    DigestAlgorithm::Sha384,
    DigestAlgorithm::Sha512,
];

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum DigestAlgorithm {
    #[strum(to_string = "SHA-1", serialize = "SHA1")]
    #[serde(rename = "SHA-1", alias = "SHA1")]
    Sha1,
    #[strum(to_string = "SHA-224", serialize = "SHA224")]
    #[serde(rename = "SHA-224", alias = "SHA224")]
    Sha224,
    #[strum(to_string = "SHA-256", serialize = "SHA256")]
    #[serde(rename = "SHA-256", alias = "SHA256")]
    Sha256,
    #[strum(to_string = "SHA-384", serialize = "SHA384")]
    #[serde(rename = "SHA-384", alias = "SHA384")]
    Sha384,
    #[strum(to_string = "SHA-512", serialize = "SHA512")]
    #[serde(rename = "SHA-512", alias = "SHA512")]
    Sha512,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigest(String),
    #[error("{algorithm} digest must be {expected} bytes, got {actual}")]
    DigestLength {
        algorithm: DigestAlgorithm,
        expected: usize,
        actual: usize,
    },
}

impl DigestAlgorithm {
    /// Parse an algorithm name as used in sign requests.
    pub fn parse(name: &str) -> Result<Self, Error> {
        DigestAlgorithm::from_str(name).map_err(|_| Error::UnsupportedDigest(name.to_string()))
    }

    /// Parse an algorithm name for the files-digest operation.
    ///
    /// Only SHA-1 and the SHA-2 family members with at least 256 bits are allowed.
    pub fn parse_files_digest(name: &str) -> Result<Self, Error> {
        match DigestAlgorithm::from_str(name) {
            Ok(algorithm) if FILES_DIGEST_ALGORITHMS.contains(&algorithm) => Ok(algorithm),
            _ => Err(Error::UnsupportedDigest(name.to_string())),
        }
    }

    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// DER prefix of `DigestInfo ::= SEQUENCE { AlgorithmIdentifier, OCTET STRING }`
    /// up to and including the octet string header.
    pub fn digest_info_prefix(&self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Sha1 => &[
                0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00,
                0x04, 0x14,
            ],
            DigestAlgorithm::Sha224 => &[
                0x30, 0x2d, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x04, 0x05, 0x00, 0x04, 0x1c,
            ],
            DigestAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            DigestAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            DigestAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04,
                0x02, 0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }

    /// Wrap `digest` in a `DigestInfo` structure ready for PKCS#1 v1.5 padding.
    pub fn digest_info(&self, digest: &[u8]) -> Result<Vec<u8>, Error> {
        if digest.len() != self.output_len() {
            return Err(Error::DigestLength {
                algorithm: *self,
                expected: self.output_len(),
                actual: digest.len(),
            });
        }
        let prefix = self.digest_info_prefix();
        let mut info = Vec::with_capacity(prefix.len() + digest.len());
        info.extend_from_slice(prefix);
        info.extend_from_slice(digest);
        Ok(info)
    }

    /// A fresh streaming hasher for this algorithm.
    pub fn hasher(&self) -> Box<dyn DynDigest> {
        match self {
            DigestAlgorithm::Sha1 => Box::new(sha1::Sha1::default()),
            DigestAlgorithm::Sha224 => Box::new(sha2::Sha224::default()),
            DigestAlgorithm::Sha256 => Box::new(sha2::Sha256::default()),
            DigestAlgorithm::Sha384 => Box::new(sha2::Sha384::default()),
            DigestAlgorithm::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize().into_vec()
    }
}
