//! The to-be-signed authentication contract.
//!
//! The token never signs the server challenge directly. It signs the SHA-256 digest of
//! a CBOR map binding a fresh client salt, the challenge and whatever context the
//! service asked to be included (host name, client address and TLS channel bindings).
//! Keys are emitted in a fixed order and absent fields are left out entirely, so two
//! contracts encode to the same bytes only if they carry the same fields with the same
//! values.
use crate::cbor::{self, CborError};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use serde_bytes::Bytes;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("challenge must be at least {} bytes, got {0}", Challenge::MIN_LEN)]
    ChallengeTooShort(usize),
    #[error("unable to encode authentication contract: {0}")]
    Encoding(#[from] CborError),
}

/// Server issued nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge(Vec<u8>);

impl Challenge {
    pub const MIN_LEN: usize = 20;

    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Challenge, Error> {
        let bytes = bytes.into();
        if bytes.len() < Self::MIN_LEN {
            return Err(Error::ChallengeTooShort(bytes.len()));
        }
        Ok(Challenge(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; Salt::LEN]);

impl Salt {
    pub const LEN: usize = 20;

    /// Draw a salt from the operating system RNG.
    pub fn random() -> Salt {
        let mut bytes = [0u8; Self::LEN];
        OsRng.fill_bytes(&mut bytes);
        Salt(bytes)
    }

    pub fn from_bytes(bytes: [u8; Salt::LEN]) -> Salt {
        Salt(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationContract {
    salt: Salt,
    hostname: Option<String>,
    client_address: Option<IpAddr>,
    session_binding: Option<Vec<u8>>,
    server_cert_binding: Option<Vec<u8>>,
    challenge: Challenge,
}

#[derive(Serialize)]
struct ToBeSigned<'a> {
    salt: &'a Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<&'a Bytes>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a Bytes>,
    #[serde(rename = "serverCertificate", skip_serializing_if = "Option::is_none")]
    server_certificate: Option<&'a Bytes>,
    challenge: &'a Bytes,
}

impl AuthenticationContract {
    pub fn builder(salt: Salt, challenge: Challenge) -> Builder {
        Builder {
            contract: AuthenticationContract {
                salt,
                hostname: None,
                client_address: None,
                session_binding: None,
                server_cert_binding: None,
                challenge,
            },
        }
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    /// Deterministic CBOR encoding of the contract.
    pub fn to_be_signed(&self) -> Result<Vec<u8>, Error> {
        let address = self.client_address.map(|address| match address {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        });
        let tbs = ToBeSigned {
            salt: Bytes::new(self.salt.as_bytes()),
            hostname: self.hostname.as_deref(),
            address: address.as_deref().map(Bytes::new),
            session_id: self.session_binding.as_deref().map(Bytes::new),
            server_certificate: self.server_cert_binding.as_deref().map(Bytes::new),
            challenge: Bytes::new(self.challenge.as_bytes()),
        };
        Ok(cbor::to_vec(&tbs)?)
    }

    /// SHA-256 over [AuthenticationContract::to_be_signed], the value handed to the token.
    pub fn digest(&self) -> Result<Vec<u8>, Error> {
        Ok(Sha256::digest(self.to_be_signed()?).to_vec())
    }
}

pub struct Builder {
    contract: AuthenticationContract,
}

impl Builder {
    pub fn hostname(mut self, hostname: impl Into<String>) -> Builder {
        self.contract.hostname = Some(hostname.into());
        self
    }

    pub fn client_address(mut self, address: IpAddr) -> Builder {
        self.contract.client_address = Some(address);
        self
    }

    pub fn session_binding(mut self, session_id: impl Into<Vec<u8>>) -> Builder {
        self.contract.session_binding = Some(session_id.into());
        self
    }

    pub fn server_cert_binding(mut self, certificate: impl Into<Vec<u8>>) -> Builder {
        self.contract.server_cert_binding = Some(certificate.into());
        self
    }

    pub fn build(self) -> AuthenticationContract {
        self.contract
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ciborium::Value;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn challenge() -> Challenge {
        Challenge::new(vec![0x5A; 32]).unwrap()
    }

    fn contract(mask: u8) -> AuthenticationContract {
        let mut builder = AuthenticationContract::builder(Salt::from_bytes([7; 20]), challenge());
        if mask & 1 != 0 {
            builder = builder.hostname("www.example.be");
        }
        if mask & 2 != 0 {
            builder = builder.client_address(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
        }
        if mask & 4 != 0 {
            builder = builder.session_binding(vec![1, 2, 3, 4]);
        }
        if mask & 8 != 0 {
            builder = builder.server_cert_binding(vec![0x30, 0x82, 0x01]);
        }
        builder.build()
    }

    #[test]
    fn short_challenge_is_rejected() {
        assert!(matches!(
            Challenge::new(vec![0; 19]),
            Err(Error::ChallengeTooShort(19))
        ));
        assert!(Challenge::new(vec![0; 20]).is_ok());
    }

    #[test]
    fn encoding_is_deterministic_and_injective() {
        let mut seen = HashSet::new();
        for mask in 0..16u8 {
            let first = contract(mask).to_be_signed().unwrap();
            let second = contract(mask).to_be_signed().unwrap();
            assert_eq!(first, second, "mask {mask:#06b}");
            assert!(seen.insert(first), "collision for mask {mask:#06b}");
        }
    }

    #[test]
    fn keys_are_ordered_and_absent_fields_omitted() {
        let decode = |mask| {
            let bytes = contract(mask).to_be_signed().unwrap();
            let value: Value = crate::cbor::from_slice(&bytes).unwrap();
            value
                .into_map()
                .unwrap()
                .into_iter()
                .map(|(k, _)| k.into_text().unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(decode(0), vec!["salt", "challenge"]);
        assert_eq!(
            decode(15),
            vec![
                "salt",
                "hostname",
                "address",
                "sessionId",
                "serverCertificate",
                "challenge"
            ]
        );
        assert_eq!(decode(4), vec!["salt", "sessionId", "challenge"]);
    }

    #[test]
    fn map_has_definite_length() {
        let bytes = contract(1).to_be_signed().unwrap();
        // major type 5 (map) with three entries
        assert_eq!(bytes[0], 0xA3);
    }

    #[test]
    fn address_is_network_order_octets() {
        let bytes = contract(2).to_be_signed().unwrap();
        let value: Value = crate::cbor::from_slice(&bytes).unwrap();
        let address = value
            .into_map()
            .unwrap()
            .into_iter()
            .find(|(k, _)| k.as_text() == Some("address"))
            .map(|(_, v)| v)
            .unwrap();
        assert_eq!(address, Value::Bytes(vec![192, 0, 2, 10]));
    }

    #[test]
    fn random_salts_differ() {
        assert_ne!(Salt::random(), Salt::random());
    }

    #[test]
    fn digest_is_sha256_of_contract() {
        let contract = contract(5);
        assert_eq!(
            contract.digest().unwrap(),
            Sha256::digest(contract.to_be_signed().unwrap()).to_vec()
        );
        assert_eq!(contract.digest().unwrap().len(), 32);
    }
}
