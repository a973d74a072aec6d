//! Leaf-first chains of `X.509` certificates as read from a token.
//!
//! The [CertificateChain] is built with a [Builder], which parses every certificate
//! with [x509_cert] before accepting it, so a chain never carries bytes that are not a
//! DER certificate.
//!
//! ```ignore
//! let chain = CertificateChain::builder()
//!     .with_der(signing_cert)?
//!     .with_der(citizen_ca)?
//!     .with_der(root_ca)?
//!     .build()?;
//! assert_eq!(chain.leaf().der(), signing_cert);
//! ```
use crate::definitions::helpers::ByteStr;
use serde::{Deserialize, Serialize};
use std::{fs::File, io::Read};
use x509_cert::{
    certificate::Certificate,
    der::{Decode, Encode},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to parse certificate from der encoding: {0}")]
    Parse(x509_cert::der::Error),
    #[error("unable to convert certificate to bytes: {0}")]
    Encode(x509_cert::der::Error),
    #[error("unable to read certificate file: {0}")]
    Io(#[from] std::io::Error),
    #[error("at least one certificate must be given to the builder")]
    Empty,
}

/// A single DER encoded certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X509 {
    bytes: Vec<u8>,
    subject: String,
}

impl X509 {
    pub fn from_der(data: &[u8]) -> Result<X509, Error> {
        let cert = Certificate::from_der(data).map_err(Error::Parse)?;
        Ok(X509 {
            bytes: cert.to_der().map_err(Error::Encode)?,
            subject: cert.tbs_certificate.subject.to_string(),
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.bytes
    }

    /// RFC 4514 rendering of the subject name.
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Certificates ordered leaf first, each issued by the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ByteStr>", into = "Vec<ByteStr>")]
pub struct CertificateChain(Vec<X509>);

impl CertificateChain {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn leaf(&self) -> &X509 {
        // non-empty by construction
        &self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &X509> {
        self.0.iter()
    }
}

impl TryFrom<Vec<ByteStr>> for CertificateChain {
    type Error = Error;

    fn try_from(certs: Vec<ByteStr>) -> Result<Self, Self::Error> {
        certs
            .iter()
            .try_fold(Builder::default(), |builder, der| builder.with_der(der.as_ref()))?
            .build()
    }
}

impl From<CertificateChain> for Vec<ByteStr> {
    fn from(chain: CertificateChain) -> Vec<ByteStr> {
        chain.0.into_iter().map(|x509| x509.bytes.into()).collect()
    }
}

#[derive(Default, Debug, Clone)]
pub struct Builder {
    certs: Vec<X509>,
}

impl Builder {
    /// Appends a `DER` encoded certificate. Certificates are added leaf first.
    pub fn with_der(mut self, data: &[u8]) -> Result<Builder, Error> {
        self.certs.push(X509::from_der(data)?);
        Ok(self)
    }

    pub fn with_der_from_file(self, mut f: File) -> Result<Builder, Error> {
        let mut data: Vec<u8> = vec![];
        f.read_to_end(&mut data)?;
        self.with_der(&data)
    }

    pub fn build(self) -> Result<CertificateChain, Error> {
        if self.certs.is_empty() {
            return Err(Error::Empty);
        }
        Ok(CertificateChain(self.certs))
    }
}
