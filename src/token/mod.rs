//! Hardware token access.
//!
//! Two backends implement [TokenBackend]:
//! - PKCS#11 middleware, feature `pkcs11`, see [pkcs11].
//! - Native card access over a [eid::CardChannel], with a PC/SC channel behind feature
//!   `pcsc`, see [eid] and [pcsc].
//!
//! Backends are only ever used through a [TokenSession], which closes the backend when
//! it goes out of scope. [Backends] holds whichever backends are configured and falls
//! back from PKCS#11 to the native backend when the middleware is unavailable.
use crate::definitions::{CertificateChain, DigestAlgorithm};
use std::ops::{Deref, DerefMut};
use std::sync::mpsc::Sender;

pub mod apdu;
pub mod eid;
#[cfg(feature = "pcsc")]
pub mod pcsc;
#[cfg(feature = "pkcs11")]
pub mod pkcs11;
pub mod runner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum BackendKind {
    #[strum(to_string = "PKCS#11")]
    Pkcs11,
    #[strum(to_string = "native")]
    Native,
}

/// Which of the two card keys to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum KeyPurpose {
    Authentication,
    NonRepudiation,
}

/// Files of the eID card filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum EidFile {
    Identity,
    IdentitySignature,
    Address,
    AddressSignature,
    Photo,
    RrnCertificate,
    AuthenticationCertificate,
    SigningCertificate,
    CaCertificate,
    RootCertificate,
}

impl EidFile {
    /// Path from the master file, as used by `SELECT` with P1 = 0x08.
    pub fn path(&self) -> &'static [u8] {
        match self {
            EidFile::Identity => &[0xDF, 0x01, 0x40, 0x31],
            EidFile::IdentitySignature => &[0xDF, 0x01, 0x40, 0x32],
            EidFile::Address => &[0xDF, 0x01, 0x40, 0x33],
            EidFile::AddressSignature => &[0xDF, 0x01, 0x40, 0x34],
            EidFile::Photo => &[0xDF, 0x01, 0x40, 0x35],
            EidFile::AuthenticationCertificate => &[0xDF, 0x00, 0x50, 0x38],
            EidFile::SigningCertificate => &[0xDF, 0x00, 0x50, 0x39],
            EidFile::CaCertificate => &[0xDF, 0x00, 0x50, 0x3A],
            EidFile::RootCertificate => &[0xDF, 0x00, 0x50, 0x3B],
            EidFile::RrnCertificate => &[0xDF, 0x00, 0x50, 0x3C],
        }
    }
}

/// Advisory notifications from a backend while it works.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    ReaderConnected { reader: String },
    BlockRead { file: EidFile, offset: usize },
    PinVerified,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("card reader unavailable: {0}")]
    ReaderUnavailable(String),
    #[error("token unavailable: {0}")]
    TokenUnavailable(String),
    #[error("cancelled by the user")]
    UserCancelled,
    #[error("incorrect PIN{}", match retries_left {
        Some(n) => format!(", {n} attempts left"),
        None => String::new(),
    })]
    PinIncorrect { retries_left: Option<u8> },
    #[error("PIN blocked")]
    PinBlocked,
    #[error("token in use by another application")]
    Contention,
    #[error("device error: {0}")]
    Device(String),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("invalid certificate on token: {0}")]
    Certificate(#[from] crate::definitions::x5chain::Error),
}

pub type Result<T, E = TokenError> = std::result::Result<T, E>;

/// Operations every token backend offers.
///
/// The optional operations default to [TokenError::Unsupported].
pub trait TokenBackend {
    fn kind(&self) -> BackendKind;

    fn reader_list(&mut self) -> Result<Vec<String>>;

    fn has_reader(&mut self) -> Result<bool> {
        Ok(!self.reader_list()?.is_empty())
    }

    fn wait_for_reader(&mut self) -> Result<()>;

    fn is_token_present(&mut self) -> Result<bool>;

    fn wait_for_token_present(&mut self) -> Result<()>;

    /// Sign an externally computed `digest` produced by `algorithm`.
    fn sign(
        &mut self,
        digest: &[u8],
        algorithm: DigestAlgorithm,
        purpose: KeyPurpose,
    ) -> Result<Vec<u8>>;

    /// Certificate chain of the key, leaf first.
    fn certificate_chain(&mut self, purpose: KeyPurpose) -> Result<CertificateChain>;

    fn read_file(&mut self, _file: EidFile) -> Result<Vec<u8>> {
        Err(TokenError::Unsupported("read_file"))
    }

    /// Block until the token has been taken out of the reader.
    fn remove_card(&mut self) -> Result<()>;

    /// Reset the PIN verification state of the card, optionally in a named reader.
    fn logoff(&mut self, reader: Option<&str>) -> Result<()>;

    /// Human readable description of where the token sits, typically the reader name.
    fn slot_description(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    fn change_pin(&mut self) -> Result<()> {
        Err(TokenError::Unsupported("change_pin"))
    }

    fn unblock_pin(&mut self) -> Result<()> {
        Err(TokenError::Unsupported("unblock_pin"))
    }

    fn set_observer(&mut self, observer: Option<Sender<TokenEvent>>);

    /// Release the card or module. Called exactly once per [TokenSession].
    fn close(&mut self);

    fn supports_identity_read(&self) -> bool {
        false
    }

    fn supports_administration(&self) -> bool {
        false
    }
}

/// Exclusive use of a backend for the duration of one logical operation.
pub struct TokenSession<'a> {
    backend: &'a mut dyn TokenBackend,
}

impl<'a> TokenSession<'a> {
    pub fn open(
        backend: &'a mut dyn TokenBackend,
        observer: Option<Sender<TokenEvent>>,
    ) -> TokenSession<'a> {
        tracing::debug!("opening {} token session", backend.kind());
        backend.set_observer(observer);
        TokenSession { backend }
    }
}

impl<'a> Deref for TokenSession<'a> {
    type Target = dyn TokenBackend + 'a;

    fn deref(&self) -> &Self::Target {
        self.backend
    }
}

impl<'a> DerefMut for TokenSession<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend
    }
}

impl Drop for TokenSession<'_> {
    fn drop(&mut self) {
        self.backend.set_observer(None);
        self.backend.close();
        tracing::debug!("closed {} token session", self.backend.kind());
    }
}

/// The backends configured for this process.
#[derive(Default)]
pub struct Backends {
    pkcs11: Option<Box<dyn TokenBackend>>,
    native: Option<Box<dyn TokenBackend>>,
    active: Option<BackendKind>,
}

impl Backends {
    pub fn new(
        pkcs11: Option<Box<dyn TokenBackend>>,
        native: Option<Box<dyn TokenBackend>>,
    ) -> Backends {
        Backends {
            pkcs11,
            native,
            active: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pkcs11.is_none() && self.native.is_none()
    }

    pub fn has_native(&self) -> bool {
        self.native.is_some()
    }

    /// The first backend that served a request in this run.
    pub fn active(&self) -> Option<BackendKind> {
        self.active
    }

    pub fn native(&mut self) -> Option<&mut (dyn TokenBackend + 'static)> {
        self.native.as_deref_mut()
    }

    /// The backend to enumerate readers with: native when configured, PKCS#11 otherwise.
    pub fn preferred(&mut self) -> Option<&mut (dyn TokenBackend + 'static)> {
        match self.native {
            Some(ref mut native) => Some(native.as_mut()),
            None => self.pkcs11.as_deref_mut(),
        }
    }

    fn record(&mut self, kind: BackendKind) {
        if self.active.is_none() {
            tracing::info!("using {kind} token backend");
            self.active = Some(kind);
        }
    }

    /// Run `op` in a session on the native backend only.
    pub fn with_native<T>(
        &mut self,
        observer: Option<Sender<TokenEvent>>,
        op: impl FnOnce(&mut TokenSession) -> Result<T>,
    ) -> Result<T> {
        let native = self.native.as_deref_mut().ok_or_else(|| {
            TokenError::BackendUnavailable("no native card backend configured".into())
        })?;
        let value = {
            let mut session = TokenSession::open(native, observer);
            let result = op(&mut session);
            result?
        };
        self.record(BackendKind::Native);
        Ok(value)
    }

    /// Run `op` in a session on the PKCS#11 backend, retrying the same operation on
    /// the native backend if the middleware turns out to be unavailable.
    ///
    /// Returns the value together with the kind of backend that produced it.
    pub fn with_fallback<T>(
        &mut self,
        observer: Option<Sender<TokenEvent>>,
        mut op: impl FnMut(&mut TokenSession) -> Result<T>,
    ) -> Result<(T, BackendKind)> {
        let first = match self.pkcs11.as_deref_mut() {
            Some(pkcs11) => {
                let mut session = TokenSession::open(pkcs11, observer.clone());
                let result = op(&mut session);
                result
            }
            None => Err(TokenError::BackendUnavailable(
                "no PKCS#11 module configured".into(),
            )),
        };
        let (value, kind) = match first {
            Ok(value) => (value, BackendKind::Pkcs11),
            Err(TokenError::BackendUnavailable(reason)) => {
                let Some(native) = self.native.as_deref_mut() else {
                    return Err(TokenError::BackendUnavailable(reason));
                };
                tracing::warn!("PKCS#11 backend unavailable ({reason}), falling back to native");
                let mut session = TokenSession::open(native, observer);
                let result = op(&mut session);
                (result?, BackendKind::Native)
            }
            Err(e) => return Err(e),
        };
        self.record(kind);
        Ok((value, kind))
    }
}
