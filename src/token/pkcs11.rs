//! Token access through the eID PKCS#11 middleware.
//!
//! The module is loaded on first use so that a missing middleware only surfaces when a
//! token operation is attempted, as [TokenError::BackendUnavailable], which lets the
//! caller fall back to the native backend. Login uses the protected authentication path
//! of the reader or middleware, so no PIN passes through this process.
use super::{BackendKind, KeyPurpose, Result, TokenBackend, TokenError, TokenEvent};
use crate::definitions::{CertificateChain, DigestAlgorithm};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

const AUTHENTICATION_LABEL: &str = "Authentication";
const SIGNATURE_LABEL: &str = "Signature";
const CA_LABEL: &str = "CA";
const ROOT_LABEL: &str = "Root";

fn map_err(e: Error) -> TokenError {
    match e {
        Error::LibraryLoading(_) => TokenError::BackendUnavailable(e.to_string()),
        Error::Pkcs11(RvError::PinIncorrect, _) => TokenError::PinIncorrect { retries_left: None },
        Error::Pkcs11(RvError::PinLocked, _) => TokenError::PinBlocked,
        Error::Pkcs11(RvError::FunctionCanceled, _) => TokenError::UserCancelled,
        Error::Pkcs11(RvError::TokenNotPresent | RvError::DeviceRemoved, _) => {
            TokenError::TokenUnavailable(e.to_string())
        }
        Error::Pkcs11(RvError::SlotIdInvalid, _) => TokenError::ReaderUnavailable(e.to_string()),
        _ => TokenError::Device(e.to_string()),
    }
}

pub struct Pkcs11Backend {
    module: PathBuf,
    context: Option<Pkcs11>,
    slot: Option<Slot>,
}

impl Pkcs11Backend {
    pub fn new(module: impl Into<PathBuf>) -> Pkcs11Backend {
        Pkcs11Backend {
            module: module.into(),
            context: None,
            slot: None,
        }
    }

    fn context(&mut self) -> Result<&Pkcs11> {
        if self.context.is_none() {
            tracing::debug!("loading PKCS#11 module {}", self.module.display());
            let context = Pkcs11::new(&self.module)
                .map_err(|e| TokenError::BackendUnavailable(e.to_string()))?;
            context
                .initialize(CInitializeArgs::OsThreads)
                .map_err(|e| TokenError::BackendUnavailable(e.to_string()))?;
            self.context = Some(context);
        }
        self.context
            .as_ref()
            .ok_or_else(|| TokenError::BackendUnavailable("module not loaded".to_string()))
    }

    fn token_slot(&mut self) -> Result<Slot> {
        let slots = self.context()?.get_slots_with_token().map_err(map_err)?;
        let slot = slots
            .first()
            .copied()
            .ok_or_else(|| TokenError::TokenUnavailable("no token in any slot".to_string()))?;
        self.slot = Some(slot);
        Ok(slot)
    }

    fn session(&mut self) -> Result<Session> {
        let slot = self.token_slot()?;
        self.context()?.open_ro_session(slot).map_err(map_err)
    }

    fn find(session: &Session, class: ObjectClass, label: &str) -> Result<ObjectHandle> {
        session
            .find_objects(&[
                Attribute::Class(class),
                Attribute::Label(label.as_bytes().to_vec()),
            ])
            .map_err(map_err)?
            .into_iter()
            .next()
            .ok_or_else(|| TokenError::Device(format!("no object labelled {label} on token")))
    }

    fn certificate(session: &Session, label: &str) -> Result<Vec<u8>> {
        let handle = Self::find(session, ObjectClass::CERTIFICATE, label)?;
        session
            .get_attributes(handle, &[AttributeType::Value])
            .map_err(map_err)?
            .into_iter()
            .find_map(|attribute| match attribute {
                Attribute::Value(value) => Some(value),
                _ => None,
            })
            .ok_or_else(|| TokenError::Device(format!("certificate {label} has no value")))
    }
}

fn label(purpose: KeyPurpose) -> &'static str {
    match purpose {
        KeyPurpose::Authentication => AUTHENTICATION_LABEL,
        KeyPurpose::NonRepudiation => SIGNATURE_LABEL,
    }
}

impl TokenBackend for Pkcs11Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pkcs11
    }

    fn reader_list(&mut self) -> Result<Vec<String>> {
        let context = self.context()?;
        let slots = context.get_all_slots().map_err(map_err)?;
        slots
            .into_iter()
            .map(|slot| {
                context
                    .get_slot_info(slot)
                    .map(|info| info.slot_description().trim().to_string())
                    .map_err(map_err)
            })
            .collect()
    }

    fn wait_for_reader(&mut self) -> Result<()> {
        while self.context()?.get_all_slots().map_err(map_err)?.is_empty() {
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn is_token_present(&mut self) -> Result<bool> {
        Ok(!self
            .context()?
            .get_slots_with_token()
            .map_err(map_err)?
            .is_empty())
    }

    fn wait_for_token_present(&mut self) -> Result<()> {
        while !self.is_token_present()? {
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn sign(
        &mut self,
        digest: &[u8],
        algorithm: DigestAlgorithm,
        purpose: KeyPurpose,
    ) -> Result<Vec<u8>> {
        let digest_info = algorithm
            .digest_info(digest)
            .map_err(|e| TokenError::Device(e.to_string()))?;
        let session = self.session()?;
        match session.login(UserType::User, None) {
            Ok(()) | Err(Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
            Err(e) => return Err(map_err(e)),
        }
        let key = Self::find(&session, ObjectClass::PRIVATE_KEY, label(purpose))?;
        session
            .sign(&Mechanism::RsaPkcs, key, &digest_info)
            .map_err(map_err)
    }

    fn certificate_chain(&mut self, purpose: KeyPurpose) -> Result<CertificateChain> {
        let session = self.session()?;
        let mut builder = CertificateChain::builder();
        for label in [label(purpose), CA_LABEL, ROOT_LABEL] {
            builder = builder.with_der(&Self::certificate(&session, label)?)?;
        }
        Ok(builder.build()?)
    }

    fn remove_card(&mut self) -> Result<()> {
        while self.is_token_present()? {
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn logoff(&mut self, _reader: Option<&str>) -> Result<()> {
        // login state is shared by every session of this process on the token
        match self.session()?.logout() {
            Ok(()) | Err(Error::Pkcs11(RvError::UserNotLoggedIn, _)) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    fn slot_description(&mut self) -> Result<Option<String>> {
        let Some(slot) = self.slot else {
            return Ok(None);
        };
        let info = self.context()?.get_slot_info(slot).map_err(map_err)?;
        Ok(Some(info.slot_description().trim().to_string()))
    }

    fn set_observer(&mut self, _observer: Option<Sender<TokenEvent>>) {}

    fn close(&mut self) {
        // dropping the context finalizes the module
        if self.context.take().is_some() {
            tracing::debug!("finalized PKCS#11 module");
        }
    }
}
