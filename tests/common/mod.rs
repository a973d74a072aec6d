//! Fakes for driving a [Controller] without a service or a card.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::Sender;
use std::time::Duration;

use eid_client::controller::{Controller, ControllerConfig};
use eid_client::definitions::messages::{RequestKind, RequestMessage, ResponseMessage};
use eid_client::definitions::{CertificateChain, DigestAlgorithm};
use eid_client::ports::{HostContext, MessageId, Status, StatusSink, UserPrompt};
use eid_client::token::{
    BackendKind, Backends, EidFile, KeyPurpose, Result, TokenBackend, TokenError, TokenEvent,
};
use eid_client::transport::{Transport, TransportError};
use url::Url;

pub const AUTHENTICATION_CERT: &[u8] = include_bytes!("../../test/certs/authentication.der");
pub const SIGNING_CERT: &[u8] = include_bytes!("../../test/certs/signing.der");
pub const CA_CERT: &[u8] = include_bytes!("../../test/certs/ca.der");
pub const ROOT_CERT: &[u8] = include_bytes!("../../test/certs/root.der");

pub const ORIGIN: &str = "https://relying.party/login";
pub const FAKE_READER: &str = "Fake Reader 0";

pub type TestController = Controller<ScriptedTransport, RecordingStatus, TestHost, ScriptedPrompt>;

/// Build a controller answering with `script`, one response per request.
pub fn controller(
    script: Vec<ResponseMessage>,
    backends: Backends,
    prompt: ScriptedPrompt,
    host: TestHost,
) -> TestController {
    let config = ControllerConfig {
        retry_delay: Duration::ZERO,
        ..Default::default()
    };
    Controller::new(
        ScriptedTransport::new(script),
        backends,
        RecordingStatus::default(),
        host,
        prompt,
        config,
    )
}

/// Replays canned responses and records every request it is given.
#[derive(Default)]
pub struct ScriptedTransport {
    pub responses: VecDeque<ResponseMessage>,
    pub requests: Vec<RequestMessage>,
    pub session_id: Option<Vec<u8>>,
    pub server_certificate: Option<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ResponseMessage>) -> Self {
        Self {
            responses: script.into(),
            ..Default::default()
        }
    }

    pub fn request_kinds(&self) -> Vec<RequestKind> {
        self.requests.iter().map(RequestMessage::kind).collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &mut self,
        request: &RequestMessage,
    ) -> std::result::Result<ResponseMessage, TransportError> {
        self.requests.push(request.clone());
        self.responses
            .pop_front()
            .ok_or(TransportError::ServiceUnreachable)
    }

    fn session_id(&self) -> Option<Vec<u8>> {
        self.session_id.clone()
    }

    fn server_certificate(&self) -> Option<Vec<u8>> {
        self.server_certificate.clone()
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    pub statuses: Vec<(Status, MessageId)>,
    pub details: Vec<String>,
    pub progress: Vec<(i32, i32)>,
}

impl RecordingStatus {
    pub fn last(&self) -> Option<(Status, MessageId)> {
        self.statuses.last().copied()
    }

    pub fn saw(&self, message: MessageId) -> bool {
        self.statuses.iter().any(|(_, m)| *m == message)
    }
}

impl StatusSink for RecordingStatus {
    fn set_status(&mut self, status: Status, message: MessageId) {
        self.statuses.push((status, message));
    }

    fn add_detail(&mut self, detail: &str) {
        self.details.push(detail.to_string());
    }

    fn report_progress(&mut self, max: i32, current: i32) {
        self.progress.push((max, current));
    }
}

/// Answers every question the same way and remembers what was asked.
pub struct ScriptedPrompt {
    pub confirm: bool,
    pub consent: bool,
    pub files: Option<Vec<PathBuf>>,
    pub questions: Vec<String>,
    pub warnings: Vec<String>,
    pub consents: Vec<(bool, bool, Option<String>)>,
    pub file_selections: u32,
}

impl ScriptedPrompt {
    pub fn agreeing() -> Self {
        Self {
            confirm: true,
            consent: true,
            files: None,
            questions: vec![],
            warnings: vec![],
            consents: vec![],
            file_selections: 0,
        }
    }

    pub fn refusing() -> Self {
        Self {
            confirm: false,
            consent: false,
            ..Self::agreeing()
        }
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = Some(files);
        self
    }
}

impl UserPrompt for ScriptedPrompt {
    fn confirm(&mut self, message: &str) -> bool {
        self.questions.push(message.to_string());
        self.confirm
    }

    fn warn(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    fn privacy_consent(
        &mut self,
        include_address: bool,
        include_photo: bool,
        usage: Option<&str>,
    ) -> bool {
        self.consents
            .push((include_address, include_photo, usage.map(str::to_string)));
        self.consent
    }

    fn select_files(&mut self) -> Option<Vec<PathBuf>> {
        self.file_selections += 1;
        self.files.clone()
    }
}

pub struct TestHost {
    pub origin: Url,
    pub params: HashMap<String, String>,
    pub address: Option<IpAddr>,
    pub completed: u32,
    pub callbacks: Vec<String>,
}

impl Default for TestHost {
    fn default() -> Self {
        Self {
            origin: Url::parse(ORIGIN).unwrap(),
            params: HashMap::new(),
            address: Some(IpAddr::from([192, 0, 2, 7])),
            completed: 0,
            callbacks: vec![],
        }
    }
}

impl TestHost {
    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }
}

impl HostContext for TestHost {
    fn document_origin(&self) -> &Url {
        &self.origin
    }

    fn parameter(&self, name: &str) -> Option<String> {
        self.params.get(name).cloned()
    }

    fn on_completed(&mut self) {
        self.completed += 1;
    }

    fn invoke_callback(&mut self, name: &str) {
        self.callbacks.push(name.to_string());
    }

    fn resolve_host(&self, _host: &str) -> Option<IpAddr> {
        self.address
    }
}

/// What happened to a [FakeToken], shared with the test after the backend is boxed.
#[derive(Debug, Default)]
pub struct TokenLog {
    pub closes: u32,
    pub signed: Vec<(Vec<u8>, DigestAlgorithm, KeyPurpose)>,
    pub chains: Vec<KeyPurpose>,
    pub files_read: Vec<EidFile>,
    pub logoffs: Vec<Option<String>>,
    pub removals: u32,
    pub pin_changes: u32,
    pub pin_unblocks: u32,
}

pub type SharedLog = Rc<RefCell<TokenLog>>;

pub struct FakeToken {
    kind: BackendKind,
    log: SharedLog,
    unavailable: bool,
    sign_error: Option<fn() -> TokenError>,
    read_error: Option<EidFile>,
    cards: Option<u32>,
    observer: Option<Sender<TokenEvent>>,
}

impl FakeToken {
    pub fn new(kind: BackendKind) -> (Self, SharedLog) {
        let log = SharedLog::default();
        let token = Self {
            kind,
            log: log.clone(),
            unavailable: false,
            sign_error: None,
            read_error: None,
            cards: None,
            observer: None,
        };
        (token, log)
    }

    /// Every operation fails as if the middleware were not installed.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn failing_sign(mut self, error: fn() -> TokenError) -> Self {
        self.sign_error = Some(error);
        self
    }

    /// Reading `file` fails with a device error.
    pub fn failing_read(mut self, file: EidFile) -> Self {
        self.read_error = Some(file);
        self
    }

    /// Only `n` cards are ever inserted; waiting for another one fails.
    pub fn cards(mut self, n: u32) -> Self {
        self.cards = Some(n);
        self
    }

    pub fn boxed(self) -> Option<Box<dyn TokenBackend>> {
        Some(Box::new(self))
    }

    fn check(&self) -> Result<()> {
        if self.unavailable {
            return Err(TokenError::BackendUnavailable(
                "fake middleware not installed".into(),
            ));
        }
        Ok(())
    }
}

pub fn file_content(file: EidFile) -> Vec<u8> {
    match file {
        EidFile::AuthenticationCertificate => AUTHENTICATION_CERT.to_vec(),
        EidFile::SigningCertificate => SIGNING_CERT.to_vec(),
        EidFile::CaCertificate => CA_CERT.to_vec(),
        EidFile::RootCertificate => ROOT_CERT.to_vec(),
        other => format!("{other} file").into_bytes(),
    }
}

pub const FAKE_SIGNATURE: [u8; 4] = [0x5A, 0x5A, 0x5A, 0x5A];

impl TokenBackend for FakeToken {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn reader_list(&mut self) -> Result<Vec<String>> {
        self.check()?;
        Ok(vec![FAKE_READER.to_string()])
    }

    fn wait_for_reader(&mut self) -> Result<()> {
        self.check()
    }

    fn is_token_present(&mut self) -> Result<bool> {
        self.check()?;
        match self.cards {
            Some(0) => Err(TokenError::TokenUnavailable("no more cards".into())),
            _ => Ok(true),
        }
    }

    fn wait_for_token_present(&mut self) -> Result<()> {
        self.is_token_present().map(|_| ())
    }

    fn sign(
        &mut self,
        digest: &[u8],
        algorithm: DigestAlgorithm,
        purpose: KeyPurpose,
    ) -> Result<Vec<u8>> {
        self.check()?;
        if let Some(error) = self.sign_error {
            return Err(error());
        }
        self.log
            .borrow_mut()
            .signed
            .push((digest.to_vec(), algorithm, purpose));
        if let Some(observer) = &self.observer {
            let _ = observer.send(TokenEvent::PinVerified);
        }
        Ok(FAKE_SIGNATURE.to_vec())
    }

    fn certificate_chain(&mut self, purpose: KeyPurpose) -> Result<CertificateChain> {
        self.check()?;
        self.log.borrow_mut().chains.push(purpose);
        let leaf = match purpose {
            KeyPurpose::Authentication => AUTHENTICATION_CERT,
            KeyPurpose::NonRepudiation => SIGNING_CERT,
        };
        Ok(CertificateChain::builder()
            .with_der(leaf)?
            .with_der(CA_CERT)?
            .with_der(ROOT_CERT)?
            .build()?)
    }

    fn read_file(&mut self, file: EidFile) -> Result<Vec<u8>> {
        self.check()?;
        if self.kind != BackendKind::Native {
            return Err(TokenError::Unsupported("read_file"));
        }
        if self.read_error == Some(file) {
            return Err(TokenError::Device(format!("reading {file} returned 6B00")));
        }
        self.log.borrow_mut().files_read.push(file);
        Ok(file_content(file))
    }

    fn remove_card(&mut self) -> Result<()> {
        self.check()?;
        self.log.borrow_mut().removals += 1;
        if let Some(cards) = self.cards.as_mut() {
            *cards = cards.saturating_sub(1);
        }
        Ok(())
    }

    fn logoff(&mut self, reader: Option<&str>) -> Result<()> {
        self.check()?;
        self.log.borrow_mut().logoffs.push(reader.map(str::to_string));
        Ok(())
    }

    fn slot_description(&mut self) -> Result<Option<String>> {
        self.check()?;
        Ok(Some(FAKE_READER.to_string()))
    }

    fn change_pin(&mut self) -> Result<()> {
        self.log.borrow_mut().pin_changes += 1;
        Ok(())
    }

    fn unblock_pin(&mut self) -> Result<()> {
        self.log.borrow_mut().pin_unblocks += 1;
        Ok(())
    }

    fn set_observer(&mut self, observer: Option<Sender<TokenEvent>>) {
        self.observer = observer;
    }

    fn close(&mut self) {
        self.log.borrow_mut().closes += 1;
    }

    fn supports_identity_read(&self) -> bool {
        self.kind == BackendKind::Native
    }

    fn supports_administration(&self) -> bool {
        self.kind == BackendKind::Native
    }
}
