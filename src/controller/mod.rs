//! The ceremony driver.
//!
//! A [Controller] says hello to the service, answers the client check if one is asked
//! for, and then performs whichever operation the service selects:
//!
//! | service response | branch | outcome |
//! |---|---|---|
//! | `Kiosk` | wait for cards to come and go, forever | only ends on error |
//! | `Administration` | PIN change/unblock on the native backend | [OperationResult::AdministrationCompleted] |
//! | `FilesDigestRequest` | hash local files, then continue with signing | [OperationResult::FileDigestBundleProduced] or the signing outcome |
//! | `SignCertificatesRequest` | send the signing chain | [OperationResult::CertificatesOnly] unless a sign request follows |
//! | `SignRequest` | sign a digest with the non-repudiation key | [OperationResult::SignatureProduced] |
//! | `AuthenticationRequest` | sign the authentication contract | [OperationResult::SignatureProduced] |
//! | `IdentificationRequest` | read the identity files | [OperationResult::IdentityBundleProduced] |
//!
//! Every exchange passes through the [ProtocolStateMachine] and every token access
//! through a [crate::token::TokenSession]. [Controller::run] never fails: errors are
//! classified into a [FailureKind] and reported through the [StatusSink].
use crate::definitions::messages::{RequestMessage, ResponseMessage};
use crate::ports::{parameter, HostContext, MessageId, Status, StatusSink, UserPrompt};
use crate::protocol::ProtocolStateMachine;
use crate::token::runner::{self, retry_on_contention};
use crate::token::{self, Backends, TokenEvent, TokenSession};
use crate::transport::Transport;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use uuid::Uuid;

mod administration;
mod authentication;
pub mod environment;
mod error;
mod identification;
mod signing;

pub use environment::Environment;
pub use error::{Error, FailureKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Preferred language sent in the hello message. Falls back to the host parameter.
    pub language: Option<String>,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            language: None,
            retry_attempts: runner::DEFAULT_ATTEMPTS,
            retry_delay: runner::DEFAULT_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    CertificatesOnly,
    SignatureProduced,
    IdentityBundleProduced,
    FileDigestBundleProduced,
    AdministrationCompleted,
    Aborted,
    Failed(FailureKind),
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, OperationResult::Aborted | OperationResult::Failed(_))
    }
}

pub struct Controller<T, S, H, P> {
    transport: T,
    backends: Backends,
    status: S,
    host: H,
    prompt: P,
    config: ControllerConfig,
    protocol: ProtocolStateMachine,
    observer: Sender<TokenEvent>,
    events: Receiver<TokenEvent>,
}

impl<T, S, H, P> Controller<T, S, H, P>
where
    T: Transport,
    S: StatusSink,
    H: HostContext,
    P: UserPrompt,
{
    pub fn new(
        transport: T,
        backends: Backends,
        status: S,
        host: H,
        prompt: P,
        config: ControllerConfig,
    ) -> Self {
        let (observer, events) = mpsc::channel();
        Controller {
            transport,
            backends,
            status,
            host,
            prompt,
            config,
            protocol: ProtocolStateMachine::new(),
            observer,
            events,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn status(&self) -> &S {
        &self.status
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn prompt(&self) -> &P {
        &self.prompt
    }

    pub fn protocol(&self) -> &ProtocolStateMachine {
        &self.protocol
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Perform one ceremony from hello to the final status.
    pub fn run(&mut self) -> OperationResult {
        let span = tracing::info_span!("ceremony", id = %Uuid::new_v4());
        let _entered = span.enter();

        let environment = Environment::detect();
        for line in environment.details(&self.host) {
            self.status.add_detail(&line);
        }

        let result = self.ceremony(environment);
        self.drain_events();
        match result {
            Ok(outcome) => {
                tracing::info!(?outcome, "ceremony completed");
                self.status.set_status(Status::Normal, MessageId::Done);
                self.host.on_completed();
                outcome
            }
            Err(e) if e.is_cancellation() => {
                self.protocol.abort();
                tracing::info!("ceremony aborted: {e}");
                self.status.add_detail(&e.to_string());
                self.status.set_status(Status::Error, MessageId::Aborted);
                OperationResult::Aborted
            }
            Err(e) => {
                self.protocol.abort();
                let kind = e.failure_kind();
                let chain = e.chain();
                tracing::error!(failure = %kind, "{}", chain.join(": "));
                for line in &chain {
                    self.status.add_detail(line);
                }
                self.status.set_status(Status::Error, kind.message());
                OperationResult::Failed(kind)
            }
        }
    }

    fn ceremony(&mut self, environment: Environment) -> Result<OperationResult, Error> {
        self.status.set_status(Status::Normal, MessageId::Connecting);
        let language = self
            .config
            .language
            .clone()
            .or_else(|| self.host.parameter(parameter::LANGUAGE));
        let mut response = self.send(RequestMessage::Hello { language })?;

        if let ResponseMessage::CheckClient = response {
            let readers = self.reader_list();
            let request = environment.into_request(&self.host, readers);
            response = self.send(request)?;
        }

        if let ResponseMessage::InsecureClient { warn_only } = response {
            response = self.insecure_client(warn_only)?;
        }

        self.dispatch(response)
    }

    fn insecure_client(&mut self, warn_only: bool) -> Result<ResponseMessage, Error> {
        const WARNING: &str = "Your system has been marked as insecure client environment.";
        if !warn_only {
            self.prompt.warn(WARNING);
            return Err(Error::InsecureClient);
        }
        if !self.prompt.confirm(&format!("{WARNING}\nDo you want to continue?")) {
            return Err(Error::Declined("insecure client environment"));
        }
        self.status.add_detail("continuing in an insecure client environment");
        self.send(RequestMessage::ContinueInsecure)
    }

    fn dispatch(&mut self, response: ResponseMessage) -> Result<OperationResult, Error> {
        tracing::info!(operation = %response.kind(), "service selected operation");
        match response {
            ResponseMessage::Kiosk => self.kiosk(),
            ResponseMessage::Administration {
                change_pin,
                unblock_pin,
                logoff,
                remove_card,
            } => self.administration(change_pin, unblock_pin, logoff, remove_card),
            ResponseMessage::FilesDigestRequest { digest_algorithm } => {
                self.files_digest(&digest_algorithm)
            }
            ResponseMessage::SignCertificatesRequest => self.sign_certificates(),
            ResponseMessage::SignRequest {
                digest_value,
                digest_algorithm,
                description,
                logoff,
                remove_card,
            } => self.sign(signing::SignRequest {
                digest_value: digest_value.into(),
                digest_algorithm,
                description,
                logoff,
                remove_card,
            }),
            ResponseMessage::AuthenticationRequest(request) => self.authenticate(request),
            ResponseMessage::IdentificationRequest(request) => self.identify(request),
            other @ (ResponseMessage::CheckClient
            | ResponseMessage::InsecureClient { .. }
            | ResponseMessage::Finished) => Err(Error::UnexpectedResponse(other.kind())),
        }
    }

    /// Exchange one message with the service, enforcing the message ordering rules.
    fn send(&mut self, request: RequestMessage) -> Result<ResponseMessage, Error> {
        self.protocol.check_request(&request)?;
        tracing::debug!(request = %request.kind(), "sending");
        let response = self.transport.send(&request)?;
        self.protocol.check_response(&response)?;
        tracing::debug!(response = %response.kind(), "received");
        Ok(response)
    }

    fn expect_finished(&mut self, request: RequestMessage) -> Result<(), Error> {
        match self.send(request)? {
            ResponseMessage::Finished => Ok(()),
            other => Err(Error::UnexpectedResponse(other.kind())),
        }
    }

    fn reader_list(&mut self) -> Vec<String> {
        let Some(backend) = self.backends.preferred() else {
            return vec![];
        };
        let mut session = TokenSession::open(backend, None);
        match session.reader_list() {
            Ok(readers) => readers,
            Err(e) => {
                tracing::warn!("unable to list card readers: {e}");
                vec![]
            }
        }
    }

    fn require_backend(&self) -> Result<(), Error> {
        if self.backends.is_empty() {
            return Err(Error::MiddlewareNotFound);
        }
        Ok(())
    }

    fn observer(&self) -> Option<Sender<TokenEvent>> {
        Some(self.observer.clone())
    }

    /// Move backend notifications into the detail log.
    fn drain_events(&mut self) {
        for event in self.events.try_iter() {
            match event {
                TokenEvent::ReaderConnected { reader } => {
                    self.status.add_detail(&format!("card reader: {reader}"))
                }
                TokenEvent::PinVerified => self.status.add_detail("PIN verified"),
                TokenEvent::BlockRead { file, offset } => {
                    tracing::trace!("read {file} block at offset {offset}")
                }
            }
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.retry_attempts,
            delay: self.config.retry_delay,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    fn run<V>(&self, op: impl FnMut() -> token::Result<V>) -> token::Result<V> {
        retry_on_contention(self.attempts, self.delay, op)
    }

    fn runner(&self, steps: i32) -> runner::TaskRunner {
        runner::TaskRunner::new(self.attempts, self.delay, steps)
    }
}

/// Block until a reader is connected and a card sits in it, telling the user what to do.
fn wait_for_card(session: &mut TokenSession, status: &mut dyn StatusSink) -> token::Result<()> {
    status.set_status(Status::Normal, MessageId::DetectingCard);
    if !session.has_reader()? {
        status.set_status(Status::Normal, MessageId::ConnectReader);
        session.wait_for_reader()?;
    }
    if !session.is_token_present()? {
        status.set_status(Status::Normal, MessageId::InsertCard);
        session.wait_for_token_present()?;
    }
    Ok(())
}

/// Detail lines echoing the flags of a request.
fn flag_details(status: &mut dyn StatusSink, flags: &[(&str, bool)]) {
    for (name, value) in flags {
        status.add_detail(&format!("{name}: {value}"));
    }
}
