//! Message ordering rules for a ceremony.
//!
//! The [ProtocolStateMachine] sits between the controller and the transport. Each
//! outgoing request is checked against the current phase, each incoming response
//! against the allow-list of the request in flight. A violation leaves the machine
//! untouched; the caller aborts the ceremony with [ProtocolStateMachine::abort].
use crate::definitions::messages::{RequestKind, RequestMessage, ResponseKind, ResponseMessage};

/// The operation the service selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum OperationKind {
    Kiosk,
    Administration,
    FilesDigest,
    SignCertificates,
    Sign,
    Authentication,
    Identification,
}

impl OperationKind {
    fn started_by(response: ResponseKind) -> Option<OperationKind> {
        match response {
            ResponseKind::Kiosk => Some(OperationKind::Kiosk),
            ResponseKind::Administration => Some(OperationKind::Administration),
            ResponseKind::FilesDigestRequest => Some(OperationKind::FilesDigest),
            ResponseKind::SignCertificatesRequest => Some(OperationKind::SignCertificates),
            ResponseKind::SignRequest => Some(OperationKind::Sign),
            ResponseKind::AuthenticationRequest => Some(OperationKind::Authentication),
            ResponseKind::IdentificationRequest => Some(OperationKind::Identification),
            ResponseKind::CheckClient | ResponseKind::InsecureClient | ResponseKind::Finished => {
                None
            }
        }
    }

    /// The request that completes this operation, if it sends one at all.
    fn result_request(&self) -> Option<RequestKind> {
        match self {
            OperationKind::Kiosk | OperationKind::Administration => None,
            OperationKind::FilesDigest => Some(RequestKind::FileDigestsData),
            OperationKind::SignCertificates => Some(RequestKind::SignCertificatesData),
            OperationKind::Sign => Some(RequestKind::SignatureData),
            OperationKind::Authentication => Some(RequestKind::AuthenticationData),
            OperationKind::Identification => Some(RequestKind::IdentityData),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    HelloSent,
    AwaitingClientCheck,
    AwaitingInsecureContinuation,
    OperationInProgress(OperationKind),
    Finished,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("{request} sent while {in_flight} is still awaiting a response")]
    RequestInFlight {
        request: RequestKind,
        in_flight: RequestKind,
    },
    #[error("{request} is not allowed in state {state:?}")]
    UnexpectedRequest {
        request: RequestKind,
        state: ProtocolState,
    },
    #[error("received {response} with no request in flight")]
    NothingInFlight { response: ResponseKind },
    #[error("{response} is not an allowed response to {request}")]
    UnexpectedResponse {
        request: RequestKind,
        response: ResponseKind,
    },
}

#[derive(Debug)]
pub struct ProtocolStateMachine {
    state: ProtocolState,
    in_flight: Option<RequestKind>,
}

impl Default for ProtocolStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolStateMachine {
    pub fn new() -> Self {
        Self {
            state: ProtocolState::Idle,
            in_flight: None,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn in_flight(&self) -> Option<RequestKind> {
        self.in_flight
    }

    fn request_allowed(&self, request: RequestKind) -> bool {
        match self.state {
            ProtocolState::Idle => request == RequestKind::Hello,
            ProtocolState::AwaitingClientCheck => request == RequestKind::ClientEnvironment,
            ProtocolState::AwaitingInsecureContinuation => {
                request == RequestKind::ContinueInsecure
            }
            ProtocolState::OperationInProgress(operation) => {
                operation.result_request() == Some(request)
            }
            ProtocolState::HelloSent | ProtocolState::Finished | ProtocolState::Error => false,
        }
    }

    /// Validate an outgoing request and mark it in flight.
    pub fn check_request(&mut self, request: &RequestMessage) -> Result<(), ProtocolViolation> {
        let kind = request.kind();
        if let Some(in_flight) = self.in_flight {
            return Err(ProtocolViolation::RequestInFlight {
                request: kind,
                in_flight,
            });
        }
        if !self.request_allowed(kind) {
            return Err(ProtocolViolation::UnexpectedRequest {
                request: kind,
                state: self.state,
            });
        }
        if kind == RequestKind::Hello {
            self.state = ProtocolState::HelloSent;
        }
        self.in_flight = Some(kind);
        Ok(())
    }

    /// Validate an incoming response against the request in flight and advance the phase.
    pub fn check_response(&mut self, response: &ResponseMessage) -> Result<(), ProtocolViolation> {
        let kind = response.kind();
        let request = self
            .in_flight
            .ok_or(ProtocolViolation::NothingInFlight { response: kind })?;
        if !request.responses_allowed().contains(&kind) {
            return Err(ProtocolViolation::UnexpectedResponse {
                request,
                response: kind,
            });
        }
        self.in_flight = None;
        self.state = match kind {
            ResponseKind::CheckClient => ProtocolState::AwaitingClientCheck,
            ResponseKind::InsecureClient => ProtocolState::AwaitingInsecureContinuation,
            ResponseKind::Finished => ProtocolState::Finished,
            other => match OperationKind::started_by(other) {
                Some(operation) => ProtocolState::OperationInProgress(operation),
                None => self.state,
            },
        };
        Ok(())
    }

    /// Enter the terminal error state. Every later request is rejected.
    pub fn abort(&mut self) {
        self.state = ProtocolState::Error;
        self.in_flight = None;
    }
}
