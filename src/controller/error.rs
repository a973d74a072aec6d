use crate::contract;
use crate::definitions::digest;
use crate::definitions::messages::ResponseKind;
use crate::files_digest;
use crate::ports::MessageId;
use crate::protocol::ProtocolViolation;
use crate::token::TokenError;
use crate::transport::TransportError;

/// How a failed ceremony is reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum FailureKind {
    NoMiddleware,
    Security,
    PinIncorrect,
    PinBlocked,
    Card,
    Generic,
}

impl FailureKind {
    pub fn message(&self) -> MessageId {
        match self {
            FailureKind::NoMiddleware => MessageId::NoMiddlewareError,
            FailureKind::Security => MessageId::SecurityError,
            FailureKind::PinIncorrect => MessageId::PinIncorrect,
            FailureKind::PinBlocked => MessageId::PinBlocked,
            FailureKind::Card => MessageId::CardError,
            FailureKind::Generic => MessageId::GenericError,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither token backend can be reached.
    #[error("no eID middleware or card reader interface available")]
    MiddlewareNotFound,
    /// The service flagged this client environment as insecure.
    #[error("client environment rejected as insecure")]
    InsecureClient,
    /// The user said no to a confirmation or consent question.
    #[error("{0} declined by the user")]
    Declined(&'static str),
    /// A channel binding was requested that the transport cannot observe.
    #[error("{0} channel binding requested but not available")]
    ChannelBindingUnavailable(&'static str),
    /// The document origin has no host to bind the contract to.
    #[error("document origin {0} has no host")]
    MissingHost(String),
    #[error("unable to resolve host {0}")]
    HostResolution(String),
    #[error("invalid authentication contract")]
    Contract(#[from] contract::Error),
    #[error("unsupported digest")]
    Digest(#[source] digest::Error),
    /// Identity files were requested but only the PKCS#11 backend is configured.
    #[error("identity data requested but no card reader interface is available")]
    IdentityReadUnsupported,
    #[error("file selection cancelled")]
    SelectionCancelled,
    #[error("unable to digest files")]
    Files(#[source] files_digest::Error),
    #[error("protocol violation")]
    Protocol(#[from] ProtocolViolation),
    #[error("service responded with unexpected {0}")]
    UnexpectedResponse(ResponseKind),
    #[error("communication with the service failed")]
    Transport(#[from] TransportError),
    #[error("card operation failed")]
    Token(#[from] TokenError),
}

impl From<files_digest::Error> for Error {
    fn from(e: files_digest::Error) -> Self {
        match e {
            files_digest::Error::UnsupportedDigest(e) => Error::Digest(e),
            e => Error::Files(e),
        }
    }
}

impl Error {
    /// Whether the user walked away, as opposed to something going wrong.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::SelectionCancelled | Error::Token(TokenError::UserCancelled)
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::MiddlewareNotFound
            | Error::IdentityReadUnsupported
            | Error::Token(TokenError::BackendUnavailable(_)) => FailureKind::NoMiddleware,
            Error::InsecureClient
            | Error::Declined(_)
            | Error::ChannelBindingUnavailable(_)
            | Error::MissingHost(_)
            | Error::Contract(contract::Error::ChallengeTooShort(_))
            | Error::Digest(_) => FailureKind::Security,
            Error::Token(TokenError::PinIncorrect { .. }) => FailureKind::PinIncorrect,
            Error::Token(TokenError::PinBlocked) => FailureKind::PinBlocked,
            Error::Token(_) => FailureKind::Card,
            Error::HostResolution(_)
            | Error::Contract(_)
            | Error::SelectionCancelled
            | Error::Files(_)
            | Error::Protocol(_)
            | Error::UnexpectedResponse(_)
            | Error::Transport(_) => FailureKind::Generic,
        }
    }

    /// This error followed by each of its sources.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(e) = source {
            chain.push(e.to_string());
            source = e.source();
        }
        chain
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::messages::RequestKind;

    #[test]
    fn classification() {
        assert_eq!(
            Error::from(TokenError::BackendUnavailable("x".into())).failure_kind(),
            FailureKind::NoMiddleware
        );
        assert_eq!(
            Error::from(contract::Error::ChallengeTooShort(4)).failure_kind(),
            FailureKind::Security
        );
        assert_eq!(
            Error::from(TokenError::PinIncorrect {
                retries_left: Some(2)
            })
            .failure_kind(),
            FailureKind::PinIncorrect
        );
        assert_eq!(
            Error::from(TokenError::PinBlocked).failure_kind(),
            FailureKind::PinBlocked
        );
        assert_eq!(
            Error::from(TokenError::Contention).failure_kind(),
            FailureKind::Card
        );
        assert_eq!(
            Error::from(ProtocolViolation::NothingInFlight {
                response: ResponseKind::Finished
            })
            .failure_kind(),
            FailureKind::Generic
        );
        assert_eq!(
            Error::from(files_digest::Error::UnsupportedDigest(
                digest::Error::UnsupportedDigest("MD5".into())
            ))
            .failure_kind(),
            FailureKind::Security
        );
    }

    #[test]
    fn cancellation() {
        assert!(Error::from(TokenError::UserCancelled).is_cancellation());
        assert!(Error::SelectionCancelled.is_cancellation());
        assert!(!Error::Declined("signature").is_cancellation());
    }

    #[test]
    fn chain_follows_sources() {
        let error = Error::from(ProtocolViolation::UnexpectedResponse {
            request: RequestKind::Hello,
            response: ResponseKind::Finished,
        });
        assert_eq!(
            error.chain(),
            vec![
                "protocol violation".to_string(),
                "Finished is not an allowed response to Hello".to_string(),
            ]
        );
    }
}
