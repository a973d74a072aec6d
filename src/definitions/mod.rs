pub mod digest;
pub mod helpers;
pub mod messages;
pub mod x5chain;

pub use digest::DigestAlgorithm;
pub use messages::{
    AuthenticationData, AuthenticationRequest, FileDigest, IdentificationRequest, IdentityData,
    IdentityFiles, RequestKind, RequestMessage, ResponseKind, ResponseMessage,
};
pub use x5chain::{CertificateChain, X509};
