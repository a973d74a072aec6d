//! Client side of the eID authentication and signing ceremonies.
//!
//! A relying-party service drives the ceremony: it answers the client's hello with the
//! operation to perform (sign a digest, authenticate, read the identity files, ...) and
//! the [controller::Controller] carries it out against the eID card through a
//! [token::TokenBackend], reporting progress through the [ports] traits.
pub mod cbor;
pub mod contract;
pub mod controller;
pub mod definitions;
pub mod files_digest;
pub mod ports;
pub mod protocol;
pub mod token;
pub mod transport;

pub use controller::{Controller, ControllerConfig, FailureKind, OperationResult};
