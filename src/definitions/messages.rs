//! Typed messages exchanged with the relying-party service.
//!
//! Requests flow from the client to the service, responses flow back. Every request
//! kind carries a static list of the response kinds that may legally answer it; see
//! [RequestKind::responses_allowed].
use crate::definitions::helpers::ByteStr;
use crate::definitions::x5chain::CertificateChain;
use serde::{Deserialize, Serialize};
use strum_macros::EnumDiscriminants;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(RequestKind))]
#[strum_discriminants(derive(Hash, strum_macros::Display))]
#[serde(rename_all = "camelCase")]
pub enum RequestMessage {
    Hello {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        language: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ClientEnvironment {
        client_version: String,
        os_name: String,
        os_version: String,
        os_arch: String,
        reader_list: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        navigator_app_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        navigator_app_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        navigator_user_agent: Option<String>,
    },
    ContinueInsecure,
    FileDigestsData {
        entries: Vec<FileDigest>,
    },
    SignCertificatesData {
        chain: CertificateChain,
    },
    SignatureData {
        signature: ByteStr,
        chain: CertificateChain,
    },
    AuthenticationData(Box<AuthenticationData>),
    IdentityData(Box<IdentityData>),
}

/// One entry of a files-digest bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDigest {
    pub digest_algorithm: String,
    /// Upper-case hexadecimal digest value.
    pub digest: String,
    pub file_name: String,
}

/// Identity files read from the card. Every field is optional because what gets read
/// depends on the flags of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityFiles {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identity: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub address: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub photo: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identity_signature: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub address_signature: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rrn_certificate: Option<ByteStr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationData {
    pub salt: ByteStr,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<ByteStr>,
    pub signature: ByteStr,
    pub chain: CertificateChain,
    #[serde(flatten)]
    pub files: IdentityFiles,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityData {
    #[serde(flatten)]
    pub files: IdentityFiles,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub root_certificate: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub authn_certificate: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sign_certificate: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ca_certificate: Option<ByteStr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(ResponseKind))]
#[strum_discriminants(derive(Hash, strum_macros::Display))]
#[serde(rename_all = "camelCase")]
pub enum ResponseMessage {
    CheckClient,
    #[serde(rename_all = "camelCase")]
    InsecureClient {
        warn_only: bool,
    },
    Kiosk,
    #[serde(rename_all = "camelCase")]
    Administration {
        change_pin: bool,
        unblock_pin: bool,
        logoff: bool,
        remove_card: bool,
    },
    #[serde(rename_all = "camelCase")]
    FilesDigestRequest {
        digest_algorithm: String,
    },
    SignCertificatesRequest,
    #[serde(rename_all = "camelCase")]
    SignRequest {
        digest_value: ByteStr,
        digest_algorithm: String,
        description: String,
        logoff: bool,
        remove_card: bool,
    },
    AuthenticationRequest(AuthenticationRequest),
    IdentificationRequest(IdentificationRequest),
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    pub challenge: ByteStr,
    #[serde(default)]
    pub include_hostname: bool,
    #[serde(default)]
    pub include_inet_address: bool,
    #[serde(default)]
    pub remove_card: bool,
    #[serde(default)]
    pub logoff: bool,
    #[serde(default)]
    pub pre_logoff: bool,
    #[serde(default)]
    pub session_id_channel_binding: bool,
    #[serde(default)]
    pub server_certificate_channel_binding: bool,
    #[serde(default)]
    pub include_identity: bool,
    #[serde(default)]
    pub include_address: bool,
    #[serde(default)]
    pub include_photo: bool,
    #[serde(default)]
    pub include_integrity_data: bool,
}

impl AuthenticationRequest {
    /// Whether answering needs identity files, which only the native backend can read.
    ///
    /// Integrity data alone does not count: it only qualifies the files that are read.
    pub fn reads_identity(&self) -> bool {
        self.include_identity || self.include_address || self.include_photo
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentificationRequest {
    #[serde(default)]
    pub include_address: bool,
    #[serde(default)]
    pub include_photo: bool,
    #[serde(default)]
    pub include_integrity_data: bool,
    #[serde(default)]
    pub include_certificates: bool,
    #[serde(default)]
    pub remove_card: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub identity_data_usage: Option<String>,
}

/// Responses that start an operation, in the order the service may pick them.
const OPERATION_RESPONSES: [ResponseKind; 7] = [
    ResponseKind::Kiosk,
    ResponseKind::Administration,
    ResponseKind::FilesDigestRequest,
    ResponseKind::SignCertificatesRequest,
    ResponseKind::SignRequest,
    ResponseKind::AuthenticationRequest,
    ResponseKind::IdentificationRequest,
];

const HELLO_RESPONSES: [ResponseKind; 8] = [
    ResponseKind::CheckClient,
    ResponseKind::Kiosk,
    ResponseKind::Administration,
    ResponseKind::FilesDigestRequest,
    ResponseKind::SignCertificatesRequest,
    ResponseKind::SignRequest,
    ResponseKind::AuthenticationRequest,
    ResponseKind::IdentificationRequest,
];

const CLIENT_ENVIRONMENT_RESPONSES: [ResponseKind; 8] = [
    ResponseKind::InsecureClient,
    ResponseKind::Kiosk,
    ResponseKind::Administration,
    ResponseKind::FilesDigestRequest,
    ResponseKind::SignCertificatesRequest,
    ResponseKind::SignRequest,
    ResponseKind::AuthenticationRequest,
    ResponseKind::IdentificationRequest,
];

impl RequestKind {
    /// The response kinds that may legally answer a request of this kind.
    pub fn responses_allowed(&self) -> &'static [ResponseKind] {
        match self {
            RequestKind::Hello => &HELLO_RESPONSES,
            RequestKind::ClientEnvironment => &CLIENT_ENVIRONMENT_RESPONSES,
            RequestKind::ContinueInsecure => &OPERATION_RESPONSES,
            RequestKind::FileDigestsData => &[
                ResponseKind::SignCertificatesRequest,
                ResponseKind::SignRequest,
            ],
            RequestKind::SignCertificatesData => {
                &[ResponseKind::SignRequest, ResponseKind::Finished]
            }
            RequestKind::SignatureData
            | RequestKind::AuthenticationData
            | RequestKind::IdentityData => &[ResponseKind::Finished],
        }
    }
}

impl RequestMessage {
    pub fn kind(&self) -> RequestKind {
        self.into()
    }
}

impl ResponseMessage {
    pub fn kind(&self) -> ResponseKind {
        self.into()
    }
}
