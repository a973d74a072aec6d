//! The authentication branch.
//!
//! The token signs the SHA-256 digest of an [AuthenticationContract] with the
//! authentication key. Requests that also want identity files go to the native backend,
//! which can read them in the same card session; all others go through PKCS#11 first.
use super::identification::{file_steps, identity_slot, read_file, CERTIFICATE_STEPS};
use super::{flag_details, wait_for_card, Controller, Error, OperationResult};
use crate::contract::{AuthenticationContract, Challenge, Salt};
use crate::definitions::messages::{
    AuthenticationData, AuthenticationRequest, IdentityFiles, RequestMessage,
};
use crate::definitions::{CertificateChain, DigestAlgorithm};
use crate::ports::{HostContext, MessageId, Status, StatusSink, UserPrompt};
use crate::token::runner::{Progress, TaskRunner};
use crate::token::{self, BackendKind, EidFile, KeyPurpose, TokenSession};
use crate::transport::Transport;

/// Files read after signing for an identity-bearing authentication, in reading order.
pub fn authentication_files(request: &AuthenticationRequest) -> Vec<EidFile> {
    let mut files = vec![];
    if request.include_identity {
        files.push(EidFile::Identity);
    }
    if request.include_address {
        files.push(EidFile::Address);
    }
    if request.include_photo {
        files.push(EidFile::Photo);
    }
    if request.include_integrity_data {
        if request.include_identity {
            files.push(EidFile::IdentitySignature);
        }
        if request.include_address {
            files.push(EidFile::AddressSignature);
        }
        files.push(EidFile::RrnCertificate);
    }
    files
}

/// Progress total of the native path: the three certificates of the chain plus the files.
pub fn progress_total(request: &AuthenticationRequest) -> i32 {
    3 * CERTIFICATE_STEPS
        + authentication_files(request)
            .into_iter()
            .map(file_steps)
            .sum::<i32>()
}

/// The authentication chain followed by the requested identity files, advancing the
/// runner's progress as it goes.
fn read_chain_and_files(
    runner: &mut TaskRunner,
    status: &mut dyn StatusSink,
    session: &mut TokenSession,
    request: &AuthenticationRequest,
) -> token::Result<(CertificateChain, IdentityFiles)> {
    let chain = runner.run_weighted(status, 3 * CERTIFICATE_STEPS, || {
        session.certificate_chain(KeyPurpose::Authentication)
    })?;
    status.set_status(Status::Normal, MessageId::ReadingIdentity);
    let mut files = IdentityFiles::default();
    for file in authentication_files(request) {
        if identity_slot(&mut files, file).is_none() {
            tracing::warn!("{file} is not an identity file, not reading it");
            continue;
        }
        let data = read_file(runner, status, session, file)?;
        if let Some(slot) = identity_slot(&mut files, file) {
            *slot = Some(data);
        }
    }
    Ok((chain, files))
}

struct Signed {
    signature: Vec<u8>,
    chain: CertificateChain,
    files: IdentityFiles,
}

impl<T, S, H, P> Controller<T, S, H, P>
where
    T: Transport,
    S: StatusSink,
    H: HostContext,
    P: UserPrompt,
{
    pub(super) fn authenticate(
        &mut self,
        request: AuthenticationRequest,
    ) -> Result<OperationResult, Error> {
        let challenge = Challenge::new(request.challenge.clone())?;
        flag_details(
            &mut self.status,
            &[
                ("include hostname", request.include_hostname),
                ("include inet address", request.include_inet_address),
                ("remove card after authn", request.remove_card),
                ("logoff", request.logoff),
                ("pre-logoff", request.pre_logoff),
                ("TLS session Id channel binding", request.session_id_channel_binding),
                (
                    "server certificate channel binding",
                    request.server_certificate_channel_binding,
                ),
                ("include identity", request.include_identity),
                ("include address", request.include_address),
                ("include photo", request.include_photo),
                ("include integrity data", request.include_integrity_data),
            ],
        );

        let salt = Salt::random();
        let session_id = if request.session_id_channel_binding {
            let id = self
                .transport
                .session_id()
                .ok_or(Error::ChannelBindingUnavailable("TLS session id"))?;
            Some(id)
        } else {
            None
        };
        let contract = self.contract(&request, salt, challenge, session_id.clone())?;
        let digest = contract.digest()?;

        self.status
            .set_status(Status::Normal, MessageId::DetectingCard);
        let signed = if request.reads_identity() {
            if !self.backends.has_native() {
                return Err(Error::IdentityReadUnsupported);
            }
            self.authenticate_native(&request, &digest)?
        } else {
            self.authenticate_pkcs11(&request, &digest)?
        };

        self.expect_finished(RequestMessage::AuthenticationData(Box::new(
            AuthenticationData {
                salt: contract.salt().as_bytes().into(),
                session_id: session_id.map(Into::into),
                signature: signed.signature.into(),
                chain: signed.chain,
                files: signed.files,
            },
        )))?;
        Ok(OperationResult::SignatureProduced)
    }

    fn contract(
        &mut self,
        request: &AuthenticationRequest,
        salt: Salt,
        challenge: Challenge,
        session_id: Option<Vec<u8>>,
    ) -> Result<AuthenticationContract, Error> {
        let mut builder = AuthenticationContract::builder(salt, challenge);
        if request.include_hostname || request.include_inet_address {
            let origin = self.host.document_origin();
            let host = origin
                .host_str()
                .ok_or_else(|| Error::MissingHost(origin.to_string()))?
                .to_string();
            if request.include_hostname {
                self.status.add_detail(&format!("hostname: {host}"));
                builder = builder.hostname(host.clone());
            }
            if request.include_inet_address {
                let address = self
                    .host
                    .resolve_host(&host)
                    .ok_or_else(|| Error::HostResolution(host.clone()))?;
                self.status.add_detail(&format!("inet address: {address}"));
                builder = builder.client_address(address);
            }
        }
        if let Some(session_id) = session_id {
            builder = builder.session_binding(session_id);
        }
        if request.server_certificate_channel_binding {
            let certificate = self
                .transport
                .server_certificate()
                .ok_or(Error::ChannelBindingUnavailable("server certificate"))?;
            builder = builder.server_cert_binding(certificate);
        }
        Ok(builder.build())
    }

    /// Sign with PKCS#11, falling back to the native backend when the middleware is missing.
    fn authenticate_pkcs11(
        &mut self,
        request: &AuthenticationRequest,
        digest: &[u8],
    ) -> Result<Signed, Error> {
        self.require_backend()?;
        let retry = self.retry_policy();
        let observer = self.observer();
        let has_native = self.backends.has_native();
        let status: &mut dyn StatusSink = &mut self.status;
        let mut logoff_reader = None;
        let signed = self.backends.with_fallback(observer.clone(), |session| {
            wait_for_card(session, status)?;
            status.set_status(Status::Normal, MessageId::Authenticating);

            let pkcs11 = session.kind() == BackendKind::Pkcs11;
            let mut remove_card = request.remove_card;
            if request.logoff && pkcs11 {
                if !has_native {
                    remove_card = true;
                } else if !remove_card {
                    logoff_reader = session.slot_description()?;
                }
            }
            if request.pre_logoff {
                status.add_detail("performing a pre-logoff");
                session.logoff(None)?;
            }

            let signature = retry.run(|| {
                session.sign(digest, DigestAlgorithm::Sha256, KeyPurpose::Authentication)
            })?;
            let chain = retry.run(|| session.certificate_chain(KeyPurpose::Authentication))?;
            if request.logoff && !remove_card && !pkcs11 {
                session.logoff(None)?;
            }
            if remove_card {
                status.set_status(Status::Normal, MessageId::RemoveCard);
                session.remove_card()?;
            }
            Ok(Signed {
                signature,
                chain,
                files: IdentityFiles::default(),
            })
        });
        let logged_off = self.logoff_reader(logoff_reader, observer);
        self.drain_events();

        let (signed, backend) = signed?;
        logged_off?;
        tracing::info!("authentication signature produced via {backend}");
        Ok(signed)
    }

    /// Sign and read the requested identity files in one native card session.
    fn authenticate_native(
        &mut self,
        request: &AuthenticationRequest,
        digest: &[u8],
    ) -> Result<Signed, Error> {
        let retry = self.retry_policy();
        let observer = self.observer();
        let status: &mut dyn StatusSink = &mut self.status;
        let prompt: &mut dyn UserPrompt = &mut self.prompt;
        let signed = self.backends.with_native(observer, |session| {
            wait_for_card(session, status)?;
            status.set_status(Status::Normal, MessageId::Authenticating);
            if !prompt.privacy_consent(request.include_address, request.include_photo, None) {
                return Ok(None);
            }
            if request.pre_logoff {
                status.add_detail("performing a pre-logoff");
                session.logoff(None)?;
            }
            let signature = retry.run(|| {
                session.sign(digest, DigestAlgorithm::Sha256, KeyPurpose::Authentication)
            })?;

            let mut runner = retry.runner(progress_total(request));
            runner.start(status);
            let read = read_chain_and_files(&mut runner, status, session, request);
            Progress::hide(status);
            let (chain, files) = read?;

            if request.logoff && !request.remove_card {
                session.logoff(None)?;
            }
            if request.remove_card {
                status.set_status(Status::Normal, MessageId::RemoveCard);
                session.remove_card()?;
            }
            Ok(Some(Signed {
                signature,
                chain,
                files,
            }))
        });
        self.drain_events();
        signed?.ok_or(Error::Declined("release of identity data"))
    }
}
