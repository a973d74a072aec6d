//! Identity file reads, for the identification branch and identity-bearing
//! authentication.
use super::{flag_details, wait_for_card, Controller, Error, OperationResult};
use crate::definitions::helpers::ByteStr;
use crate::definitions::messages::{
    IdentificationRequest, IdentityData, IdentityFiles, RequestMessage,
};
use crate::ports::{HostContext, MessageId, Status, StatusSink, UserPrompt};
use crate::token::runner::{Progress, TaskRunner};
use crate::token::{self, EidFile, TokenSession};
use crate::transport::Transport;

/// Progress weight of a certificate file, about 1050 bytes in 255 byte blocks.
pub(super) const CERTIFICATE_STEPS: i32 = 1050 / 255 + 1;
/// Progress weight of the photo, about 3000 bytes in 255 byte blocks.
pub(super) const PHOTO_STEPS: i32 = 3000 / 255;

pub(super) fn file_steps(file: EidFile) -> i32 {
    match file {
        EidFile::Identity
        | EidFile::IdentitySignature
        | EidFile::Address
        | EidFile::AddressSignature => 1,
        EidFile::Photo => PHOTO_STEPS,
        EidFile::RrnCertificate
        | EidFile::AuthenticationCertificate
        | EidFile::SigningCertificate
        | EidFile::CaCertificate
        | EidFile::RootCertificate => CERTIFICATE_STEPS,
    }
}

/// Files read for an identification request, in reading order.
pub fn identification_files(request: &IdentificationRequest) -> Vec<EidFile> {
    let mut files = vec![EidFile::Identity];
    if request.include_address {
        files.push(EidFile::Address);
    }
    if request.include_photo {
        files.push(EidFile::Photo);
    }
    if request.include_integrity_data {
        files.push(EidFile::IdentitySignature);
        if request.include_address {
            files.push(EidFile::AddressSignature);
        }
        files.push(EidFile::RrnCertificate);
        files.push(EidFile::RootCertificate);
    }
    if request.include_certificates {
        files.extend([
            EidFile::AuthenticationCertificate,
            EidFile::SigningCertificate,
            EidFile::CaCertificate,
        ]);
        if !request.include_integrity_data {
            files.push(EidFile::RootCertificate);
        }
    }
    files
}

/// Progress total for reading `files`.
pub fn progress_total(files: &[EidFile]) -> i32 {
    files.iter().copied().map(file_steps).sum()
}

/// Read one file through the runner, advancing progress by the weight of the file.
pub(super) fn read_file(
    runner: &mut TaskRunner,
    status: &mut dyn StatusSink,
    session: &mut TokenSession,
    file: EidFile,
) -> token::Result<ByteStr> {
    status.add_detail(&format!("reading {file} file"));
    let data = runner.run_weighted(status, file_steps(file), || session.read_file(file))?;
    tracing::debug!("read {} bytes from {file} file", data.len());
    Ok(data.into())
}

/// Slot of an identity file within the bundle. Card certificates other than the RRN
/// one are not identity files.
pub(super) fn identity_slot(
    files: &mut IdentityFiles,
    file: EidFile,
) -> Option<&mut Option<ByteStr>> {
    match file {
        EidFile::Identity => Some(&mut files.identity),
        EidFile::IdentitySignature => Some(&mut files.identity_signature),
        EidFile::Address => Some(&mut files.address),
        EidFile::AddressSignature => Some(&mut files.address_signature),
        EidFile::Photo => Some(&mut files.photo),
        EidFile::RrnCertificate => Some(&mut files.rrn_certificate),
        EidFile::AuthenticationCertificate
        | EidFile::SigningCertificate
        | EidFile::CaCertificate
        | EidFile::RootCertificate => None,
    }
}

fn read_identity(
    runner: &mut TaskRunner,
    status: &mut dyn StatusSink,
    session: &mut TokenSession,
    files: &[EidFile],
) -> token::Result<IdentityData> {
    let mut identity = IdentityData::default();
    for &file in files {
        let data = read_file(runner, status, session, file)?;
        let slot = match identity_slot(&mut identity.files, file) {
            Some(slot) => slot,
            None => match file {
                EidFile::AuthenticationCertificate => &mut identity.authn_certificate,
                EidFile::SigningCertificate => &mut identity.sign_certificate,
                EidFile::CaCertificate => &mut identity.ca_certificate,
                EidFile::RootCertificate => &mut identity.root_certificate,
                EidFile::Identity
                | EidFile::IdentitySignature
                | EidFile::Address
                | EidFile::AddressSignature
                | EidFile::Photo
                | EidFile::RrnCertificate => continue,
            },
        };
        *slot = Some(data);
    }
    Ok(identity)
}

impl<T, S, H, P> Controller<T, S, H, P>
where
    T: Transport,
    S: StatusSink,
    H: HostContext,
    P: UserPrompt,
{
    pub(super) fn identify(
        &mut self,
        request: IdentificationRequest,
    ) -> Result<OperationResult, Error> {
        flag_details(
            &mut self.status,
            &[
                ("include address", request.include_address),
                ("include photo", request.include_photo),
                ("include integrity data", request.include_integrity_data),
                ("include certificates", request.include_certificates),
                ("remove card", request.remove_card),
            ],
        );
        if let Some(usage) = &request.identity_data_usage {
            self.status
                .add_detail(&format!("identity data usage: {usage}"));
        }
        if !self.backends.has_native() {
            return Err(Error::IdentityReadUnsupported);
        }

        let files = identification_files(&request);
        let retry = self.retry_policy();
        let observer = self.observer();
        let status: &mut dyn StatusSink = &mut self.status;
        let prompt: &mut dyn UserPrompt = &mut self.prompt;
        let read = self.backends.with_native(observer, |session| {
            wait_for_card(session, status)?;
            status.set_status(Status::Normal, MessageId::ReadingIdentity);
            if !prompt.privacy_consent(
                request.include_address,
                request.include_photo,
                request.identity_data_usage.as_deref(),
            ) {
                return Ok(None);
            }

            let mut runner = retry.runner(progress_total(&files));
            runner.start(status);
            let read = read_identity(&mut runner, status, session, &files);
            Progress::hide(status);
            let identity = read?;

            if request.remove_card {
                status.set_status(Status::Normal, MessageId::RemoveCard);
                session.remove_card()?;
            }
            Ok(Some(identity))
        });
        self.drain_events();
        let Some(identity) = read? else {
            return Err(Error::Declined("release of identity data"));
        };

        self.status
            .set_status(Status::Normal, MessageId::TransmittingIdentity);
        self.expect_finished(RequestMessage::IdentityData(Box::new(identity)))?;
        Ok(OperationResult::IdentityBundleProduced)
    }
}
