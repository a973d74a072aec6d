//! Files digest, signing certificates and signature branches.
use super::{flag_details, wait_for_card, Controller, Error, OperationResult};
use crate::definitions::messages::{RequestMessage, ResponseMessage};
use crate::definitions::DigestAlgorithm;
use crate::files_digest;
use crate::ports::{HostContext, MessageId, Status, StatusSink, UserPrompt};
use crate::token::runner::Progress;
use crate::token::{BackendKind, KeyPurpose, TokenEvent};
use crate::transport::Transport;
use std::sync::mpsc::Sender;

pub(super) struct SignRequest {
    pub digest_value: Vec<u8>,
    pub digest_algorithm: String,
    pub description: String,
    pub logoff: bool,
    pub remove_card: bool,
}

impl<T, S, H, P> Controller<T, S, H, P>
where
    T: Transport,
    S: StatusSink,
    H: HostContext,
    P: UserPrompt,
{
    pub(super) fn files_digest(&mut self, algorithm: &str) -> Result<OperationResult, Error> {
        self.status
            .add_detail(&format!("files digest algorithm: {algorithm}"));
        DigestAlgorithm::parse_files_digest(algorithm).map_err(Error::Digest)?;

        self.status.set_status(Status::Normal, MessageId::SelectFiles);
        let files = match self.prompt.select_files() {
            Some(files) if !files.is_empty() => files,
            _ => return Err(Error::SelectionCancelled),
        };

        self.status
            .set_status(Status::Normal, MessageId::DigestingFiles);
        let blocks = files_digest::block_count(&files)?;
        let mut progress = Progress::new(i32::try_from(blocks).unwrap_or(i32::MAX));
        let status: &mut dyn StatusSink = &mut self.status;
        progress.report(status);
        let entries = files_digest::digest_files(&files, algorithm, || {
            progress.step();
            progress.report(status);
        })?;
        Progress::hide(status);
        for entry in &entries {
            self.status
                .add_detail(&format!("{}: {}", entry.file_name, entry.digest));
        }

        let response = self.send(RequestMessage::FileDigestsData { entries })?;
        match self.dispatch(response)? {
            OperationResult::CertificatesOnly => Ok(OperationResult::FileDigestBundleProduced),
            outcome => Ok(outcome),
        }
    }

    pub(super) fn sign_certificates(&mut self) -> Result<OperationResult, Error> {
        self.require_backend()?;
        let retry = self.retry_policy();
        let observer = self.observer();
        let status: &mut dyn StatusSink = &mut self.status;
        let (chain, backend) = self.backends.with_fallback(observer, |session| {
            wait_for_card(session, status)?;
            retry.run(|| session.certificate_chain(KeyPurpose::NonRepudiation))
        })?;
        self.drain_events();
        self.status.add_detail(&format!(
            "signing certificate via {backend}: {}",
            chain.leaf().subject()
        ));

        let response = self.send(RequestMessage::SignCertificatesData { chain })?;
        match response {
            ResponseMessage::Finished => Ok(OperationResult::CertificatesOnly),
            other => self.dispatch(other),
        }
    }

    pub(super) fn sign(&mut self, request: SignRequest) -> Result<OperationResult, Error> {
        flag_details(
            &mut self.status,
            &[("logoff", request.logoff), ("remove card", request.remove_card)],
        );
        let algorithm = DigestAlgorithm::parse(&request.digest_algorithm).map_err(Error::Digest)?;
        algorithm
            .digest_info(&request.digest_value)
            .map_err(Error::Digest)?;
        self.require_backend()?;
        let question = format!(
            "OK to sign \"{}\"?\nSignature algorithm: {algorithm} with RSA",
            request.description
        );

        let retry = self.retry_policy();
        let observer = self.observer();
        let has_native = self.backends.has_native();
        let status: &mut dyn StatusSink = &mut self.status;
        let prompt: &mut dyn UserPrompt = &mut self.prompt;
        let mut logoff_reader = None;
        let signed = self.backends.with_fallback(observer.clone(), |session| {
            wait_for_card(session, status)?;
            if !prompt.confirm(&question) {
                return Ok(None);
            }
            status.set_status(Status::Normal, MessageId::Signing);
            status.add_detail(&format!("signing with algorithm: {algorithm} with RSA"));

            let mut remove_card = request.remove_card;
            if request.logoff && session.kind() == BackendKind::Pkcs11 {
                // PKCS#11 cannot reset the card, the native backend does it after close
                if !has_native {
                    remove_card = true;
                } else if !remove_card {
                    logoff_reader = session.slot_description()?;
                }
            }

            let signature = retry.run(|| {
                session.sign(&request.digest_value, algorithm, KeyPurpose::NonRepudiation)
            })?;
            let chain = retry.run(|| session.certificate_chain(KeyPurpose::NonRepudiation))?;
            if request.logoff && !remove_card && session.kind() == BackendKind::Native {
                session.logoff(None)?;
            }
            if remove_card {
                status.set_status(Status::Normal, MessageId::RemoveCard);
                session.remove_card()?;
            }
            Ok(Some((signature, chain)))
        });
        let logged_off = self.logoff_reader(logoff_reader, observer);
        self.drain_events();

        let (signed, backend) = signed?;
        logged_off?;
        let Some((signature, chain)) = signed else {
            return Err(Error::Declined("signature"));
        };
        tracing::info!("signature produced via {backend}");

        self.expect_finished(RequestMessage::SignatureData {
            signature: signature.into(),
            chain,
        })?;
        Ok(OperationResult::SignatureProduced)
    }

    /// Reset the card in `reader` through the native backend, once the PKCS#11 session
    /// that used it has been closed.
    pub(super) fn logoff_reader(
        &mut self,
        reader: Option<String>,
        observer: Option<Sender<TokenEvent>>,
    ) -> Result<(), Error> {
        let Some(reader) = reader else {
            return Ok(());
        };
        self.status.add_detail(&format!("logging off card in {reader}"));
        self.backends
            .with_native(observer, |session| session.logoff(Some(&reader)))
            .map_err(|e| {
                tracing::warn!("logoff of {reader} failed: {e}");
                Error::from(e)
            })
    }
}
