//! Native eID card backend speaking APDUs over a [CardChannel].
//!
//! Files are addressed by path from the master file and read in blocks. Signing selects
//! the key with `MSE SET`, verifies the cardholder PIN and asks the card to compute the
//! signature over a DigestInfo. The non-repudiation key needs a fresh PIN verification
//! for every signature; the authentication key reuses a PIN verified earlier in the
//! session.
use super::apdu::{self, Command, Response, StatusWord};
use super::{BackendKind, EidFile, KeyPurpose, Result, TokenBackend, TokenError, TokenEvent};
use crate::definitions::{CertificateChain, DigestAlgorithm};
use std::sync::mpsc::Sender;
use zeroize::Zeroizing;

/// Access to smart-card readers.
pub trait CardChannel {
    fn readers(&mut self) -> Result<Vec<String>>;

    fn wait_for_reader(&mut self) -> Result<()>;

    /// Whether any reader holds a card.
    fn is_card_present(&mut self) -> Result<bool>;

    fn wait_for_card(&mut self) -> Result<()>;

    fn wait_for_removal(&mut self) -> Result<()>;

    /// Connect exclusively to the card in `reader`, or in the first reader holding one.
    /// Returns the name of the reader connected to.
    fn connect(&mut self, reader: Option<&str>) -> Result<String>;

    /// Exchange one raw APDU.
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>>;

    fn disconnect(&mut self);
}

/// PIN and PUK capture. Returning `None` means the user cancelled.
pub trait PinEntry {
    /// `retries_left` is known after a previous failed attempt.
    fn pin(&mut self, retries_left: Option<u8>) -> Option<Zeroizing<String>>;

    /// Current and new PIN.
    fn pin_change(
        &mut self,
        retries_left: Option<u8>,
    ) -> Option<(Zeroizing<String>, Zeroizing<String>)>;

    fn puk(&mut self, retries_left: Option<u8>) -> Option<Zeroizing<String>>;
}

pub struct EidCard<C, P> {
    channel: C,
    pins: P,
    reader: Option<String>,
    pin_verified: bool,
    retries_left: Option<u8>,
    observer: Option<Sender<TokenEvent>>,
}

impl<C: CardChannel, P: PinEntry> EidCard<C, P> {
    pub fn new(channel: C, pins: P) -> EidCard<C, P> {
        EidCard {
            channel,
            pins,
            reader: None,
            pin_verified: false,
            retries_left: None,
            observer: None,
        }
    }

    fn notify(&self, event: TokenEvent) {
        if let Some(observer) = &self.observer {
            // advisory only, a gone receiver is not an error
            let _ = observer.send(event);
        }
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.reader.is_none() {
            let reader = self.channel.connect(None)?;
            tracing::debug!("connected to card in {reader}");
            self.notify(TokenEvent::ReaderConnected {
                reader: reader.clone(),
            });
            self.reader = Some(reader);
        }
        Ok(())
    }

    fn transmit(&mut self, command: &Command) -> Result<Response> {
        let raw = self.channel.transmit(&command.to_bytes())?;
        let mut response = Response::parse(&raw)?;
        // collect chained response data
        while response.sw.sw1() == 0x61 {
            let raw = self
                .channel
                .transmit(&apdu::get_response(response.sw.sw2()).to_bytes())?;
            let next = Response::parse(&raw)?;
            response.data.extend_from_slice(&next.data);
            response.sw = next.sw;
        }
        Ok(response)
    }

    fn select(&mut self, file: EidFile) -> Result<()> {
        self.transmit(&apdu::select_file(file.path()))?
            .sw
            .check("SELECT FILE")
    }

    fn verify_pin(&mut self) -> Result<()> {
        let pin = self
            .pins
            .pin(self.retries_left)
            .ok_or(TokenError::UserCancelled)?;
        let block = apdu::pin_block(&pin)?;
        let result = self.transmit(&apdu::verify_pin(&block))?.sw.check("VERIFY");
        self.record_pin_result(&result);
        result?;
        self.pin_verified = true;
        self.notify(TokenEvent::PinVerified);
        Ok(())
    }

    fn record_pin_result(&mut self, result: &Result<()>) {
        match result {
            Ok(()) => self.retries_left = None,
            Err(TokenError::PinIncorrect { retries_left }) => {
                tracing::warn!("incorrect PIN, attempts left: {retries_left:?}");
                self.retries_left = *retries_left;
            }
            Err(TokenError::PinBlocked) => self.retries_left = Some(0),
            Err(_) => {}
        }
    }

    fn compute_signature(&mut self, digest_info: &[u8]) -> Result<Response> {
        self.transmit(&apdu::compute_signature(digest_info))
    }

    fn read_file_blocks(&mut self, file: EidFile) -> Result<Vec<u8>> {
        self.select(file)?;
        let mut content = Vec::new();
        loop {
            let response = self.transmit(&apdu::read_binary(content.len(), apdu::BLOCK_SIZE))?;
            match (response.sw.sw1(), response.sw.sw2()) {
                (0x90, 0x00) => {
                    let offset = content.len();
                    let read = response.data.len();
                    content.extend_from_slice(&response.data);
                    self.notify(TokenEvent::BlockRead { file, offset });
                    if read < apdu::BLOCK_SIZE as usize {
                        break;
                    }
                }
                (0x6C, len) => {
                    // wrong length: the card tells us how much is left
                    let offset = content.len();
                    let response = self.transmit(&apdu::read_binary(offset, len))?;
                    response.sw.check("READ BINARY")?;
                    content.extend_from_slice(&response.data);
                    self.notify(TokenEvent::BlockRead { file, offset });
                    break;
                }
                _ if response.sw == StatusWord::END_OF_FILE => break,
                _ => return Err(response.sw.check("READ BINARY").err().unwrap_or_else(|| {
                    TokenError::Device(format!("READ BINARY failed: SW={}", response.sw))
                })),
            }
        }
        tracing::debug!("read {} bytes from {file}", content.len());
        Ok(content)
    }

    fn reset(&mut self) {
        self.reader = None;
        self.pin_verified = false;
    }
}

impl<C: CardChannel, P: PinEntry> TokenBackend for EidCard<C, P> {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn reader_list(&mut self) -> Result<Vec<String>> {
        self.channel.readers()
    }

    fn wait_for_reader(&mut self) -> Result<()> {
        self.channel.wait_for_reader()
    }

    fn is_token_present(&mut self) -> Result<bool> {
        self.channel.is_card_present()
    }

    fn wait_for_token_present(&mut self) -> Result<()> {
        self.channel.wait_for_card()
    }

    fn sign(
        &mut self,
        digest: &[u8],
        algorithm: DigestAlgorithm,
        purpose: KeyPurpose,
    ) -> Result<Vec<u8>> {
        let digest_info = algorithm
            .digest_info(digest)
            .map_err(|e| TokenError::Device(e.to_string()))?;
        self.ensure_connected()?;
        let key = match purpose {
            KeyPurpose::Authentication => apdu::key::AUTHENTICATION,
            KeyPurpose::NonRepudiation => apdu::key::NON_REPUDIATION,
        };
        self.transmit(&apdu::mse_set(key))?.sw.check("MSE SET")?;
        if purpose == KeyPurpose::NonRepudiation || !self.pin_verified {
            self.verify_pin()?;
        }
        let mut response = self.compute_signature(&digest_info)?;
        if response.sw == StatusWord::SECURITY_STATUS_NOT_SATISFIED {
            tracing::debug!("card asks for PIN verification again");
            self.verify_pin()?;
            response = self.compute_signature(&digest_info)?;
            if response.sw == StatusWord::SECURITY_STATUS_NOT_SATISFIED {
                return Err(TokenError::Device(
                    "card refused signature after PIN verification".to_string(),
                ));
            }
        }
        response.sw.check("COMPUTE DIGITAL SIGNATURE")?;
        Ok(response.data)
    }

    fn certificate_chain(&mut self, purpose: KeyPurpose) -> Result<CertificateChain> {
        let leaf = match purpose {
            KeyPurpose::Authentication => EidFile::AuthenticationCertificate,
            KeyPurpose::NonRepudiation => EidFile::SigningCertificate,
        };
        let mut builder = CertificateChain::builder();
        for file in [leaf, EidFile::CaCertificate, EidFile::RootCertificate] {
            let der = self.read_file(file)?;
            builder = builder.with_der(&der)?;
        }
        Ok(builder.build()?)
    }

    fn read_file(&mut self, file: EidFile) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        self.read_file_blocks(file)
    }

    fn remove_card(&mut self) -> Result<()> {
        if self.reader.is_some() {
            self.channel.disconnect();
            self.reset();
        }
        self.channel.wait_for_removal()
    }

    fn logoff(&mut self, reader: Option<&str>) -> Result<()> {
        if let Some(wanted) = reader {
            if self.reader.as_deref() != Some(wanted) {
                if self.reader.is_some() {
                    self.channel.disconnect();
                    self.reset();
                }
                self.reader = Some(self.channel.connect(Some(wanted))?);
            }
        }
        self.ensure_connected()?;
        self.transmit(&apdu::logoff())?.sw.check("LOGOFF")?;
        self.pin_verified = false;
        Ok(())
    }

    fn slot_description(&mut self) -> Result<Option<String>> {
        Ok(self.reader.clone())
    }

    fn change_pin(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let (old, new) = self
            .pins
            .pin_change(self.retries_left)
            .ok_or(TokenError::UserCancelled)?;
        let old = apdu::pin_block(&old)?;
        let new = apdu::pin_block(&new)?;
        let command = apdu::change_pin(&old, &new);
        let result = self.transmit(&command)?.sw.check("CHANGE PIN");
        self.record_pin_result(&result);
        result
    }

    fn unblock_pin(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let puk = self
            .pins
            .puk(self.retries_left)
            .ok_or(TokenError::UserCancelled)?;
        let puk = apdu::pin_block(&puk)?;
        let command = apdu::unblock_pin(&puk);
        let result = self.transmit(&command)?.sw.check("UNBLOCK PIN");
        if result.is_ok() {
            self.retries_left = None;
        }
        result
    }

    fn set_observer(&mut self, observer: Option<Sender<TokenEvent>>) {
        self.observer = observer;
    }

    fn close(&mut self) {
        if self.reader.is_some() {
            self.channel.disconnect();
        }
        self.reset();
    }

    fn supports_identity_read(&self) -> bool {
        true
    }

    fn supports_administration(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::mpsc;

    static SIGNING: &[u8] = include_bytes!("../../test/certs/signing.der");
    static CA: &[u8] = include_bytes!("../../test/certs/ca.der");
    static ROOT: &[u8] = include_bytes!("../../test/certs/root.der");

    /// A card simulator that understands the commands the backend sends.
    struct SimulatedCard {
        files: HashMap<Vec<u8>, Vec<u8>>,
        selected: Vec<u8>,
        pin: Vec<u8>,
        puk: Vec<u8>,
        tries: u8,
        verified: bool,
        pending: Vec<u8>,
        sent: Vec<Vec<u8>>,
        present: bool,
    }

    impl SimulatedCard {
        fn new() -> SimulatedCard {
            let mut files = HashMap::new();
            files.insert(EidFile::SigningCertificate.path().to_vec(), SIGNING.to_vec());
            files.insert(EidFile::CaCertificate.path().to_vec(), CA.to_vec());
            files.insert(EidFile::RootCertificate.path().to_vec(), ROOT.to_vec());
            files.insert(EidFile::Identity.path().to_vec(), vec![0x01; 0xF8 * 2 + 17]);
            files.insert(EidFile::Address.path().to_vec(), vec![0x02; 0xF8]);
            SimulatedCard {
                files,
                selected: vec![],
                pin: apdu::pin_block("1234").unwrap().to_vec(),
                puk: apdu::pin_block("111111").unwrap().to_vec(),
                tries: 3,
                verified: false,
                pending: vec![],
                sent: vec![],
                present: true,
            }
        }

        /// Count a wrong PIN against the try counter.
        fn wrong_pin(&mut self) -> Vec<u8> {
            self.tries = self.tries.saturating_sub(1);
            match self.tries {
                0 => sw(0x6983),
                n => sw(0x63C0 | n as u16),
            }
        }

        fn sent_ins(&self) -> Vec<u8> {
            self.sent.iter().map(|apdu| apdu[1]).collect()
        }
    }

    fn sw(sw: u16) -> Vec<u8> {
        sw.to_be_bytes().to_vec()
    }

    impl CardChannel for SimulatedCard {
        fn readers(&mut self) -> Result<Vec<String>> {
            Ok(vec!["Sim Reader 0".into()])
        }

        fn wait_for_reader(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_card_present(&mut self) -> Result<bool> {
            Ok(self.present)
        }

        fn wait_for_card(&mut self) -> Result<()> {
            self.present = true;
            Ok(())
        }

        fn wait_for_removal(&mut self) -> Result<()> {
            self.present = false;
            Ok(())
        }

        fn connect(&mut self, reader: Option<&str>) -> Result<String> {
            Ok(reader.unwrap_or("Sim Reader 0").to_string())
        }

        fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
            self.sent.push(apdu.to_vec());
            let data = if apdu.len() > 5 { &apdu[5..] } else { &[][..] };
            Ok(match apdu[1] {
                0xA4 => match self.files.contains_key(data) {
                    true => {
                        self.selected = data.to_vec();
                        sw(0x9000)
                    }
                    false => sw(0x6A82),
                },
                0xB0 => {
                    let content = &self.files[&self.selected];
                    let offset = ((apdu[2] as usize) << 8) | apdu[3] as usize;
                    let le = apdu[4] as usize;
                    if offset >= content.len() {
                        sw(0x6B00)
                    } else if offset + le > content.len() {
                        vec![0x6C, (content.len() - offset) as u8]
                    } else {
                        let mut out = content[offset..offset + le].to_vec();
                        out.extend(sw(0x9000));
                        out
                    }
                }
                0x22 => sw(0x9000),
                0x20 => {
                    if self.tries == 0 {
                        sw(0x6983)
                    } else if data == self.pin.as_slice() {
                        self.tries = 3;
                        self.verified = true;
                        sw(0x9000)
                    } else {
                        self.wrong_pin()
                    }
                }
                0x24 => {
                    if self.tries == 0 {
                        sw(0x6983)
                    } else if data[..8] == self.pin[..] {
                        self.pin = data[8..].to_vec();
                        self.tries = 3;
                        sw(0x9000)
                    } else {
                        self.wrong_pin()
                    }
                }
                0x2C if data == self.puk.as_slice() => {
                    self.tries = 3;
                    sw(0x9000)
                }
                0x2C => sw(0x63C9),
                0x2A if !self.verified => sw(0x6982),
                0x2A => {
                    // non-repudiation needs a verification per signature
                    self.verified = false;
                    self.pending = data.iter().rev().copied().collect();
                    vec![0x61, self.pending.len() as u8]
                }
                0xC0 => {
                    let mut out = std::mem::take(&mut self.pending);
                    out.extend(sw(0x9000));
                    out
                }
                0xE6 => {
                    self.verified = false;
                    sw(0x9000)
                }
                _ => sw(0x6D00),
            })
        }

        fn disconnect(&mut self) {}
    }

    struct Pins(Vec<&'static str>, Vec<Option<u8>>);

    impl PinEntry for Pins {
        fn pin(&mut self, retries_left: Option<u8>) -> Option<Zeroizing<String>> {
            self.1.push(retries_left);
            if self.0.is_empty() {
                None
            } else {
                Some(Zeroizing::new(self.0.remove(0).to_string()))
            }
        }

        fn pin_change(
            &mut self,
            retries_left: Option<u8>,
        ) -> Option<(Zeroizing<String>, Zeroizing<String>)> {
            let old = self.pin(retries_left)?;
            let new = self.pin(retries_left)?;
            Some((old, new))
        }

        fn puk(&mut self, retries_left: Option<u8>) -> Option<Zeroizing<String>> {
            self.pin(retries_left)
        }
    }

    fn card(pins: &[&'static str]) -> EidCard<SimulatedCard, Pins> {
        EidCard::new(SimulatedCard::new(), Pins(pins.to_vec(), vec![]))
    }

    #[test]
    fn reads_files_in_blocks() {
        let mut card = card(&[]);
        let (tx, rx) = mpsc::channel();
        card.set_observer(Some(tx));
        let identity = card.read_file(EidFile::Identity).unwrap();
        assert_eq!(identity, vec![0x01; 0xF8 * 2 + 17]);
        let offsets: Vec<_> = rx
            .try_iter()
            .filter_map(|event| match event {
                TokenEvent::BlockRead { offset, .. } => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 0xF8, 0xF8 * 2]);

        // an exact multiple of the block size ends on 6B00
        assert_eq!(card.read_file(EidFile::Address).unwrap().len(), 0xF8);
    }

    #[test]
    fn missing_file_is_a_device_error() {
        let mut card = card(&[]);
        assert!(matches!(
            card.read_file(EidFile::Photo),
            Err(TokenError::Device(_))
        ));
    }

    #[test]
    fn builds_signing_chain() {
        let mut card = card(&[]);
        let chain = card.certificate_chain(KeyPurpose::NonRepudiation).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.leaf().der(), SIGNING);
    }

    #[test]
    fn signs_digest_info_after_pin() {
        let mut card = card(&["1234"]);
        let digest = DigestAlgorithm::Sha256.digest(b"document");
        let signature = card
            .sign(&digest, DigestAlgorithm::Sha256, KeyPurpose::NonRepudiation)
            .unwrap();
        let mut expected = DigestAlgorithm::Sha256.digest_info(&digest).unwrap();
        expected.reverse();
        assert_eq!(signature, expected);
        assert_eq!(card.channel.sent_ins(), vec![0x22, 0x20, 0x2A, 0xC0]);
    }

    #[test]
    fn wrong_pin_reports_retries() {
        let mut card = card(&["0000", "1234"]);
        let digest = [0u8; 32];
        assert!(matches!(
            card.sign(&digest, DigestAlgorithm::Sha256, KeyPurpose::NonRepudiation),
            Err(TokenError::PinIncorrect {
                retries_left: Some(2)
            })
        ));
        card.sign(&digest, DigestAlgorithm::Sha256, KeyPurpose::NonRepudiation)
            .unwrap();
        assert_eq!(card.pins.1, vec![None, Some(2)]);
    }

    #[test]
    fn blocked_pin() {
        let mut card = card(&["1234"]);
        card.channel.tries = 0;
        assert!(matches!(
            card.sign(&[0; 20], DigestAlgorithm::Sha1, KeyPurpose::Authentication),
            Err(TokenError::PinBlocked)
        ));
    }

    #[test]
    fn cancelled_pin_entry() {
        let mut card = card(&[]);
        assert!(matches!(
            card.sign(&[0; 32], DigestAlgorithm::Sha256, KeyPurpose::Authentication),
            Err(TokenError::UserCancelled)
        ));
    }

    #[test]
    fn security_status_triggers_one_reverification() {
        let mut card = card(&["1234", "1234"]);
        card.pin_verified = true;
        card.sign(&[0; 32], DigestAlgorithm::Sha256, KeyPurpose::Authentication)
            .unwrap();
        assert_eq!(card.channel.sent_ins(), vec![0x22, 0x2A, 0x20, 0x2A, 0xC0]);
    }

    #[test]
    fn logoff_and_removal() {
        let mut card = card(&[]);
        card.logoff(Some("Sim Reader 1")).unwrap();
        assert_eq!(
            card.slot_description().unwrap().as_deref(),
            Some("Sim Reader 1")
        );
        assert_eq!(card.channel.sent.last().unwrap(), &vec![0x80, 0xE6, 0x00, 0x00]);
        card.remove_card().unwrap();
        assert!(!card.is_token_present().unwrap());
        assert_eq!(card.slot_description().unwrap(), None);
    }

    #[test]
    fn change_pin_sends_both_blocks() {
        let mut card = card(&["1234", "5678"]);
        card.change_pin().unwrap();
        assert_eq!(
            card.channel.sent.last().unwrap(),
            &vec![
                0x00, 0x24, 0x00, 0x01, 0x10, // header, Lc
                0x24, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // current PIN
                0x24, 0x56, 0x78, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // new PIN
            ]
        );
        assert_eq!(card.channel.pin, apdu::pin_block("5678").unwrap().to_vec());
    }

    #[test]
    fn change_pin_with_wrong_current_pin() {
        let mut card = card(&["0000", "5678", "1234", "4321"]);
        assert!(matches!(
            card.change_pin(),
            Err(TokenError::PinIncorrect {
                retries_left: Some(2)
            })
        ));
        assert_eq!(card.channel.pin, apdu::pin_block("1234").unwrap().to_vec());
        card.change_pin().unwrap();
        assert_eq!(card.pins.1, vec![None, None, Some(2), Some(2)]);
    }

    #[test]
    fn change_pin_on_blocked_card() {
        let mut card = card(&["1234", "5678"]);
        card.channel.tries = 0;
        assert!(matches!(card.change_pin(), Err(TokenError::PinBlocked)));
    }

    #[test]
    fn unblock_pin_sends_puk() {
        let mut card = card(&["111111"]);
        card.channel.tries = 0;
        card.unblock_pin().unwrap();
        assert_eq!(
            card.channel.sent.last().unwrap(),
            &vec![0x00, 0x2C, 0x00, 0x01, 0x08, 0x26, 0x11, 0x11, 0x11, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(card.channel.tries, 3);
    }

    #[test]
    fn wrong_puk_reports_retries() {
        let mut card = card(&["999999"]);
        assert!(matches!(
            card.unblock_pin(),
            Err(TokenError::PinIncorrect {
                retries_left: Some(9)
            })
        ));
    }

    #[test]
    fn cancelled_pin_change() {
        let mut card = card(&["1234"]);
        assert!(matches!(card.change_pin(), Err(TokenError::UserCancelled)));
        assert!(card.channel.sent.is_empty());
    }
}
