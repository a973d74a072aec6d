//! [CardChannel] over the system PC/SC service.
use super::eid::CardChannel;
use super::{Result, TokenError};
use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State};
use std::ffi::{CStr, CString};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn map_err(e: pcsc::Error) -> TokenError {
    match e {
        pcsc::Error::SharingViolation => TokenError::Contention,
        pcsc::Error::NoService | pcsc::Error::ServiceStopped => {
            TokenError::BackendUnavailable(e.to_string())
        }
        pcsc::Error::NoReadersAvailable
        | pcsc::Error::UnknownReader
        | pcsc::Error::ReaderUnavailable => TokenError::ReaderUnavailable(e.to_string()),
        pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard | pcsc::Error::ResetCard => {
            TokenError::TokenUnavailable(e.to_string())
        }
        _ => TokenError::Device(e.to_string()),
    }
}

pub struct PcscChannel {
    context: Context,
    card: Option<Card>,
}

impl PcscChannel {
    /// Connect to the PC/SC service. Fails with [TokenError::BackendUnavailable] when
    /// the service is not running.
    pub fn establish() -> Result<PcscChannel> {
        let context = Context::establish(Scope::User).map_err(|e| match e {
            pcsc::Error::NoService | pcsc::Error::ServiceStopped => {
                TokenError::BackendUnavailable(e.to_string())
            }
            other => map_err(other),
        })?;
        Ok(PcscChannel {
            context,
            card: None,
        })
    }

    fn reader_names(&self) -> Result<Vec<CString>> {
        match self.context.list_readers_owned() {
            Ok(readers) => Ok(readers),
            Err(pcsc::Error::NoReadersAvailable) => Ok(vec![]),
            Err(e) => Err(map_err(e)),
        }
    }

    /// Current state of every reader.
    fn reader_states(&self, timeout: Duration) -> Result<Vec<ReaderState>> {
        let mut states: Vec<ReaderState> = self
            .reader_names()?
            .into_iter()
            .map(|name| ReaderState::new(name, State::UNAWARE))
            .collect();
        if states.is_empty() {
            return Ok(states);
        }
        match self.context.get_status_change(timeout, &mut states) {
            Ok(()) | Err(pcsc::Error::Timeout) => Ok(states),
            Err(e) => Err(map_err(e)),
        }
    }

    fn wait_until(&self, mut done: impl FnMut(&[ReaderState]) -> bool) -> Result<()> {
        loop {
            let states = self.reader_states(Duration::ZERO)?;
            if done(&states) {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn connect_reader(&self, reader: &CStr) -> Result<Card> {
        self.context
            .connect(reader, ShareMode::Exclusive, Protocols::ANY)
            .map_err(map_err)
    }
}

impl CardChannel for PcscChannel {
    fn readers(&mut self) -> Result<Vec<String>> {
        Ok(self
            .reader_names()?
            .into_iter()
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn wait_for_reader(&mut self) -> Result<()> {
        self.wait_until(|states| !states.is_empty())
    }

    fn is_card_present(&mut self) -> Result<bool> {
        Ok(self
            .reader_states(Duration::ZERO)?
            .iter()
            .any(|state| state.event_state().contains(State::PRESENT)))
    }

    fn wait_for_card(&mut self) -> Result<()> {
        self.wait_until(|states| {
            states
                .iter()
                .any(|state| state.event_state().contains(State::PRESENT))
        })
    }

    fn wait_for_removal(&mut self) -> Result<()> {
        self.wait_until(|states| {
            states
                .iter()
                .all(|state| !state.event_state().contains(State::PRESENT))
        })
    }

    fn connect(&mut self, reader: Option<&str>) -> Result<String> {
        self.disconnect();
        if let Some(name) = reader {
            let cname = CString::new(name)
                .map_err(|e| TokenError::ReaderUnavailable(e.to_string()))?;
            self.card = Some(self.connect_reader(&cname)?);
            return Ok(name.to_string());
        }
        let mut last_error = TokenError::TokenUnavailable("no card in any reader".to_string());
        for state in self.reader_states(Duration::ZERO)? {
            if !state.event_state().contains(State::PRESENT) {
                continue;
            }
            match self.connect_reader(state.name()) {
                Ok(card) => {
                    self.card = Some(card);
                    return Ok(state.name().to_string_lossy().into_owned());
                }
                Err(e) => {
                    tracing::debug!("cannot connect to {:?}: {e}", state.name());
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        let card = self
            .card
            .as_ref()
            .ok_or_else(|| TokenError::TokenUnavailable("not connected".to_string()))?;
        let mut buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        let response = card.transmit(apdu, &mut buffer).map_err(map_err)?;
        Ok(response.to_vec())
    }

    fn disconnect(&mut self) {
        if let Some(card) = self.card.take() {
            if let Err((_, e)) = card.disconnect(Disposition::LeaveCard) {
                tracing::warn!("card disconnect failed: {e}");
            }
        }
    }
}
