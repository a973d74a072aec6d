//! Traits through which the controller reaches its embedding environment.
//!
//! None of these are implemented by the library itself apart from test doubles; the
//! binary wires them to a terminal.
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use url::Url;

/// Severity of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normal,
    Error,
}

/// Status messages shown to the user. [std::fmt::Display] gives the default English text;
/// a sink may localize by id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum MessageId {
    #[strum(to_string = "Connecting to the service...")]
    Connecting,
    #[strum(to_string = "Detecting eID card...")]
    DetectingCard,
    #[strum(to_string = "Please connect a card reader.")]
    ConnectReader,
    #[strum(to_string = "Please insert your eID card.")]
    InsertCard,
    #[strum(to_string = "Please remove your eID card.")]
    RemoveCard,
    #[strum(to_string = "Kiosk mode: waiting for cards...")]
    Kiosk,
    #[strum(to_string = "Please select the files to sign.")]
    SelectFiles,
    #[strum(to_string = "Calculating file digests...")]
    DigestingFiles,
    #[strum(to_string = "Signing...")]
    Signing,
    #[strum(to_string = "Authenticating...")]
    Authenticating,
    #[strum(to_string = "Reading identity data...")]
    ReadingIdentity,
    #[strum(to_string = "Transmitting identity data...")]
    TransmittingIdentity,
    #[strum(to_string = "Card administration...")]
    Administration,
    #[strum(to_string = "Done.")]
    Done,
    #[strum(to_string = "Aborted.")]
    Aborted,
    #[strum(to_string = "Security error.")]
    SecurityError,
    #[strum(to_string = "No eID middleware found.")]
    NoMiddlewareError,
    #[strum(to_string = "Incorrect PIN.")]
    PinIncorrect,
    #[strum(to_string = "PIN blocked.")]
    PinBlocked,
    #[strum(to_string = "Card error.")]
    CardError,
    #[strum(to_string = "An error occurred.")]
    GenericError,
}

/// Status line, detail log and progress bar.
pub trait StatusSink {
    fn set_status(&mut self, status: Status, message: MessageId);

    fn add_detail(&mut self, detail: &str);

    /// `max == -1` hides the progress indicator.
    fn report_progress(&mut self, max: i32, current: i32);
}

pub mod parameter {
    pub const LANGUAGE: &str = "Language";
    pub const NAVIGATOR_APP_NAME: &str = "NavigatorAppName";
    pub const NAVIGATOR_APP_VERSION: &str = "NavigatorAppVersion";
    pub const NAVIGATOR_USER_AGENT: &str = "NavigatorUserAgent";
    /// Name of the host callback invoked each time a card is removed in kiosk mode.
    pub const REMOVE_CARD_CALLBACK: &str = "RemoveCardCallback";
}

/// The page or application hosting the ceremony.
pub trait HostContext {
    /// Origin of the document that launched the ceremony.
    fn document_origin(&self) -> &Url;

    fn parameter(&self, name: &str) -> Option<String>;

    fn on_completed(&mut self);

    fn invoke_callback(&mut self, name: &str);

    fn resolve_host(&self, host: &str) -> Option<IpAddr> {
        (host, 0)
            .to_socket_addrs()
            .ok()?
            .next()
            .map(|address| address.ip())
    }
}

/// Questions put to the user.
pub trait UserPrompt {
    fn confirm(&mut self, message: &str) -> bool;

    fn warn(&mut self, message: &str);

    fn privacy_consent(
        &mut self,
        include_address: bool,
        include_photo: bool,
        usage: Option<&str>,
    ) -> bool;

    /// `None` when the user cancels the selection.
    fn select_files(&mut self) -> Option<Vec<PathBuf>>;
}
