use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Error};
use clap::Parser;
use eid_client::controller::{Controller, ControllerConfig};
use eid_client::ports::{HostContext, MessageId, Status, StatusSink, UserPrompt};
use eid_client::token::{Backends, TokenBackend};
use eid_client::transport::HttpTransport;
use tracing_subscriber::EnvFilter;
use url::Url;

const BACKENDS_HELP: &str = "\
Token backends are cargo features:
  pcsc    direct card access over PC/SC (default)
  pkcs11  the eID middleware's PKCS#11 module, see --pkcs11-module
A build with neither feature fails every ceremony for lack of middleware.";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = BACKENDS_HELP)]
struct Args {
    /// URL of the page on whose behalf the ceremony runs.
    #[arg(long)]
    origin: Url,
    /// Service endpoint, absolute or relative to the origin.
    #[arg(long, env = "EID_SERVICE")]
    service: String,
    /// Preferred language announced to the service.
    #[arg(long)]
    language: Option<String>,
    /// Host parameter passed to the ceremony, e.g. `RemoveCardCallback=onRemove`.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// eID middleware PKCS#11 module.
    #[arg(long, env = "EID_PKCS11_MODULE")]
    pkcs11_module: Option<PathBuf>,
    /// Files to digest when the service asks for a files digest.
    #[arg(long = "file")]
    files: Vec<PathBuf>,
    /// Attempts for card operations that find the card busy.
    #[arg(long, default_value_t = 3)]
    retries: u32,
    /// HTTP timeout in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    /// Print the detail log and debug output.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{s}`")),
    }
}

fn main() -> Result<ExitCode, Error> {
    let args = Args::parse();
    let default_filter = if args.verbose {
        "eid_client=debug"
    } else {
        "eid_client=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(io::stderr)
        .init();

    let service = args
        .origin
        .join(&args.service)
        .with_context(|| format!("invalid service location {}", args.service))?;
    let transport = HttpTransport::with_timeout(service, Duration::from_secs(args.timeout))
        .context("could not set up the HTTP client")?;
    let backends = backends(args.pkcs11_module.clone());
    if backends.is_empty() {
        tracing::warn!("no token backend available");
    }

    let config = ControllerConfig {
        language: args.language.clone(),
        retry_attempts: args.retries,
        ..Default::default()
    };
    let host = CliHost {
        origin: args.origin.clone(),
        params: args.params.iter().cloned().collect(),
    };
    let mut controller = Controller::new(
        transport,
        backends,
        Terminal::new(args.verbose),
        host,
        TerminalPrompt { files: args.files },
        config,
    );
    let result = controller.run();
    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn backends(pkcs11_module: Option<PathBuf>) -> Backends {
    let pkcs11: Option<Box<dyn TokenBackend>> = match pkcs11_module {
        #[cfg(feature = "pkcs11")]
        Some(module) => Some(Box::new(eid_client::token::pkcs11::Pkcs11Backend::new(
            module,
        ))),
        #[cfg(not(feature = "pkcs11"))]
        Some(module) => {
            tracing::warn!(
                "ignoring {}: built without PKCS#11 support",
                module.display()
            );
            None
        }
        None => None,
    };

    #[cfg(feature = "pcsc")]
    let native: Option<Box<dyn TokenBackend>> =
        match eid_client::token::pcsc::PcscChannel::establish() {
            Ok(channel) => Some(Box::new(eid_client::token::eid::EidCard::new(
                channel,
                pins::TerminalPins,
            ))),
            Err(e) => {
                tracing::warn!("PC/SC unavailable: {e}");
                None
            }
        };
    #[cfg(not(feature = "pcsc"))]
    let native: Option<Box<dyn TokenBackend>> = None;

    Backends::new(pkcs11, native)
}

/// Read one line from stdin after printing `question`. `None` on end of input.
fn ask(question: &str) -> Option<String> {
    eprint!("{question} ");
    let _ = io::stderr().flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

struct Terminal {
    verbose: bool,
    shown_max: i32,
}

impl Terminal {
    fn new(verbose: bool) -> Terminal {
        Terminal {
            verbose,
            shown_max: -1,
        }
    }
}

impl StatusSink for Terminal {
    fn set_status(&mut self, status: Status, message: MessageId) {
        match status {
            Status::Normal => eprintln!("{message}"),
            Status::Error => eprintln!("error: {message}"),
        }
    }

    fn add_detail(&mut self, detail: &str) {
        if self.verbose {
            eprintln!("  {detail}");
        }
    }

    fn report_progress(&mut self, max: i32, current: i32) {
        if max < 0 {
            if self.shown_max >= 0 {
                eprintln!();
            }
            self.shown_max = -1;
            return;
        }
        self.shown_max = max;
        eprint!("\r[{current}/{max}]");
        let _ = io::stderr().flush();
    }
}

struct CliHost {
    origin: Url,
    params: BTreeMap<String, String>,
}

impl HostContext for CliHost {
    fn document_origin(&self) -> &Url {
        &self.origin
    }

    fn parameter(&self, name: &str) -> Option<String> {
        self.params.get(name).cloned()
    }

    fn on_completed(&mut self) {
        tracing::info!("ceremony completed for {}", self.origin);
    }

    fn invoke_callback(&mut self, name: &str) {
        println!("{name}");
    }
}

struct TerminalPrompt {
    files: Vec<PathBuf>,
}

impl UserPrompt for TerminalPrompt {
    fn confirm(&mut self, message: &str) -> bool {
        matches!(
            ask(&format!("{message} [y/N]")).as_deref().map(str::trim),
            Some("y" | "Y" | "yes")
        )
    }

    fn warn(&mut self, message: &str) {
        eprintln!("warning: {message}");
    }

    fn privacy_consent(
        &mut self,
        include_address: bool,
        include_photo: bool,
        usage: Option<&str>,
    ) -> bool {
        let mut released = vec!["identity"];
        if include_address {
            released.push("address");
        }
        if include_photo {
            released.push("photo");
        }
        let mut question = format!("Release your eID {} data?", released.join(", "));
        if let Some(usage) = usage {
            question.push_str(&format!("\nUsage: {usage}"));
        }
        self.confirm(&question)
    }

    fn select_files(&mut self) -> Option<Vec<PathBuf>> {
        if !self.files.is_empty() {
            return Some(std::mem::take(&mut self.files));
        }
        let files: Vec<PathBuf> = ask("Files to digest (space separated, empty to cancel):")?
            .split_whitespace()
            .map(PathBuf::from)
            .collect();
        (!files.is_empty()).then_some(files)
    }
}

#[cfg(feature = "pcsc")]
mod pins {
    use super::ask;
    use eid_client::token::eid::PinEntry;
    use zeroize::Zeroizing;

    pub struct TerminalPins;

    fn prompt(what: &str, retries_left: Option<u8>) -> Option<Zeroizing<String>> {
        let question = match retries_left {
            Some(n) => format!("{what} ({n} attempts left):"),
            None => format!("{what}:"),
        };
        ask(&question).map(Zeroizing::new)
    }

    impl PinEntry for TerminalPins {
        fn pin(&mut self, retries_left: Option<u8>) -> Option<Zeroizing<String>> {
            prompt("eID PIN", retries_left)
        }

        fn pin_change(
            &mut self,
            retries_left: Option<u8>,
        ) -> Option<(Zeroizing<String>, Zeroizing<String>)> {
            let current = prompt("Current PIN", retries_left)?;
            let new = prompt("New PIN", None)?;
            let again = prompt("New PIN again", None)?;
            if *new != *again {
                eprintln!("PINs do not match");
                return None;
            }
            Some((current, new))
        }

        fn puk(&mut self, retries_left: Option<u8>) -> Option<Zeroizing<String>> {
            prompt("PUK", retries_left)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn params_split_on_first_equals() {
        assert_eq!(
            parse_param("RemoveCardCallback=a=b").unwrap(),
            ("RemoveCardCallback".to_string(), "a=b".to_string())
        );
        assert!(parse_param("=x").is_err());
        assert!(parse_param("Language").is_err());
    }

    #[test]
    fn help_lists_backend_features() {
        let help = Args::command().render_help().to_string();
        assert!(help.contains("pcsc"));
        assert!(help.contains("pkcs11"));
    }

    #[test]
    fn service_resolves_against_origin() {
        let args = Args::parse_from([
            "eid-client",
            "--origin",
            "https://relying.party/login/",
            "--service",
            "../eid-service",
            "--param",
            "Language=nl",
        ]);
        assert_eq!(
            args.origin.join(&args.service).unwrap().as_str(),
            "https://relying.party/eid-service"
        );
        assert_eq!(args.params, vec![("Language".into(), "nl".into())]);
    }
}
