//! Description of the machine the client runs on, as reported to the service.
use crate::definitions::messages::RequestMessage;
use crate::ports::{parameter, HostContext};
use sysinfo::System;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub client_version: String,
    pub os_name: String,
    pub os_version: String,
    pub os_arch: String,
}

impl Environment {
    pub fn detect() -> Environment {
        Environment {
            client_version: CLIENT_VERSION.to_string(),
            os_name: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            os_version: System::os_version().unwrap_or_default(),
            os_arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Lines written to the detail log when a ceremony starts.
    pub fn details(&self, host: &dyn HostContext) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        vec![
            format!("eID client version: {}", self.client_version),
            format!("OS: {} {} ({})", self.os_name, self.os_version, self.os_arch),
            format!("document origin: {}", host.document_origin()),
            format!(
                "current time: {}",
                now.format(&Rfc3339).unwrap_or_else(|_| now.to_string())
            ),
        ]
    }

    pub fn into_request(self, host: &dyn HostContext, reader_list: Vec<String>) -> RequestMessage {
        RequestMessage::ClientEnvironment {
            client_version: self.client_version,
            os_name: self.os_name,
            os_version: self.os_version,
            os_arch: self.os_arch,
            reader_list,
            navigator_app_name: host.parameter(parameter::NAVIGATOR_APP_NAME),
            navigator_app_version: host.parameter(parameter::NAVIGATOR_APP_VERSION),
            navigator_user_agent: host.parameter(parameter::NAVIGATOR_USER_AGENT),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use url::Url;

    struct Host(Url, HashMap<&'static str, String>);

    impl HostContext for Host {
        fn document_origin(&self) -> &Url {
            &self.0
        }

        fn parameter(&self, name: &str) -> Option<String> {
            self.1.get(name).cloned()
        }

        fn on_completed(&mut self) {}

        fn invoke_callback(&mut self, _: &str) {}
    }

    #[test]
    fn client_environment_carries_navigator_parameters() {
        let host = Host(
            Url::parse("https://relying.party/login").unwrap(),
            HashMap::from([(parameter::NAVIGATOR_USER_AGENT, "Mozilla/5.0".to_string())]),
        );
        let environment = Environment::detect();
        assert_eq!(environment.client_version, CLIENT_VERSION);
        match environment.into_request(&host, vec!["ACS ACR38U".into()]) {
            RequestMessage::ClientEnvironment {
                reader_list,
                navigator_user_agent,
                navigator_app_name,
                ..
            } => {
                assert_eq!(reader_list, vec!["ACS ACR38U".to_string()]);
                assert_eq!(navigator_user_agent.as_deref(), Some("Mozilla/5.0"));
                assert_eq!(navigator_app_name, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn details_name_the_origin() {
        let host = Host(Url::parse("https://relying.party/").unwrap(), HashMap::new());
        let details = Environment::detect().details(&host);
        assert_eq!(details.len(), 4);
        assert_eq!(details[2], "document origin: https://relying.party/");
    }
}
