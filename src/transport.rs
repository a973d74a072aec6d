//! Request/response exchange with the relying-party service.
//!
//! [HttpTransport] posts each request as a CBOR body and decodes the CBOR body of the
//! reply. Cookies are kept between requests so the service can correlate the exchange.
use crate::cbor::{self, CborError};
use crate::definitions::messages::{RequestMessage, ResponseMessage};
use std::time::Duration;
use url::Url;

const CONTENT_TYPE: &str = "application/cbor";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("service returned HTTP status {status}")]
    Network { status: u16 },
    #[error("service not found (HTTP 404)")]
    ServiceUnreachable,
    #[error("malformed response from service")]
    Deserialization(#[source] CborError),
    #[error("unable to encode request")]
    Encoding(#[source] CborError),
    #[error("request to service failed")]
    Request(#[from] reqwest::Error),
}

pub trait Transport {
    fn send(&mut self, request: &RequestMessage) -> Result<ResponseMessage, TransportError>;

    /// TLS session identifier of the channel, when the transport can observe it.
    fn session_id(&self) -> Option<Vec<u8>> {
        None
    }

    /// DER certificate the service presented, when the transport can observe it.
    fn server_certificate(&self) -> Option<Vec<u8>> {
        None
    }
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
    service: Url,
    server_certificate: Option<Vec<u8>>,
}

impl HttpTransport {
    pub fn new(service: Url) -> Result<Self, TransportError> {
        Self::with_timeout(service, Duration::from_secs(30))
    }

    pub fn with_timeout(service: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .tls_info(true)
            .build()?;
        Ok(Self {
            client,
            service,
            server_certificate: None,
        })
    }

    pub fn service(&self) -> &Url {
        &self.service
    }
}

impl Transport for HttpTransport {
    fn send(&mut self, request: &RequestMessage) -> Result<ResponseMessage, TransportError> {
        let body = cbor::to_vec(request).map_err(TransportError::Encoding)?;
        tracing::debug!(kind = %request.kind(), bytes = body.len(), "sending request");
        let response = self
            .client
            .post(self.service.clone())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()?;

        if let Some(info) = response.extensions().get::<reqwest::tls::TlsInfo>() {
            if let Some(certificate) = info.peer_certificate() {
                self.server_certificate = Some(certificate.to_vec());
            }
        }

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TransportError::ServiceUnreachable);
        }
        if !status.is_success() {
            return Err(TransportError::Network {
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes()?;
        let message: ResponseMessage =
            cbor::from_slice(&bytes).map_err(TransportError::Deserialization)?;
        tracing::debug!(kind = %message.kind(), "received response");
        Ok(message)
    }

    fn server_certificate(&self) -> Option<Vec<u8>> {
        self.server_certificate.clone()
    }
}
