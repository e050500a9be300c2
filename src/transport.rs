use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::watch;

/// An outgoing request as the application hands it to the client seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Option<RequestPayload>,
}

impl OutboundRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn payload(mut self, payload: RequestPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_read(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET") || self.method.eq_ignore_ascii_case("HEAD")
    }
}

/// Request body variants the capture layer knows how to serialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    /// A plain text body, sent as-is.
    Text(String),
    /// Form fields, sent percent-encoded as `k=v&...`.
    Form(Vec<(String, String)>),
    /// Multipart form fields, flattened to a JSON object when captured.
    Multipart(Vec<(String, String)>),
    /// Raw bytes. Sent as-is when online, never captured offline.
    Bytes(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport could not reach the server at all; no response
    /// exists. The replayer halts on this.
    Unreachable(String),
    /// The request itself is malformed (bad URL, bad header).
    Invalid(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(reason) => write!(f, "network unreachable: {reason}"),
            Self::Invalid(reason) => write!(f, "invalid request: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The single seam every network call flows through. The capture proxy
/// and the real HTTP client are both implementations, so callers hold a
/// capability object instead of an ambient patched global.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError>;
}

/// Real network transport over the hyper legacy client.
pub struct HttpTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        let uri: Uri = request
            .url
            .parse()
            .map_err(|err| TransportError::Invalid(format!("parse url {}: {err}", request.url)))?;
        let method: Method = request
            .method
            .parse()
            .map_err(|err| TransportError::Invalid(format!("parse method: {err}")))?;

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let body = match request.payload {
            None => Bytes::new(),
            Some(RequestPayload::Text(text)) => Bytes::from(text),
            Some(RequestPayload::Form(fields)) => Bytes::from(encode_form(&fields)),
            Some(RequestPayload::Multipart(fields)) => {
                // Flattened multipart goes out as a JSON object body.
                let object: BTreeMap<&str, &str> = fields
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str()))
                    .collect();
                let json = serde_json::to_string(&object)
                    .map_err(|err| TransportError::Invalid(format!("encode multipart: {err}")))?;
                Bytes::from(json)
            }
            Some(RequestPayload::Bytes(bytes)) => bytes,
        };

        let req = builder
            .body(Full::new(body))
            .map_err(|err| TransportError::Invalid(format!("build request: {err}")))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| TransportError::Unreachable(format!("read response body: {err}")))?
            .to_bytes();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// Percent-encodes form fields into `application/x-www-form-urlencoded`.
pub fn encode_form(fields: &[(String, String)]) -> String {
    let mut encoded = String::new();
    for (idx, (name, value)) in fields.iter().enumerate() {
        if idx > 0 {
            encoded.push('&');
        }
        encode_form_component(&mut encoded, name);
        encoded.push('=');
        encode_form_component(&mut encoded, value);
    }
    encoded
}

fn encode_form_component(out: &mut String, value: &str) {
    use std::fmt::Write as _;

    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'*' => {
                out.push(char::from(byte));
            }
            b' ' => out.push('+'),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
}

/// Shared online/offline state with change notification.
///
/// Mirrors the runtime's connectivity events: components query
/// `is_online` for decisions and subscribe for reconnect triggers.
#[derive(Debug)]
pub struct Connectivity {
    online: AtomicBool,
    notify: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Arc<Self> {
        let (notify, _) = watch::channel(initially_online);
        Arc::new(Self {
            online: AtomicBool::new(initially_online),
            notify,
        })
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        let _ = self.notify.send(online);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }
}
