use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::{
    queue::{CapturedBody, QueueStore, QueuedRequest, RequestInit},
    transport::{
        encode_form, Connectivity, OutboundRequest, RequestPayload, Transport, TransportError,
        TransportResponse,
    },
};

pub const QUEUED_RESPONSE_STATUS: u16 = 202;

#[derive(Debug, Serialize)]
struct QueuedResponseBody<'a> {
    queued: bool,
    id: &'a str,
}

/// Capture proxy sitting in front of the real transport.
///
/// Online traffic passes through unmodified. Offline reads fail fast,
/// offline mutations matching the allow-list are persisted to the
/// queue and acknowledged with a synthetic 202 so callers can proceed
/// optimistically. Holding this as a capability object (instead of
/// patching an ambient global) makes double-wrapping impossible and
/// keeps the unwrapped transport reachable for the replayer.
pub struct CaptureClient {
    inner: Arc<dyn Transport>,
    queue: QueueStore,
    connectivity: Arc<Connectivity>,
    queue_only_for: Vec<String>,
}

impl CaptureClient {
    pub fn new(
        inner: Arc<dyn Transport>,
        queue: QueueStore,
        connectivity: Arc<Connectivity>,
        queue_only_for: Vec<String>,
    ) -> Self {
        Self {
            inner,
            queue,
            connectivity,
            queue_only_for,
        }
    }

    /// The unwrapped transport, for the replayer's exclusive use.
    /// Replaying through the proxy would re-queue its own attempts
    /// whenever connectivity drops mid-drain.
    pub fn inner(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner)
    }

    pub fn queue(&self) -> QueueStore {
        self.queue.clone()
    }

    fn allow_listed(&self, url: &str) -> bool {
        self.queue_only_for.is_empty()
            || self
                .queue_only_for
                .iter()
                .any(|needle| url.contains(needle.as_str()))
    }

    fn capture(&self, request: OutboundRequest) -> TransportResponse {
        let body = request.payload.as_ref().map(serialize_payload);
        let entry = self.queue.enqueue(QueuedRequest {
            url: request.url,
            init: RequestInit {
                method: request.method.to_ascii_uppercase(),
                headers: request.headers,
                body,
            },
        });
        tracing::info!(id = %entry.id, url = %entry.item.url, "queued offline mutation");

        synthetic_queued_response(&entry.id)
    }
}

#[async_trait]
impl Transport for CaptureClient {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, TransportError> {
        if self.connectivity.is_online() {
            return self.inner.send(request).await;
        }

        if request.is_read() {
            // Reads are never queued; a deferred read response would be
            // stale or undefined. The service-worker cache layer covers
            // offline reads on its own.
            return Err(TransportError::Unreachable(
                "offline; read requests are not queued".to_owned(),
            ));
        }

        if !self.allow_listed(&request.url) {
            return Err(TransportError::Unreachable(
                "offline; request outside queue allow-list".to_owned(),
            ));
        }

        Ok(self.capture(request))
    }
}

/// Best-effort body serialization for the queue. Binary payloads become
/// an explicit marker, never corrupted text; a serialization failure
/// becomes the unreadable marker rather than aborting the capture.
fn serialize_payload(payload: &RequestPayload) -> CapturedBody {
    match payload {
        RequestPayload::Text(text) => CapturedBody::Text(text.clone()),
        RequestPayload::Form(fields) => CapturedBody::Text(encode_form(fields)),
        RequestPayload::Multipart(fields) => {
            let object: std::collections::BTreeMap<&str, &str> = fields
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect();
            match serde_json::to_string(&object) {
                Ok(json) => CapturedBody::Text(json),
                Err(err) => {
                    tracing::warn!("flatten multipart body failed: {err}");
                    CapturedBody::unreadable_marker()
                }
            }
        }
        RequestPayload::Bytes(_) => CapturedBody::binary_marker(),
    }
}

fn synthetic_queued_response(id: &str) -> TransportResponse {
    let body = serde_json::to_vec(&QueuedResponseBody { queued: true, id })
        .unwrap_or_else(|_| br#"{"queued":true}"#.to_vec());
    TransportResponse {
        status: QUEUED_RESPONSE_STATUS,
        headers: vec![("content-type".to_owned(), "application/json".to_owned())],
        body: Bytes::from(body),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::CaptureClient;
    use crate::{
        queue::{CapturedBody, QueueStore},
        storage::MemoryBlobStore,
        transport::{
            Connectivity, OutboundRequest, RequestPayload, Transport, TransportError,
            TransportResponse,
        },
    };

    /// Inner transport that records what reaches the real network.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundRequest>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            request: OutboundRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.sent.lock().unwrap().push(request);
            Ok(TransportResponse {
                status: 200,
                headers: Vec::new(),
                body: Bytes::from_static(b"live"),
            })
        }
    }

    fn client(
        online: bool,
        queue_only_for: Vec<String>,
    ) -> (CaptureClient, Arc<RecordingTransport>, Arc<Connectivity>) {
        let inner = Arc::new(RecordingTransport::default());
        let connectivity = Connectivity::new(online);
        let queue = QueueStore::new(Arc::new(MemoryBlobStore::new()));
        let client = CaptureClient::new(
            Arc::clone(&inner) as Arc<dyn Transport>,
            queue,
            Arc::clone(&connectivity),
            queue_only_for,
        );
        (client, inner, connectivity)
    }

    fn post(url: &str) -> OutboundRequest {
        OutboundRequest::new("POST", url)
            .header("content-type", "application/json")
            .payload(RequestPayload::Text(r#"{"term":"calor"}"#.to_owned()))
    }

    #[tokio::test]
    async fn online_requests_pass_through_untouched() {
        let (client, inner, _) = client(true, Vec::new());

        let response = client.send(post("https://api.example/terms")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"live");
        assert_eq!(inner.sent.lock().unwrap().len(), 1);
        assert!(client.queue().is_empty());
    }

    #[tokio::test]
    async fn offline_reads_fail_without_queueing() {
        let (client, inner, _) = client(false, Vec::new());

        for method in ["GET", "HEAD"] {
            let err = client
                .send(OutboundRequest::new(method, "https://api.example/terms"))
                .await
                .unwrap_err();
            assert!(matches!(err, TransportError::Unreachable(_)));
        }

        assert!(inner.sent.lock().unwrap().is_empty());
        assert!(client.queue().is_empty());
    }

    #[tokio::test]
    async fn offline_mutation_is_queued_and_acknowledged_with_202() {
        let (client, inner, _) = client(false, Vec::new());

        let response = client.send(post("https://api.example/terms")).await.unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(
            response.headers,
            vec![("content-type".to_owned(), "application/json".to_owned())]
        );

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["queued"], serde_json::Value::Bool(true));
        let id = body["id"].as_str().unwrap();

        let entries = client.queue().list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].item.init.method, "POST");
        assert_eq!(
            entries[0].item.init.headers.get("content-type").unwrap(),
            "application/json"
        );
        assert!(inner.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn allow_list_rejects_urls_outside_the_remote_endpoint() {
        let (client, _, _) = client(false, vec!["/rest/v1/".to_owned()]);

        let err = client
            .send(post("https://elsewhere.example/upload"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert!(client.queue().is_empty());

        let response = client
            .send(post("https://api.example/rest/v1/terms"))
            .await
            .unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(client.queue().len(), 1);
    }

    #[tokio::test]
    async fn body_serialization_covers_every_payload_variant() {
        let (client, _, _) = client(false, Vec::new());

        let cases: Vec<(RequestPayload, CapturedBody)> = vec![
            (
                RequestPayload::Text("plain".to_owned()),
                CapturedBody::Text("plain".to_owned()),
            ),
            (
                RequestPayload::Form(vec![("a".to_owned(), "b c".to_owned())]),
                CapturedBody::Text("a=b+c".to_owned()),
            ),
            (
                RequestPayload::Multipart(vec![("name".to_owned(), "calor".to_owned())]),
                CapturedBody::Text(r#"{"name":"calor"}"#.to_owned()),
            ),
            (
                RequestPayload::Bytes(Bytes::from_static(&[0x80, 0xff])),
                CapturedBody::binary_marker(),
            ),
        ];

        for (payload, _) in &cases {
            client
                .send(
                    OutboundRequest::new("POST", "https://api.example/terms")
                        .payload(payload.clone()),
                )
                .await
                .unwrap();
        }

        let entries = client.queue().list();
        assert_eq!(entries.len(), cases.len());
        for (entry, (_, expected)) in entries.iter().zip(&cases) {
            assert_eq!(entry.item.init.body.as_ref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn queue_count_increases_by_exactly_one_per_capture() {
        let (client, _, _) = client(false, Vec::new());

        for expected in 1..=3 {
            client.send(post("https://api.example/terms")).await.unwrap();
            assert_eq!(client.queue().len(), expected);
        }
    }
}
