use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::Context as _;
use bytes::Bytes;

use crate::{
    cache::{Cache, CacheKey, CacheSet, StoredResponse},
    transport::{OutboundRequest, Transport, TransportResponse},
};

/// Lifecycle of the installable worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninstalled,
    Installing,
    Installed,
    Activating,
    Activated,
}

/// Explicit control message to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Force-activate a waiting new version immediately instead of
    /// waiting for old clients to close.
    SkipWaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// A full-page load.
    Navigate,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDestination {
    Image,
    Other,
}

/// An intercepted resource request, as seen at the browser network
/// layer. Independent of the main-thread capture proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub mode: FetchMode,
    pub destination: FetchDestination,
    pub accept: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_owned(),
            url: url.into(),
            mode: FetchMode::Other,
            destination: FetchDestination::Other,
            accept: None,
        }
    }

    pub fn navigation(url: impl Into<String>) -> Self {
        Self {
            mode: FetchMode::Navigate,
            accept: Some("text/html".to_owned()),
            ..Self::get(url)
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self {
            destination: FetchDestination::Image,
            ..Self::get(url)
        }
    }

    pub fn accepts_html(&self) -> bool {
        self.accept
            .as_deref()
            .is_some_and(|accept| accept.contains("text/html"))
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey {
            method: self.method.to_ascii_uppercase(),
            url: self.url.clone(),
        }
    }
}

/// The worker-context cache controller.
///
/// Runs in its own execution context; shares nothing with the capture
/// proxy or the queue. Interception covers GET traffic only, and no
/// failure crosses into the caller: every path resolves to a response.
///
/// The host drives the lifecycle by awaiting `install` and `activate`,
/// which is the `waitUntil` contract: the context must not be torn
/// down before the awaited future completes.
pub struct CacheController {
    caches: CacheSet,
    transport: Arc<dyn Transport>,
    cache_name: String,
    offline_fallback_url: String,
    max_entries: usize,
    state: Mutex<LifecycleState>,
    skip_waiting: AtomicBool,
    clients_claimed: AtomicBool,
}

impl CacheController {
    pub fn new(
        caches: CacheSet,
        transport: Arc<dyn Transport>,
        cache_name: impl Into<String>,
        offline_fallback_url: impl Into<String>,
        max_entries: usize,
    ) -> Self {
        Self {
            caches,
            transport,
            cache_name: cache_name.into(),
            offline_fallback_url: offline_fallback_url.into(),
            max_entries,
            state: Mutex::new(LifecycleState::Uninstalled),
            skip_waiting: AtomicBool::new(false),
            clients_claimed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> anyhow::Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != from {
            anyhow::bail!("lifecycle transition to {to:?} requires {from:?}, worker is {:?}", *state);
        }
        *state = to;
        Ok(())
    }

    /// Install: pre-populate the versioned cache with the offline
    /// fallback page and signal immediate takeover of any previously
    /// installed version.
    pub async fn install(&self) -> anyhow::Result<()> {
        self.transition(LifecycleState::Uninstalled, LifecycleState::Installing)?;
        self.skip_waiting.store(true, Ordering::SeqCst);

        let precache = async {
            let cache = self.caches.open(&self.cache_name);
            let response = self
                .fetch_over_network(&FetchRequest::get(self.offline_fallback_url.as_str()))
                .await
                .map_err(|err| anyhow::anyhow!("fetch offline fallback: {err}"))?;
            if !response.is_ok() {
                anyhow::bail!(
                    "offline fallback fetch returned status {}",
                    response.status
                );
            }
            cache.put(CacheKey::get(self.offline_fallback_url.as_str()), response);
            Ok(())
        };

        match precache.await.context("pre-cache offline fallback") {
            Ok(()) => self.transition(LifecycleState::Installing, LifecycleState::Installed),
            Err(err) => {
                // A failed install leaves the worker uninstalled, like a
                // rejected install-event waitUntil.
                let _ = self.transition(LifecycleState::Installing, LifecycleState::Uninstalled);
                Err(err)
            }
        }
    }

    /// Activate: garbage-collect every cache generation other than the
    /// current one and take control of open clients immediately.
    pub async fn activate(&self) -> anyhow::Result<()> {
        self.transition(LifecycleState::Installed, LifecycleState::Activating)?;

        for name in self.caches.names() {
            if name != self.cache_name {
                self.caches.delete(&name);
                tracing::debug!(cache = %name, "deleted stale cache generation");
            }
        }
        self.clients_claimed.store(true, Ordering::SeqCst);

        self.transition(LifecycleState::Activating, LifecycleState::Activated)
    }

    pub fn handle_message(&self, command: WorkerCommand) {
        match command {
            WorkerCommand::SkipWaiting => {
                self.skip_waiting.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn is_skipping_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    pub fn has_claimed_clients(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    /// Intercepts one resource request. `None` means the controller
    /// does not intercept it at all (non-GET traffic belongs to the
    /// queue layer, layered independently).
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Option<StoredResponse> {
        if !request.method.eq_ignore_ascii_case("GET") {
            return None;
        }

        let response = match request.mode {
            FetchMode::Navigate => self.handle_navigation(request).await,
            FetchMode::Other => self.handle_resource(request).await,
        };
        Some(response)
    }

    async fn handle_navigation(&self, request: &FetchRequest) -> StoredResponse {
        let cache = self.caches.open(&self.cache_name);
        match self.fetch_over_network(request).await {
            Ok(response) => {
                // Best-effort snapshot for later offline navigations.
                if response.is_ok() {
                    cache.put(request.cache_key(), response.clone());
                }
                response
            }
            Err(err) => {
                tracing::debug!(url = %request.url, "navigation fetch failed: {err}");
                cache
                    .lookup(&request.cache_key())
                    .or_else(|| cache.lookup(&CacheKey::get(self.offline_fallback_url.as_str())))
                    .unwrap_or_else(StoredResponse::network_error)
            }
        }
    }

    async fn handle_resource(&self, request: &FetchRequest) -> StoredResponse {
        let cache = self.caches.open(&self.cache_name);
        match self.fetch_over_network(request).await {
            Ok(response) => {
                if response.is_ok() {
                    cache.put(request.cache_key(), response.clone());
                    self.spawn_trim(cache);
                }
                response
            }
            Err(err) => {
                tracing::debug!(url = %request.url, "resource fetch failed: {err}");
                if let Some(cached) = cache.lookup(&request.cache_key()) {
                    return cached;
                }
                self.offline_fallback_for(request, &cache)
            }
        }
    }

    /// Trims in the background; the live response is returned without
    /// waiting for eviction to finish.
    fn spawn_trim(&self, cache: Cache) {
        let max_entries = self.max_entries;
        let cache_name = self.cache_name.clone();
        tokio::spawn(async move {
            let evicted = cache.trim(max_entries);
            if evicted > 0 {
                tracing::debug!(cache = %cache_name, evicted, "trimmed runtime cache");
            }
        });
    }

    fn offline_fallback_for(&self, request: &FetchRequest, cache: &Cache) -> StoredResponse {
        if request.destination == FetchDestination::Image {
            // A small synthetic error beats a broken-image flash that
            // cascades into further errors.
            return StoredResponse {
                status: 503,
                headers: Vec::new(),
                body: Bytes::new(),
            };
        }
        if request.accepts_html() {
            if let Some(fallback) = cache.lookup(&CacheKey::get(self.offline_fallback_url.as_str())) {
                return fallback;
            }
        }
        StoredResponse {
            status: 503,
            headers: vec![("content-type".to_owned(), "application/json".to_owned())],
            body: Bytes::from_static(br#"{"error":"offline"}"#),
        }
    }

    async fn fetch_over_network(
        &self,
        request: &FetchRequest,
    ) -> Result<StoredResponse, crate::transport::TransportError> {
        let mut outbound = OutboundRequest::new(request.method.clone(), request.url.clone());
        if let Some(accept) = &request.accept {
            outbound = outbound.header("accept", accept.clone());
        }
        self.transport.send(outbound).await.map(store_response)
    }
}

fn store_response(response: TransportResponse) -> StoredResponse {
    StoredResponse {
        status: response.status,
        headers: response.headers,
        body: response.body,
    }
}
