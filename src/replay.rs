use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::oneshot;

use crate::{
    config::BinaryBodyPolicy,
    queue::{CapturedBody, QueueEntry, QueueStore},
    transport::{Connectivity, OutboundRequest, RequestPayload, Transport, TransportError},
};

/// Result of one `process_queue` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Runtime reports offline; nothing attempted.
    Offline,
    /// Queue was empty; nothing attempted.
    Empty,
    /// Another drain is already in flight; this trigger was dropped.
    AlreadyRunning,
    Completed {
        /// Entries replayed successfully and removed.
        replayed: usize,
        /// Entries the server rejected (non-2xx), left queued.
        rejected: usize,
        /// Marker-bodied entries removed under the discard policy.
        discarded: usize,
        /// True when a transport-level failure stopped the pass early.
        halted: bool,
    },
}

/// Drains the offline queue against the unwrapped transport.
///
/// Strictly oldest-first. A 2xx removes the entry; a non-2xx leaves it
/// queued for the next reconnect and continues, since one rejected
/// entry does not block independent entries behind it. A
/// transport-level failure stops the whole pass: connectivity dropped
/// again and pressing on would fail too, possibly reordering state.
pub struct Replayer {
    queue: QueueStore,
    transport: Arc<dyn Transport>,
    connectivity: Arc<Connectivity>,
    binary_body_policy: BinaryBodyPolicy,
    in_flight: AtomicBool,
}

pub struct ReplayerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ReplayerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Replayer {
    pub fn new(
        queue: QueueStore,
        transport: Arc<dyn Transport>,
        connectivity: Arc<Connectivity>,
        binary_body_policy: BinaryBodyPolicy,
    ) -> Self {
        Self {
            queue,
            transport,
            connectivity,
            binary_body_policy,
            in_flight: AtomicBool::new(false),
        }
    }

    pub async fn process_queue(&self) -> DrainOutcome {
        if !self.connectivity.is_online() {
            return DrainOutcome::Offline;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Both triggers (reconnect event and startup) can fire close
            // together; the second one is dropped.
            return DrainOutcome::AlreadyRunning;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let snapshot = self.queue.list();
        if snapshot.is_empty() {
            return DrainOutcome::Empty;
        }

        let mut replayed = 0;
        let mut rejected = 0;
        let mut discarded = 0;

        for entry in &snapshot {
            match self.replay_entry(entry).await {
                EntryOutcome::Replayed => {
                    self.queue.remove(&entry.id);
                    replayed += 1;
                }
                EntryOutcome::Rejected(status) => {
                    tracing::warn!(
                        id = %entry.id,
                        status,
                        "queued request rejected on replay, will retry on next reconnect"
                    );
                    rejected += 1;
                }
                EntryOutcome::Discarded => {
                    self.queue.remove(&entry.id);
                    discarded += 1;
                }
                EntryOutcome::Halt(reason) => {
                    tracing::warn!(id = %entry.id, "replay halted, transport unreachable: {reason}");
                    return DrainOutcome::Completed {
                        replayed,
                        rejected,
                        discarded,
                        halted: true,
                    };
                }
            }
        }

        tracing::info!(replayed, rejected, discarded, "offline queue drain complete");
        DrainOutcome::Completed {
            replayed,
            rejected,
            discarded,
            halted: false,
        }
    }

    async fn replay_entry(&self, entry: &QueueEntry) -> EntryOutcome {
        let payload = match &entry.item.init.body {
            None => None,
            Some(CapturedBody::Text(text)) => Some(RequestPayload::Text(text.clone())),
            Some(body @ CapturedBody::Marker { .. }) => match self.binary_body_policy {
                BinaryBodyPolicy::Discard => {
                    tracing::warn!(
                        id = %entry.id,
                        ?body,
                        "discarding queued entry whose body was not captured"
                    );
                    return EntryOutcome::Discarded;
                }
                BinaryBodyPolicy::ReplayEmpty => {
                    tracing::warn!(
                        id = %entry.id,
                        ?body,
                        "replaying queued entry with an empty body"
                    );
                    None
                }
            },
        };

        let mut request = OutboundRequest::new(
            entry.item.init.method.clone(),
            entry.item.url.clone(),
        );
        request.headers = entry.item.init.headers.clone();
        request.payload = payload;

        match self.transport.send(request).await {
            Ok(response) if response.is_success() => EntryOutcome::Replayed,
            Ok(response) => EntryOutcome::Rejected(response.status),
            Err(TransportError::Unreachable(reason)) => EntryOutcome::Halt(reason),
            // A request the transport cannot even build will never
            // succeed on a later pass either.
            Err(TransportError::Invalid(reason)) => {
                tracing::warn!(id = %entry.id, "dropping malformed queued request: {reason}");
                EntryOutcome::Discarded
            }
        }
    }

    /// Runs the trigger loop: one opportunistic drain at startup when
    /// already online, then a drain on every offline-to-online
    /// transition, until shut down.
    pub fn spawn(self: Arc<Self>) -> ReplayerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let mut connectivity_rx = self.connectivity.subscribe();

        let join = tokio::spawn(async move {
            if self.connectivity.is_online() {
                let outcome = self.process_queue().await;
                tracing::debug!(?outcome, "startup drain");
            }

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    changed = connectivity_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *connectivity_rx.borrow_and_update() {
                            let outcome = self.process_queue().await;
                            tracing::debug!(?outcome, "reconnect drain");
                        }
                    }
                }
            }
        });

        ReplayerHandle { shutdown_tx, join }
    }
}

enum EntryOutcome {
    Replayed,
    Rejected(u16),
    Discarded,
    Halt(String),
}
