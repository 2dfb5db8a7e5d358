//! Subscription multiplexer implementation
//!
//! Keeps at most one shared stream per query key and routes raw feed
//! updates to every subscriber of that key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::metadata::QueryKey;
use crate::source::RawFeed;
use crate::value::Value;

use super::config::MuxConfig;
use super::entry::{OpenState, StreamEntry, StreamEvent, StreamPhase, StreamStats};
use super::forward;
use super::handle::{Lease, Subscription};

/// State shared between the multiplexer, its handles and its tasks
pub(super) struct Shared {
    /// Map of query key to stream entry
    streams: Mutex<HashMap<QueryKey, StreamEntry>>,

    config: MuxConfig,

    next_id: AtomicU64,
}

/// What an acquire does once the map lock is released
enum Step<F> {
    AwaitClose(watch::Receiver<bool>),
    AwaitOpen(watch::Receiver<OpenState>, Lease),
    Open(watch::Receiver<OpenState>, Lease, F),
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, StreamEntry>> {
        // Entries are only mutated in short non-panicking sections
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn await_open(
        &self,
        mut ready: watch::Receiver<OpenState>,
        lease: Lease,
    ) -> Result<Subscription> {
        let outcome = match ready
            .wait_for(|state| !matches!(state, OpenState::Pending))
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => OpenState::Pending,
        };

        match outcome {
            OpenState::Ready => self.attach(lease),
            OpenState::Failed(err) => Err(err),
            OpenState::Pending => Err(Error::SourceUnavailable {
                key: lease.key().to_string(),
                reason: "stream removed before open completed".into(),
            }),
        }
    }

    fn attach(&self, lease: Lease) -> Result<Subscription> {
        let streams = self.lock();
        let attached = match streams.get(lease.key()) {
            Some(entry) if entry.id == lease.id() && entry.phase == StreamPhase::Live => {
                Some((entry.latest.clone(), entry.tx.subscribe(), entry.refcount))
            }
            _ => None,
        };
        drop(streams);

        match attached {
            Some((latest, rx, subscribers)) => {
                tracing::debug!(
                    key = %lease.key(),
                    subscribers = subscribers,
                    "Subscriber attached after open"
                );
                Ok(Subscription::new(lease, latest, rx))
            }
            None => Err(Error::UpstreamFailed {
                key: lease.key().to_string(),
                reason: "stream ended before the subscriber attached".into(),
            }),
        }
    }

    /// Complete an open started by `acquire`
    fn finish_open(self: &Arc<Self>, key: &QueryKey, id: u64, result: Result<RawFeed>) {
        let mut streams = self.lock();

        let current = streams.get(key).map(|entry| entry.id == id).unwrap_or(false);
        if !current {
            drop(streams);
            if let Ok(mut feed) = result {
                tokio::spawn(async move { feed.cancel.run().await });
            }
            return;
        }

        let feed = match result {
            Ok(feed) => feed,
            Err(err) => {
                let reason = match err {
                    Error::SourceUnavailable { reason, .. } => reason,
                    other => other.to_string(),
                };
                let err = Error::SourceUnavailable {
                    key: key.to_string(),
                    reason,
                };

                let removed = streams.remove(key);
                drop(streams);

                tracing::warn!(key = %key, error = %err, "Failed to open shared stream");
                if let Some(entry) = removed {
                    entry.ready.send_replace(OpenState::Failed(err));
                    entry.closed.send_replace(true);
                }
                return;
            }
        };

        let Some(entry) = streams.get_mut(key) else {
            return;
        };
        entry.cancel = Some(feed.cancel);

        if entry.refcount == 0 {
            tracing::info!(
                key = %key,
                generation = id,
                "All subscribers released during open, closing"
            );
            entry.ready.send_replace(OpenState::Failed(Error::SourceUnavailable {
                key: key.to_string(),
                reason: "released during open".into(),
            }));
            self.begin_close(key, entry);
            return;
        }

        let window = if feed.coalesced {
            Duration::ZERO
        } else {
            self.config.debounce_window
        };

        entry.latest = feed.initial;
        entry.phase = StreamPhase::Live;
        if let Some(updates) = feed.updates {
            entry.forwarder = Some(entry.runtime.spawn(forward::run(
                Arc::clone(self),
                key.clone(),
                id,
                updates,
                window,
            )));
        }
        entry.ready.send_replace(OpenState::Ready);

        tracing::info!(
            key = %key,
            generation = id,
            subscribers = entry.refcount,
            has_value = entry.latest.is_some(),
            "Shared stream live"
        );
    }

    /// Move an entry to `Closing` and run its cancel in the background
    fn begin_close(self: &Arc<Self>, key: &QueryKey, entry: &mut StreamEntry) {
        entry.phase = StreamPhase::Closing;
        entry.refcount = 0;

        let cancel = entry.cancel.take();
        let forwarder = entry.forwarder.take();
        let shared = Arc::clone(self);
        let key = key.clone();
        let id = entry.id;

        entry.runtime.spawn(async move {
            if let Some(forwarder) = forwarder {
                forwarder.abort();
                let _ = forwarder.await;
            }
            if let Some(mut cancel) = cancel {
                cancel.run().await;
            }
            shared.finish_close(&key, id);
        });
    }

    fn finish_close(&self, key: &QueryKey, id: u64) {
        let removed = {
            let mut streams = self.lock();
            match streams.get(key) {
                Some(entry) if entry.id == id => streams.remove(key),
                _ => None,
            }
        };

        if let Some(entry) = removed {
            entry.closed.send_replace(true);
            tracing::info!(key = %key, generation = id, "Shared stream closed");
        }
    }

    /// Drop one reference; the last one closes the stream
    pub(super) fn release(self: &Arc<Self>, key: &QueryKey, id: u64) {
        let mut streams = self.lock();

        let Some(entry) = streams.get_mut(key) else {
            return;
        };
        if entry.id != id || entry.phase == StreamPhase::Closing {
            return;
        }

        entry.refcount = entry.refcount.saturating_sub(1);
        tracing::debug!(key = %key, subscribers = entry.refcount, "Subscriber released");

        // An entry still opening is closed by `finish_open` once the factory resolves
        if entry.refcount == 0 && entry.phase == StreamPhase::Live {
            tracing::info!(
                key = %key,
                generation = id,
                "Last subscriber released, closing shared stream"
            );
            self.begin_close(key, entry);
        }
    }

    /// Record and broadcast a coalesced update
    ///
    /// Returns false once the stream generation is gone.
    pub(super) fn publish(&self, key: &QueryKey, id: u64, value: Value, coalesced: u64) -> bool {
        let mut streams = self.lock();

        let Some(entry) = streams
            .get_mut(key)
            .filter(|entry| entry.id == id && entry.phase == StreamPhase::Live)
        else {
            return false;
        };

        entry.updates_coalesced += coalesced;

        if self.config.dedupe && entry.latest.as_ref() == Some(&value) {
            entry.updates_suppressed += 1;
            tracing::trace!(key = %key, "Duplicate update suppressed");
            return true;
        }

        entry.latest = Some(value.clone());
        entry.updates_forwarded += 1;

        let receivers = entry.tx.send(StreamEvent::Update(value)).unwrap_or(0);
        tracing::trace!(key = %key, receivers = receivers, "Update forwarded");

        true
    }

    /// Tear a live stream down after its feed broke
    pub(super) fn fail(self: &Arc<Self>, key: &QueryKey, id: u64, reason: String) {
        let mut streams = self.lock();

        let Some(entry) = streams
            .get_mut(key)
            .filter(|entry| entry.id == id && entry.phase == StreamPhase::Live)
        else {
            return;
        };

        let err = Error::UpstreamFailed {
            key: key.to_string(),
            reason,
        };
        tracing::warn!(
            key = %key,
            subscribers = entry.refcount,
            error = %err,
            "Upstream failed, tearing down shared stream"
        );

        let _ = entry.tx.send(StreamEvent::Failed(err));
        self.begin_close(key, entry);
    }
}

/// Shares one raw subscription per query key among any number of subscribers
///
/// Cheap to clone; clones share the same streams.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Create a multiplexer with default configuration
    pub fn new() -> Self {
        Self::with_config(MuxConfig::default())
    }

    /// Create a multiplexer with custom configuration
    pub fn with_config(config: MuxConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(HashMap::new()),
                config,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Get the multiplexer configuration
    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    /// Subscribe to the shared stream for `key`
    ///
    /// Joins the existing stream if there is one and replays its latest
    /// value. Otherwise `factory` is called (at most once per stream
    /// lifetime) on a spawned task, so the open completes even if this
    /// caller goes away. If the key is still closing, waits for the close
    /// to be acknowledged and opens a fresh stream.
    pub async fn acquire<F, Fut>(&self, key: QueryKey, factory: F) -> Result<Subscription>
    where
        F: FnOnce(QueryKey) -> Fut + Send,
        Fut: Future<Output = Result<RawFeed>> + Send + 'static,
    {
        let mut factory = Some(factory);

        loop {
            let step = {
                let mut streams = self.shared.lock();

                match streams.get_mut(&key) {
                    Some(entry) if entry.phase == StreamPhase::Closing => {
                        Step::AwaitClose(entry.closed.subscribe())
                    }
                    Some(entry) => {
                        entry.refcount += 1;
                        let lease = Lease::new(Arc::clone(&self.shared), key.clone(), entry.id);

                        if entry.phase == StreamPhase::Live {
                            tracing::debug!(
                                key = %key,
                                subscribers = entry.refcount,
                                "Subscriber attached to shared stream"
                            );
                            return Ok(Subscription::new(
                                lease,
                                entry.latest.clone(),
                                entry.tx.subscribe(),
                            ));
                        }

                        Step::AwaitOpen(entry.ready.subscribe(), lease)
                    }
                    None => {
                        let Some(factory) = factory.take() else {
                            return Err(Error::SourceUnavailable {
                                key: key.to_string(),
                                reason: "stream factory already consumed".into(),
                            });
                        };

                        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                        let mut entry = StreamEntry::new(id, &self.shared.config, Handle::current());
                        entry.refcount = 1;
                        let ready = entry.ready.subscribe();
                        streams.insert(key.clone(), entry);

                        tracing::info!(key = %key, generation = id, "Opening shared stream");

                        let lease = Lease::new(Arc::clone(&self.shared), key.clone(), id);
                        Step::Open(ready, lease, factory)
                    }
                }
            };

            match step {
                Step::AwaitClose(mut closed) => {
                    tracing::debug!(key = %key, "Waiting for previous stream to close");
                    let _ = closed.wait_for(|done| *done).await;
                }
                Step::AwaitOpen(ready, lease) => {
                    return self.shared.await_open(ready, lease).await;
                }
                Step::Open(ready, lease, factory) => {
                    let open = factory(key.clone());
                    let shared = Arc::clone(&self.shared);
                    let open_key = key.clone();
                    let id = lease.id();

                    tokio::spawn(async move {
                        let result = open.await;
                        shared.finish_open(&open_key, id, result);
                    });

                    return self.shared.await_open(ready, lease).await;
                }
            }
        }
    }

    /// Close every stream and wait for all cancels to complete
    ///
    /// Live subscribers observe end-of-stream. Streams still opening are
    /// closed as soon as their factory resolves.
    pub async fn shutdown(&self) {
        let waiters: Vec<watch::Receiver<bool>> = {
            let mut streams = self.shared.lock();
            let mut waiters = Vec::with_capacity(streams.len());

            for (key, entry) in streams.iter_mut() {
                waiters.push(entry.closed.subscribe());

                match entry.phase {
                    StreamPhase::Live => {
                        let _ = entry.tx.send(StreamEvent::Closed);
                        self.shared.begin_close(key, entry);
                    }
                    StreamPhase::Opening => {
                        entry.refcount = 0;
                        entry.ready.send_replace(OpenState::Failed(Error::SourceUnavailable {
                            key: key.to_string(),
                            reason: "multiplexer shut down".into(),
                        }));
                    }
                    StreamPhase::Closing => {}
                }
            }

            waiters
        };

        tracing::info!(streams = waiters.len(), "Shutting down multiplexer");

        for mut closed in waiters {
            let _ = closed.wait_for(|done| *done).await;
        }
    }

    /// Get stream statistics
    pub fn stream_stats(&self, key: &QueryKey) -> Option<StreamStats> {
        self.shared.lock().get(key).map(StreamEntry::stats)
    }

    /// Get total number of streams (any phase)
    pub fn stream_count(&self) -> usize {
        self.shared.lock().len()
    }

    /// Number of live subscriber handles for `key`
    pub fn subscriber_count(&self, key: &QueryKey) -> u32 {
        self.shared
            .lock()
            .get(key)
            .map(|entry| entry.refcount)
            .unwrap_or(0)
    }

    /// Keys with an entry in any phase
    pub fn keys(&self) -> Vec<QueryKey> {
        self.shared.lock().keys().cloned().collect()
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}
