//! In-memory storage source
//!
//! Behaves like a node whose storage is a hash map: values can be set,
//! removed or made to fail, and every open subscription to the changed item
//! is notified. Used by the crate's tests and usable as a fake node in
//! downstream tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{Error, Result};
use crate::metadata::{MethodDescriptor, MethodRegistry};
use crate::value::Value;

use super::{BoxFuture, Cancel, RawFeed, RawQuerySource, SourceEvent};

const FEED_CHANNEL_CAPACITY: usize = 256;

struct Watcher {
    id: u64,
    descriptor: Arc<MethodDescriptor>,
    tx: mpsc::Sender<SourceEvent>,
}

#[derive(Default)]
struct MemoryState {
    values: HashMap<Bytes, Value>,
    watchers: HashMap<Bytes, Vec<Watcher>>,
    next_watcher_id: u64,
    opens: u64,
    closes: u64,
    fail_next_open: Option<String>,
}

/// Storage source backed by an in-process map
#[derive(Clone)]
pub struct MemorySource {
    registry: Arc<MethodRegistry>,
    state: Arc<Mutex<MemoryState>>,
    open_delay: Duration,
    close_delay: Duration,
}

impl MemorySource {
    /// Create an empty source for the given metadata
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            state: Arc::new(Mutex::new(MemoryState::default())),
            open_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
        }
    }

    /// Delay every open, simulating a subscription handshake
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Delay every cancel acknowledgement
    pub fn close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Write a storage item and notify its subscribers
    pub fn set(&self, module: &str, method: &str, args: Vec<Value>, value: Value) -> Result<()> {
        let storage_key = self.storage_key(module, method, &args)?;
        let mut state = self.lock();
        state.values.insert(storage_key.clone(), value.clone());
        notify(&mut state, &storage_key, Some(value));
        Ok(())
    }

    /// Clear a storage item; subscribers see the declared default
    pub fn remove(&self, module: &str, method: &str, args: Vec<Value>) -> Result<()> {
        let storage_key = self.storage_key(module, method, &args)?;
        let mut state = self.lock();
        state.values.remove(&storage_key);
        notify(&mut state, &storage_key, None);
        Ok(())
    }

    /// Break every open subscription to a storage item
    pub fn fail(&self, module: &str, method: &str, args: Vec<Value>, reason: &str) -> Result<()> {
        let storage_key = self.storage_key(module, method, &args)?;
        let mut state = self.lock();

        if let Some(watchers) = state.watchers.remove(&storage_key) {
            tracing::debug!(
                query = %format!("{}.{}", module, method),
                watchers = watchers.len(),
                reason = reason,
                "Failing storage subscriptions"
            );
            for watcher in watchers {
                deliver_terminal(watcher, SourceEvent::Failed(reason.to_string()));
            }
        }

        Ok(())
    }

    /// Make the next open fail with `SourceUnavailable`
    pub fn fail_next_open(&self, reason: &str) {
        self.lock().fail_next_open = Some(reason.to_string());
    }

    /// Total number of subscriptions ever opened
    pub fn opens(&self) -> u64 {
        self.lock().opens
    }

    /// Total number of subscriptions cancelled
    pub fn closes(&self) -> u64 {
        self.lock().closes
    }

    /// Number of currently open subscriptions
    pub fn live(&self) -> usize {
        self.lock().watchers.values().map(Vec::len).sum()
    }

    /// Number of currently open subscriptions to one storage item
    pub fn live_for(&self, module: &str, method: &str, args: &[Value]) -> usize {
        match self.storage_key(module, method, args) {
            Ok(storage_key) => self
                .lock()
                .watchers
                .get(&storage_key)
                .map(Vec::len)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn storage_key(&self, module: &str, method: &str, args: &[Value]) -> Result<Bytes> {
        let descriptor = self.registry.resolve(module, method)?;
        descriptor.check_args(args)?;
        Ok(descriptor.encode_request(args))
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }
}

impl RawQuerySource for MemorySource {
    fn open(
        &self,
        descriptor: Arc<MethodDescriptor>,
        args: Arc<[Value]>,
    ) -> BoxFuture<'static, Result<RawFeed>> {
        let state = Arc::clone(&self.state);
        let open_delay = self.open_delay;
        let close_delay = self.close_delay;

        async move {
            if !open_delay.is_zero() {
                tokio::time::sleep(open_delay).await;
            }

            let storage_key = descriptor.encode_request(&args);
            let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);

            let (id, initial) = {
                let mut guard = lock_state(&state);

                if let Some(reason) = guard.fail_next_open.take() {
                    return Err(Error::SourceUnavailable {
                        key: descriptor.qualified_name(),
                        reason,
                    });
                }

                guard.opens += 1;
                guard.next_watcher_id += 1;
                let id = guard.next_watcher_id;
                let initial = descriptor.decode(guard.values.get(&storage_key).cloned());

                guard
                    .watchers
                    .entry(storage_key.clone())
                    .or_default()
                    .push(Watcher {
                        id,
                        descriptor: Arc::clone(&descriptor),
                        tx,
                    });

                (id, initial)
            };

            tracing::debug!(query = %descriptor.qualified_name(), watcher = id, "Storage subscription opened");

            let cancel_state = Arc::clone(&state);
            let cancel = Cancel::new(move || async move {
                if !close_delay.is_zero() {
                    tokio::time::sleep(close_delay).await;
                }

                let mut guard = lock_state(&cancel_state);
                guard.closes += 1;
                if let Some(watchers) = guard.watchers.get_mut(&storage_key) {
                    watchers.retain(|w| w.id != id);
                    if watchers.is_empty() {
                        guard.watchers.remove(&storage_key);
                    }
                }
            });

            Ok(RawFeed::new(Some(initial), rx, cancel))
        }
        .boxed()
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    // A panic while holding the lock leaves the map itself consistent
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn notify(state: &mut MemoryState, storage_key: &Bytes, raw: Option<Value>) {
    if let Some(watchers) = state.watchers.get(storage_key) {
        for watcher in watchers {
            let value = watcher.descriptor.decode(raw.clone());
            match watcher.tx.try_send(SourceEvent::Update(value)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(watcher = watcher.id, "Storage update dropped, feed is full");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(watcher = watcher.id, "Storage update for a closed feed");
                }
            }
        }
    }
}

/// Send the last event of a detached watcher
///
/// A full feed gets the event from a background send, queued behind the
/// updates it already holds.
fn deliver_terminal(watcher: Watcher, event: SourceEvent) {
    match watcher.tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(watcher = watcher.id, "Feed full, delivering failure in background");
                runtime.spawn(async move {
                    let _ = watcher.tx.send(event).await;
                });
            }
            Err(_) => {
                tracing::warn!(watcher = watcher.id, "Storage failure dropped, feed is full");
            }
        },
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(watcher = watcher.id, "Storage failure for a closed feed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<MethodRegistry>, MemorySource) {
        let registry = Arc::new(MethodRegistry::builtin().unwrap());
        let source = MemorySource::new(Arc::clone(&registry));
        (registry, source)
    }

    #[tokio::test]
    async fn test_open_returns_current_value() {
        let (registry, source) = setup();
        source.set("timestamp", "now", vec![], Value::Uint(42)).unwrap();

        let desc = registry.resolve("timestamp", "now").unwrap();
        let feed = source.open(desc, Vec::new().into()).await.unwrap();

        assert_eq!(feed.initial, Some(Value::Uint(42)));
        assert_eq!(source.opens(), 1);
        assert_eq!(source.live(), 1);
    }

    #[tokio::test]
    async fn test_updates_and_defaults() {
        let (registry, source) = setup();
        let desc = registry.resolve("timestamp", "now").unwrap();
        let mut feed = source.open(desc, Vec::new().into()).await.unwrap();

        // Empty slot decodes to the declared default
        assert_eq!(feed.initial, Some(Value::Uint(0)));

        source.set("timestamp", "now", vec![], Value::Uint(7)).unwrap();
        source.remove("timestamp", "now", vec![]).unwrap();

        let updates = feed.updates.as_mut().unwrap();
        assert_eq!(updates.recv().await, Some(SourceEvent::Update(Value::Uint(7))));
        assert_eq!(updates.recv().await, Some(SourceEvent::Update(Value::Uint(0))));
    }

    #[tokio::test]
    async fn test_cancel_removes_watcher() {
        let (registry, source) = setup();
        let desc = registry.resolve("timestamp", "now").unwrap();
        let mut feed = source.open(desc, Vec::new().into()).await.unwrap();

        assert_eq!(source.live_for("timestamp", "now", &[]), 1);
        feed.cancel.run().await;
        assert_eq!(source.live_for("timestamp", "now", &[]), 0);
        assert_eq!(source.closes(), 1);
    }

    #[tokio::test]
    async fn test_fail_next_open() {
        let (registry, source) = setup();
        source.fail_next_open("connection refused");

        let desc = registry.resolve("timestamp", "now").unwrap();
        let result = source.open(Arc::clone(&desc), Vec::new().into()).await;
        assert!(matches!(result, Err(Error::SourceUnavailable { .. })));

        // Only the next open fails
        assert!(source.open(desc, Vec::new().into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_notifies_and_drops_watchers() {
        let (registry, source) = setup();
        let desc = registry.resolve("timestamp", "now").unwrap();
        let mut feed = source.open(desc, Vec::new().into()).await.unwrap();

        source.fail("timestamp", "now", vec![], "node restarted").unwrap();

        let updates = feed.updates.as_mut().unwrap();
        assert_eq!(
            updates.recv().await,
            Some(SourceEvent::Failed("node restarted".into()))
        );
        assert_eq!(updates.recv().await, None);
        assert_eq!(source.live(), 0);
    }

    #[tokio::test]
    async fn test_fail_reaches_full_feed() {
        let (registry, source) = setup();
        let desc = registry.resolve("timestamp", "now").unwrap();
        let mut feed = source.open(desc, Vec::new().into()).await.unwrap();

        for n in 0..FEED_CHANNEL_CAPACITY as u64 {
            source.set("timestamp", "now", vec![], Value::Uint(n.into())).unwrap();
        }
        source.fail("timestamp", "now", vec![], "node restarted").unwrap();

        let updates = feed.updates.as_mut().unwrap();
        for n in 0..FEED_CHANNEL_CAPACITY as u64 {
            assert_eq!(updates.recv().await, Some(SourceEvent::Update(Value::Uint(n.into()))));
        }
        assert_eq!(
            updates.recv().await,
            Some(SourceEvent::Failed("node restarted".into()))
        );
        assert_eq!(updates.recv().await, None);
    }

    #[test]
    fn test_set_validates_arguments() {
        let (_, source) = setup();
        let err = source
            .set("democracy", "voteOf", vec![Value::Uint(1)], Value::Uint(0))
            .unwrap_err();
        assert!(matches!(err, Error::ArgumentMismatch { .. }));
    }
}
