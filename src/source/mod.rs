//! Raw query sources
//!
//! A source opens one node-side subscription for a storage method and hands
//! back a [`RawFeed`]: the current value, a channel of later changes and a
//! cancel handle. Transport, handshakes and value decoding live behind this
//! trait; the multiplexer only sees feeds.

pub mod memory;

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::metadata::MethodDescriptor;
use crate::value::Value;

pub use memory::MemorySource;

pub use futures_util::future::BoxFuture;

/// Event pushed by a live feed
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// The underlying item changed
    Update(Value),
    /// The subscription broke; no further events follow
    Failed(String),
}

type CancelFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Releases node-side resources of a feed
///
/// Runs at most once; later calls are no-ops.
pub struct Cancel {
    inner: Option<CancelFn>,
}

impl Cancel {
    /// Wrap an async cancel routine
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Some(Box::new(move || f().boxed())),
        }
    }

    /// A cancel handle with nothing to release
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Run the cancel routine and wait for its acknowledgement
    pub async fn run(&mut self) {
        if let Some(cancel) = self.inner.take() {
            cancel().await;
        }
    }

    pub fn is_spent(&self) -> bool {
        self.inner.is_none()
    }
}

impl std::fmt::Debug for Cancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancel")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// An opened subscription
#[derive(Debug)]
pub struct RawFeed {
    /// Value at open time; `None` while nothing is known yet
    pub initial: Option<Value>,
    /// Later changes; `None` for a feed that never changes
    pub updates: Option<mpsc::Receiver<SourceEvent>>,
    /// Releases the subscription
    pub cancel: Cancel,
    /// Updates are already coalesced and must be forwarded without delay
    pub coalesced: bool,
}

impl RawFeed {
    /// Create a live feed
    pub fn new(initial: Option<Value>, updates: mpsc::Receiver<SourceEvent>, cancel: Cancel) -> Self {
        Self {
            initial,
            updates: Some(updates),
            cancel,
            coalesced: false,
        }
    }

    /// Create a feed that holds one value forever
    pub fn constant(value: Value) -> Self {
        Self {
            initial: Some(value),
            updates: None,
            cancel: Cancel::noop(),
            coalesced: true,
        }
    }

    /// Mark the feed's updates as already coalesced
    pub fn coalesced(mut self) -> Self {
        self.coalesced = true;
        self
    }
}

/// Opens raw storage subscriptions against a node
///
/// Implementations apply [`MethodDescriptor::decode`] to every value they
/// emit, so subscribers see declared defaults for empty slots. A failure
/// after the feed is live is reported as [`SourceEvent::Failed`]; dropping
/// the sender without cancel is treated the same way.
pub trait RawQuerySource: Send + Sync + 'static {
    fn open(
        &self,
        descriptor: Arc<MethodDescriptor>,
        args: Arc<[Value]>,
    ) -> BoxFuture<'static, Result<RawFeed>>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_cancel_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut cancel = Cancel::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!cancel.is_spent());
        cancel.run().await;
        cancel.run().await;

        assert!(cancel.is_spent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_constant_feed() {
        let feed = RawFeed::constant(Value::List(vec![]));
        assert_eq!(feed.initial, Some(Value::List(vec![])));
        assert!(feed.updates.is_none());
        assert!(feed.coalesced);
        assert!(feed.cancel.is_spent());
    }
}
