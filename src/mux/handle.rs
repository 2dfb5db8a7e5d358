//! Subscriber handles

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::Result;
use crate::metadata::QueryKey;
use crate::value::Value;

use super::entry::StreamEvent;
use super::store::Shared;

/// One reference-count increment on one stream generation
///
/// Dropping the lease releases it, so a caller that gives up mid-acquire
/// cannot leak a reference.
pub(super) struct Lease {
    shared: Arc<Shared>,
    key: QueryKey,
    id: u64,
    released: bool,
}

impl Lease {
    pub fn new(shared: Arc<Shared>, key: QueryKey, id: u64) -> Self {
        Self {
            shared,
            key,
            id,
            released: false,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release(&self.key, self.id);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

/// A subscriber's handle on a shared stream
///
/// Carries the value replayed at attach time and receives every later
/// update. Releasing (explicitly or by drop) gives up the reference; the
/// last release closes the underlying feed.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use storage_derive::{Api, MemorySource, MethodRegistry, Value};
///
/// # async fn example() -> storage_derive::Result<()> {
/// let registry = Arc::new(MethodRegistry::builtin()?);
/// let source = MemorySource::new(Arc::clone(&registry));
/// let api = Api::new(registry, Arc::new(source));
///
/// let mut now = api.query("timestamp", "now", vec![]).await?;
/// println!("current: {:?}", now.current());
///
/// while let Some(update) = now.next().await {
///     println!("update: {}", update?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Subscription {
    lease: Lease,
    current: Option<Value>,
    rx: broadcast::Receiver<StreamEvent>,
    finished: bool,
}

impl Subscription {
    pub(super) fn new(
        lease: Lease,
        current: Option<Value>,
        rx: broadcast::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            lease,
            current,
            rx,
            finished: false,
        }
    }

    /// Key of the subscribed query
    pub fn key(&self) -> &QueryKey {
        self.lease.key()
    }

    /// Stream generation this handle belongs to
    pub fn generation(&self) -> u64 {
        self.lease.id()
    }

    /// Latest value seen by this subscriber; `None` while nothing is known
    pub fn current(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    /// Wait for the next update
    ///
    /// Returns `Some(Err(_))` once if the upstream failed, and `None` after
    /// the stream ended or the handle was released. Cancel safe.
    pub async fn next(&mut self) -> Option<Result<Value>> {
        if self.finished {
            return None;
        }

        loop {
            match self.rx.recv().await {
                Ok(StreamEvent::Update(value)) => {
                    self.current = Some(value.clone());
                    return Some(Ok(value));
                }
                Ok(StreamEvent::Failed(err)) => {
                    self.finished = true;
                    return Some(Err(err));
                }
                Ok(StreamEvent::Closed) | Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(key = %self.key(), skipped = skipped, "Subscriber lagged, skipping to newer updates");
                }
            }
        }
    }

    /// Give up this handle's reference; idempotent
    pub fn release(&mut self) {
        self.finished = true;
        self.lease.release();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", self.key())
            .field("generation", &self.generation())
            .field("current", &self.current)
            .field("finished", &self.finished)
            .finish()
    }
}
