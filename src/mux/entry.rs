//! Shared stream entries
//!
//! One entry per query key. Every field is mutated under the multiplexer's
//! map lock; the generation `id` lets stale handles and tasks recognise that
//! the entry they refer to has been replaced.

use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::source::Cancel;
use crate::value::Value;

use super::config::MuxConfig;

/// Lifecycle phase of a shared stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Raw factory in flight
    Opening,
    /// Feed open, updates flowing
    Live,
    /// Cancel in flight; the key is not reusable until it completes
    Closing,
}

/// Event fanned out to subscribers
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Update(Value),
    /// Terminal: the upstream broke
    Failed(Error),
    /// Terminal: the multiplexer shut the stream down
    Closed,
}

/// Outcome of an in-flight open, observed by waiting acquirers
#[derive(Debug, Clone)]
pub(super) enum OpenState {
    Pending,
    Ready,
    Failed(Error),
}

/// Entry for a single shared stream
pub(super) struct StreamEntry {
    /// Generation id, unique per multiplexer
    pub id: u64,

    pub phase: StreamPhase,

    /// Number of live subscriber handles
    pub refcount: u32,

    /// Most recently delivered value, replayed to new subscribers
    pub latest: Option<Value>,

    /// Broadcast sender for fan-out to subscribers
    pub tx: broadcast::Sender<StreamEvent>,

    pub ready: watch::Sender<OpenState>,

    /// Flipped to true once the entry is removed after its cancel completed
    pub closed: watch::Sender<bool>,

    pub cancel: Option<Cancel>,

    pub forwarder: Option<JoinHandle<()>>,

    /// Runtime used for tasks spawned from synchronous release paths
    pub runtime: Handle,

    pub created_at: Instant,

    pub updates_forwarded: u64,

    /// Updates dropped because they equalled the latest value
    pub updates_suppressed: u64,

    /// Updates replaced by a newer one inside the same window
    pub updates_coalesced: u64,
}

impl StreamEntry {
    pub fn new(id: u64, config: &MuxConfig, runtime: Handle) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_capacity);
        let (ready, _) = watch::channel(OpenState::Pending);
        let (closed, _) = watch::channel(false);

        Self {
            id,
            phase: StreamPhase::Opening,
            refcount: 0,
            latest: None,
            tx,
            ready,
            closed,
            cancel: None,
            forwarder: None,
            runtime,
            created_at: Instant::now(),
            updates_forwarded: 0,
            updates_suppressed: 0,
            updates_coalesced: 0,
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            subscriber_count: self.refcount,
            phase: self.phase,
            has_value: self.latest.is_some(),
            updates_forwarded: self.updates_forwarded,
            updates_suppressed: self.updates_suppressed,
            updates_coalesced: self.updates_coalesced,
            age: self.created_at.elapsed(),
        }
    }
}

/// Statistics for a shared stream
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// Number of live subscriber handles
    pub subscriber_count: u32,
    pub phase: StreamPhase,
    /// Whether a latest value is available for replay
    pub has_value: bool,
    pub updates_forwarded: u64,
    pub updates_suppressed: u64,
    pub updates_coalesced: u64,
    /// Time since the entry was created
    pub age: Duration,
}
