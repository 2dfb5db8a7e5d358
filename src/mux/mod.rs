//! Subscription multiplexer
//!
//! Turns an expensive, long-lived raw subscription into a shared stream:
//! the first subscriber to a key opens it, later subscribers join it and
//! immediately receive the latest value, and the last release closes it.
//! Upstream bursts are coalesced before fan-out.
//!
//! # Architecture
//!
//! ```text
//!                            Multiplexer
//!                   ┌───────────────────────────┐
//!                   │ streams: HashMap<QueryKey,│
//!                   │   StreamEntry {           │
//!                   │     latest, refcount,     │
//!                   │     tx: broadcast::Tx,    │
//!                   │     cancel, forwarder     │
//!                   │   }                       │
//!                   │ >                         │
//!                   └─────────────┬─────────────┘
//!                                 │
//!    [RawFeed] ──► forward::run ──┤ debounce, publish()
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!   [Subscription]          [Subscription]          [Subscription]
//!   current() + next()      current() + next()      current() + next()
//! ```
//!
//! # Lifecycle
//!
//! `Opening` (factory in flight) → `Live` (forwarder running) → `Closing`
//! (cancel in flight) → removed. A key in `Closing` cannot be reopened until
//! its cancel has been acknowledged, so two raw subscriptions for one key
//! never overlap.

pub mod config;
pub mod entry;
mod forward;
pub mod handle;
pub mod store;

pub use config::MuxConfig;
pub use entry::{StreamEvent, StreamPhase, StreamStats};
pub use handle::Subscription;
pub use store::Multiplexer;
