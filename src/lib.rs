//! Shared storage subscriptions and derived queries
//!
//! Wraps a node's raw storage-subscribe interface so that any number of
//! consumers asking for the same storage item share one upstream
//! subscription, late joiners receive the latest value immediately, and
//! bursts of updates are coalesced. On top of that, derive functions combine
//! several storage streams through a pure mapping into a new shared stream.
//!
//! # Layers
//!
//! - [`metadata`]: method descriptors loaded from node metadata, query keys
//! - [`source`]: the raw subscribe interface and an in-memory node
//! - [`mux`]: refcounted, replaying, debounced stream sharing
//! - [`derive`]: derive composition and the bundled derive functions
//! - [`api`]: the context value tying it together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use storage_derive::{Api, MemorySource, MethodRegistry, Value};
//!
//! # async fn example() -> storage_derive::Result<()> {
//! let registry = Arc::new(MethodRegistry::builtin()?);
//! let source = MemorySource::new(Arc::clone(&registry));
//! source.set("timestamp", "now", vec![], Value::Uint(1_600_000_000))?;
//!
//! let api = Api::new(registry, Arc::new(source.clone())).with_builtins();
//!
//! let mut now = api.query("timestamp", "now", vec![]).await?;
//! println!("now = {:?}", now.current());
//!
//! while let Some(update) = now.next().await {
//!     println!("now = {}", update?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod derive;
pub mod error;
pub mod metadata;
pub mod mux;
pub mod source;
pub mod value;

pub use api::Api;
pub use derive::{DeriveCatalog, DeriveComposer, DeriveDef, FeedOpener, InputBuilder, MappingFn};
pub use error::{Error, Result};
pub use metadata::{ArgKind, MethodDescriptor, MethodRegistry, QueryKey};
pub use mux::{Multiplexer, MuxConfig, StreamEvent, StreamPhase, StreamStats, Subscription};
pub use source::{Cancel, MemorySource, RawFeed, RawQuerySource, SourceEvent};
pub use value::Value;
