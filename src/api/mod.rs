//! Public query surface
//!
//! [`Api`] is an explicit context value: it bundles the metadata registry,
//! the raw source, the multiplexer and the derive catalog. Create one per
//! node connection and clone it freely.

pub mod context;

pub use context::Api;
