//! Storage method metadata
//!
//! Maps human-readable `(module, method)` pairs to descriptors that say how
//! to validate arguments, build a request key and decode an empty slot. The
//! registry is built once at startup; a document that fails to load is a
//! startup error, never a mid-run one.

pub mod descriptor;
pub mod key;
pub mod registry;

pub use descriptor::{ArgKind, MethodDescriptor};
pub use key::QueryKey;
pub use registry::MethodRegistry;
