//! Derived queries
//!
//! A derive function is a pure mapping over one or more storage queries.
//! The composer joins the inputs' shared streams, recomputes the mapping
//! once per coalescing window and publishes the result as another shared
//! stream, keyed by the mapping identity plus the ordered input keys.

pub mod catalog;
pub mod composer;
pub mod democracy;

pub use catalog::{DeriveCatalog, DeriveDef, InputBuilder};
pub use composer::{DeriveComposer, FeedOpener, MappingFn};
