//! Local cache tier.
//!
//! Provides the [`CacheStore`] contract with its disk-backed implementation,
//! the raw HTTP serialization of cached responses, and the body tee that
//! commits a response only once it has been read to the end.

pub mod entry;
pub mod store;
pub mod tee;

pub use entry::CachedResponse;
pub use store::{CacheStore, DiskStore};
pub use tee::CachingBodyTee;
