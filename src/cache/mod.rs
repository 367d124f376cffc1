//! Versioned response caches with offline support.
//!
//! This module provides:
//! - An immutable shell cache, populated all-or-nothing at install
//! - A runtime cache filled from successful network responses
//! - Purging of every other cache generation at activation
//! - Stale-while-revalidate fetch interception with an offline fallback

mod layer;
mod storage;
mod traits;

pub use layer::CacheManager;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedResponse, RequestKey, ResponseSource, Served};
