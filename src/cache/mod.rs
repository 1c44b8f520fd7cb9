//! Code cache for compiled procedures.
//!
//! Maps procedure ids to their compiled execution units so that each
//! procedure is compiled and loaded once per session.

mod lru;

pub use lru::{CacheStats, CodeCache};
