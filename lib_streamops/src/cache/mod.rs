//! # Client-Side Cache
//!
//! - **`key`**: entity kinds, cache keys (entity, collection, singleton) and
//!   the filters used for bulk invalidation.
//! - **`store`**: the shared [`QueryCache`] with stale-while-revalidate reads
//!   and a change feed.
//! - **`polling`**: timer-driven refresh of one key, stopped by dropping its
//!   [`PollHandle`].

pub mod key;
pub mod polling;
pub mod store;

pub use key::{CacheKey, EntityKind, KeyFilter, KeyScope, QueryParams};
pub use polling::PollHandle;
pub use store::{CacheChange, CachedValue, QueryCache, StalenessPolicy};
