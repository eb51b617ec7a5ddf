//! The hybrid timeline core: a bounded per-owner cache of recent posts in front of
//! an ordered persistent store, cursor pagination across the two, and fanout of new
//! posts into followers' feeds.

pub mod cache;
pub mod error;
pub mod fanout;
pub mod memory;
pub mod paginator;
pub mod retry;
pub mod service;
pub mod store;

pub use error::{StoreError, TimelineError};
pub use paginator::{Page, PageSource};
pub use service::{PostTimeline, Timeline, TimelineConfig};
