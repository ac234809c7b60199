//! docsync cache layer
//!
//! Generic plumbing under the document sync core:
//!
//! - [`RequestCache`]: TTL response cache with stale-while-revalidate serving,
//!   in-flight request deduplication and supersede-on-new-request cancellation
//! - [`PromiseManager`]: keyed registry of pending futures (insert-if-absent,
//!   else join)
//! - [`Transport`]: the outbound HTTP seam, with a reqwest implementation
//! - [`Clock`]: injected time source so TTL boundaries are testable
//!
//! # Example
//!
//! ```rust,ignore
//! use docsync_cache::{CacheStrategy, FetchOptions, RequestCache, ReqwestTransport, SystemClock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), docsync_cache::FetchError> {
//! let cache = RequestCache::new(
//!     Arc::new(ReqwestTransport::new("http://localhost:3000")),
//!     Arc::new(SystemClock),
//!     1_000,
//! );
//! let strategy = CacheStrategy::with_ttl(Duration::from_secs(30)).deduplicated();
//! let folders = cache
//!     .fetch_with_cache("/api/files?type=folder", FetchOptions::get(strategy))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod clock;
pub mod error;
pub mod promise;
pub mod request_cache;
pub mod strategy;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::FetchError;
pub use promise::{PromiseManager, SharedResult};
pub use request_cache::{
    cache_key, execute_request, CachedResponse, FetchOptions, RequestCache, RequestCacheStats,
};
pub use strategy::CacheStrategy;
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
