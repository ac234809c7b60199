//! Per-endpoint cache strategy
//!
//! A [`CacheStrategy`] is the declared contract of how fresh an endpoint's
//! data is allowed to be.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How responses of one endpoint are cached and shared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStrategy {
    /// Time a response stays fresh, in milliseconds (0 = never stored)
    pub ttl_ms: u64,
    /// Join an identical in-flight request instead of issuing a new one
    pub deduplicate: bool,
    /// Extra window past expiry during which a stale response is still served
    pub stale_while_revalidate_ms: Option<u64>,
}

impl CacheStrategy {
    /// No caching, no sharing
    pub const NONE: Self = Self {
        ttl_ms: 0,
        deduplicate: false,
        stale_while_revalidate_ms: None,
    };

    /// Strategy with the given TTL
    #[inline]
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl_ms: crate::clock::duration_ms(ttl),
            ..Self::NONE
        }
    }

    /// Share identical in-flight requests
    #[inline]
    #[must_use]
    pub fn deduplicated(mut self) -> Self {
        self.deduplicate = true;
        self
    }

    /// Serve stale responses for `window` after expiry
    #[inline]
    #[must_use]
    pub fn with_stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate_ms = Some(crate::clock::duration_ms(window));
        self
    }

    /// Check if responses are stored at all
    #[inline]
    #[must_use]
    pub fn stores(&self) -> bool {
        self.ttl_ms > 0
    }
}
