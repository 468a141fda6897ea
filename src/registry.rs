//! Registry of live, cancellable relay requests.
//!
//! Each proxied call registers a fresh [`RequestId`] and keeps emitting
//! chunks only while that id is still present. Removing the id (from any
//! caller that knows it) is how a stream gets cancelled.

use std::{fmt, str::FromStr, sync::Arc};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier handed to the client in the framing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Concurrent set of live request ids.
///
/// Cloning is cheap and every clone observes the same set.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    live: Arc<DashMap<RequestId, ()>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly generated id. Ids are never reused, so a duplicate
    /// means the caller broke that contract.
    pub fn register(&self, id: RequestId) {
        let previous = self.live.insert(id, ());
        debug_assert!(previous.is_none(), "request id {} registered twice", id);
    }

    pub fn is_live(&self, id: &RequestId) -> bool {
        self.live.contains_key(id)
    }

    /// Removes the id on behalf of any caller holding it. Returns whether
    /// it was still live.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.live.remove(id).is_some()
    }

    /// Idempotent removal used by the owning stream when it terminates.
    pub fn release(&self, id: &RequestId) {
        self.live.remove(id);
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
