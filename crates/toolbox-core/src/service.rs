//! Lifecycle contract for cached backend services.
//!
//! Every backend adapter (SQL, Redis, Elasticsearch, SSH) hands the cache an
//! object implementing [`Service`]. The cache only needs to know how long the
//! service may sit idle, when it was last used, and how to tear it down.

use crate::error::ToolboxResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backend families known to the toolbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sql,
    Redis,
    Elasticsearch,
    Ssh,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sql => "sql",
            BackendKind::Redis => "redis",
            BackendKind::Elasticsearch => "elasticsearch",
            BackendKind::Ssh => "ssh",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversion to `Arc<dyn Any>` so the cache can hand back concrete types.
pub trait AsAnyArc {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A long-lived backend connection that can be shared through the cache.
///
/// Implementations must be safe for concurrent use: one cached instance is
/// handed to every caller asking for the same key.
#[async_trait]
pub trait Service: AsAnyArc + Send + Sync + 'static {
    /// Which backend family this service belongs to.
    fn kind(&self) -> BackendKind;

    /// How long the service may stay unused before the reaper evicts it.
    fn idle_timeout(&self) -> Duration;

    /// Last time the service did real work, if it tracks that itself.
    ///
    /// The cache also records every lookup; the later of the two wins.
    fn last_used(&self) -> Option<Instant> {
        None
    }

    /// Release the underlying connection. Called at most once by the cache.
    async fn stop(&self) -> ToolboxResult<()>;
}
