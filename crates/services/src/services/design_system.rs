//! Default reload collaborators: the shared render context and the query cache.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use serde_json::Value;
use tracing::{debug, info};

use super::system_reload::{DesignSystem, QueryInvalidator};

/// Prefix of global render references dropped on reload
pub const CONTEXT_PREFIX: &str = "context:";

const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Process-wide render context. Entries under [`CONTEXT_PREFIX`] are
/// considered stale after a reload; everything else survives it.
#[derive(Debug)]
pub struct DesignSystemContext {
    globals: DashMap<String, Value>,
    reloading: AtomicBool,
    settle: Duration,
}

impl Default for DesignSystemContext {
    fn default() -> Self {
        Self::new(SETTLE_DELAY)
    }
}

struct ReloadingFlag<'a>(&'a AtomicBool);

impl<'a> ReloadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ReloadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DesignSystemContext {
    pub fn new(settle: Duration) -> Self {
        Self {
            globals: DashMap::new(),
            reloading: AtomicBool::new(false),
            settle,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.globals.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.globals.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    fn clear_stale(&self) -> usize {
        let before = self.globals.len();
        self.globals.retain(|key, _| !key.starts_with(CONTEXT_PREFIX));
        before - self.globals.len()
    }
}

#[async_trait]
impl DesignSystem for DesignSystemContext {
    async fn force_reload(&self) -> anyhow::Result<()> {
        let _flag = ReloadingFlag::raise(&self.reloading);

        let cleared = self.clear_stale();
        debug!(cleared, "Cleared stale render context");

        tokio::time::sleep(self.settle).await;
        info!("Design system reloaded");
        Ok(())
    }

    fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }
}

/// Cached query results keyed by query name and parameters
#[derive(Clone)]
pub struct QueryCache {
    cache: Cache<String, Value>,
}

impl QueryCache {
    pub fn new(max_capacity: u64, time_to_live: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(time_to_live)
                .build(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: impl Into<String>, value: Value) {
        self.cache.insert(key.into(), value).await;
    }

}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(5 * 60))
    }
}

#[async_trait]
impl QueryInvalidator for QueryCache {
    async fn invalidate_queries(&self) -> anyhow::Result<()> {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        info!("Invalidated cached queries");
        Ok(())
    }
}
