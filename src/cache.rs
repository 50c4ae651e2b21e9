//! Value cache (component E): TTL-keyed last-good-value fallback, keyed by
//! `"device_key/sensor_key"`.

use crate::types::{CachedResult, SensorResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Concurrency-safe TTL cache of the last successfully read [`SensorResult`]
/// per sensor.
pub struct ValueCache {
    ttl: ChronoDuration,
    entries: RwLock<HashMap<String, CachedResult>>,
}

impl ValueCache {
    /// Creates a cache with the given TTL (default 5 minutes).
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::minutes(5)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached result for `key` if present and not older than the
    /// configured TTL.
    pub async fn get(&self, key: &str) -> Option<SensorResult> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|cached| {
            if Utc::now() - cached.cached_at < self.ttl {
                Some(cached.result.clone())
            } else {
                None
            }
        })
    }

    /// Stores `result` under its cache key, overwriting any prior entry.
    pub async fn set(&self, result: SensorResult) {
        let key = result.cache_key();
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CachedResult {
                result,
                cached_at: Utc::now(),
            },
        );
    }

    /// Removes all entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Returns the raw cached timestamp for `key`, ignoring TTL — used by
    /// diagnostics to report staleness.
    pub async fn cached_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(key).map(|c| c.cached_at)
    }
}

impl Default for ValueCache {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResultStatus;

    fn result(device: &str, sensor: &str, value: f64) -> SensorResult {
        SensorResult {
            device_key: device.into(),
            sensor_key: sensor.into(),
            display_name: sensor.into(),
            value,
            unit: None,
            device_class: None,
            state_class: None,
            status: ResultStatus::Fresh,
            raw: vec![],
        }
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let cache = ValueCache::default();
        assert!(cache.get("meter1/voltage").await.is_none());
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrips() {
        let cache = ValueCache::default();
        cache.set(result("meter1", "voltage", 220.25)).await;
        let cached = cache.get("meter1/voltage").await.unwrap();
        assert_eq!(cached.value, 220.25);
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_returned() {
        let cache = ValueCache::new(std::time::Duration::from_millis(10));
        cache.set(result("meter1", "voltage", 220.25)).await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(cache.get("meter1/voltage").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let cache = ValueCache::default();
        cache.set(result("meter1", "voltage", 220.25)).await;
        cache.clear().await;
        assert!(cache.get("meter1/voltage").await.is_none());
    }
}
