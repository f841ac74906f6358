use crate::reading::DeviceReading;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Cache record for one device: the most recent reading plus the
/// instant it was cached.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PresenceCacheEntry {
    pub reading: DeviceReading,
    pub cached_at: DateTime<Utc>,
}

impl PresenceCacheEntry {
    pub fn new(reading: DeviceReading) -> Self {
        let cached_at = reading.received_at;
        Self { reading, cached_at }
    }

    pub fn age(&self, now: DateTime<Utc>) -> ChronoDuration {
        now - self.reading.received_at
    }
}

/// TTL-keyed store of the latest reading per device key; the single
/// source of truth for "is this device currently known".
///
/// The TTL here is the hard eviction bound (hours-scale). A device that
/// merely stopped reporting for tens of seconds stays in the cache and
/// is classified inactive on read; a device silent past the TTL is
/// forgotten entirely. Presence data is best-effort: a poisoned lock
/// degrades reads to "no known devices" and drops writes with a warning
/// instead of propagating the panic.
#[derive(Debug)]
pub struct PresenceCache {
    entries: RwLock<HashMap<String, PresenceCacheEntry>>,
    ttl: ChronoDuration,
}

impl PresenceCache {
    pub fn new(ttl: std::time::Duration) -> Self {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(12));
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn is_expired(&self, entry: &PresenceCacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.cached_at >= self.ttl
    }

    /// Overwrite the entry for the reading's device key, resetting its
    /// TTL. Single map insert under the write lock, so concurrent puts
    /// for the same key cannot interleave a read-modify-write.
    pub fn put(&self, reading: DeviceReading) {
        let entry = PresenceCacheEntry::new(reading);
        match self.entries.write() {
            Ok(mut map) => {
                let key = entry.reading.device_key.clone();
                map.insert(key, entry);
            }
            Err(_) => {
                tracing::warn!(
                    device = %entry.reading.device_key,
                    "presence cache unavailable; dropping write"
                );
            }
        }
    }

    pub fn get(&self, device_key: &str) -> Option<PresenceCacheEntry> {
        let now = Utc::now();
        match self.entries.read() {
            Ok(map) => map
                .get(device_key)
                .filter(|entry| !self.is_expired(entry, now))
                .cloned(),
            Err(_) => {
                tracing::warn!("presence cache unavailable; degrading read to empty");
                None
            }
        }
    }

    /// Snapshot of every live (non-expired) entry.
    pub fn get_all(&self) -> Vec<PresenceCacheEntry> {
        let now = Utc::now();
        match self.entries.read() {
            Ok(map) => map
                .values()
                .filter(|entry| !self.is_expired(entry, now))
                .cloned()
                .collect(),
            Err(_) => {
                tracing::warn!("presence cache unavailable; degrading read to empty");
                Vec::new()
            }
        }
    }

    pub fn remove(&self, device_key: &str) {
        if let Ok(mut map) = self.entries.write() {
            if map.remove(device_key).is_some() {
                tracing::info!(device = %device_key, "removed device from presence cache");
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.entries.write() {
            map.clear();
        }
    }

    /// Physically drop expired entries. Reads already filter them, so
    /// this only reclaims memory; the sweeper calls it once per tick.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        match self.entries.write() {
            Ok(mut map) => {
                let before = map.len();
                map.retain(|_, entry| !self.is_expired(entry, now));
                before - map.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reading_at(key: &str, received_at: DateTime<Utc>) -> DeviceReading {
        DeviceReading {
            device_key: key.to_string(),
            producer_timestamp: None,
            received_at,
            battery: Some(80.0),
            voltage: Some(12.0),
            current: Some(1.0),
            power: None,
            lat: Some(21.0),
            lon: Some(105.8),
            fall_detected: false,
            help_request: false,
            counter: None,
            worker: None,
            rssi: None,
            snr: None,
        }
    }

    #[test]
    fn put_overwrites_and_get_returns_latest_arrival() {
        let cache = PresenceCache::new(Duration::from_secs(3600));
        let t0 = Utc::now();
        cache.put(reading_at("AA:BB", t0));
        cache.put(reading_at("AA:BB", t0 + ChronoDuration::seconds(5)));

        let entry = cache.get("AA:BB").expect("entry");
        assert_eq!(entry.reading.received_at, t0 + ChronoDuration::seconds(5));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_never_escape_reads() {
        let cache = PresenceCache::new(Duration::from_secs(60));
        let stale = Utc::now() - ChronoDuration::seconds(120);
        cache.put(reading_at("AA:BB", stale));
        cache.put(reading_at("CC:DD", Utc::now()));

        assert!(cache.get("AA:BB").is_none());
        let all = cache.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reading.device_key, "CC:DD");
    }

    #[test]
    fn purge_expired_reclaims_entries() {
        let cache = PresenceCache::new(Duration::from_secs(60));
        cache.put(reading_at("AA:BB", Utc::now() - ChronoDuration::seconds(120)));
        cache.put(reading_at("CC:DD", Utc::now()));

        assert_eq!(cache.len(), 2);
        let purged = cache.purge_expired(Utc::now());
        assert_eq!(purged, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_and_clear() {
        let cache = PresenceCache::new(Duration::from_secs(3600));
        cache.put(reading_at("AA:BB", Utc::now()));
        cache.put(reading_at("CC:DD", Utc::now()));

        cache.remove("AA:BB");
        assert!(cache.get("AA:BB").is_none());
        assert!(cache.get("CC:DD").is_some());

        cache.clear();
        assert!(cache.get_all().is_empty());
    }
}
