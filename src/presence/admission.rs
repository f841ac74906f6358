use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};

/// Outcome of observing one reading from a device key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Key not yet confirmed; carries the current streak length.
    Pending(u32),
    Admitted,
}

#[derive(Debug)]
struct AdmissionCounter {
    count: u32,
    last_seen: DateTime<Utc>,
}

/// Confirmation gate in front of the presence cache.
///
/// A MAC seen once or twice is frequently RF noise or a misread
/// address; requiring a streak of consecutive sightings keeps noise
/// from becoming a permanently tracked device. "Consecutive" means the
/// gap between sightings stays within the per-device reporting
/// interval; a longer gap restarts the streak. Counters for keys that
/// never confirm are evicted after an inactivity window to bound
/// memory. Admitted keys go into a permanent set so the steady-state
/// ingest path is a single read-lock lookup.
#[derive(Debug)]
pub struct AdmissionFilter {
    threshold: u32,
    gap: ChronoDuration,
    idle_window: ChronoDuration,
    admitted: RwLock<HashSet<String>>,
    counters: Mutex<HashMap<String, AdmissionCounter>>,
}

impl AdmissionFilter {
    pub fn new(threshold: u32, gap: std::time::Duration, idle_window: std::time::Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            gap: ChronoDuration::from_std(gap).unwrap_or_else(|_| ChronoDuration::seconds(10)),
            idle_window: ChronoDuration::from_std(idle_window)
                .unwrap_or_else(|_| ChronoDuration::minutes(30)),
            admitted: RwLock::new(HashSet::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_admitted(&self, device_key: &str) -> bool {
        self.admitted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device_key)
    }

    /// Record a sighting of `device_key` and report whether the key is
    /// now (or already was) a tracked device.
    pub fn observe(&self, device_key: &str, now: DateTime<Utc>) -> Admission {
        if self.is_admitted(device_key) {
            return Admission::Admitted;
        }

        let count = {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            let counter = counters
                .entry(device_key.to_string())
                .or_insert(AdmissionCounter {
                    count: 0,
                    last_seen: now,
                });
            if now - counter.last_seen > self.gap {
                counter.count = 1;
            } else {
                counter.count += 1;
            }
            counter.last_seen = now;
            let count = counter.count;
            if count >= self.threshold {
                counters.remove(device_key);
            }
            count
        };

        if count >= self.threshold {
            self.admitted
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(device_key.to_string());
            tracing::info!(device = %device_key, sightings = count, "device admitted");
            Admission::Admitted
        } else {
            Admission::Pending(count)
        }
    }

    /// Drop counters for keys that went quiet before confirming.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let before = counters.len();
        counters.retain(|_, counter| now - counter.last_seen < self.idle_window);
        before - counters.len()
    }

    pub fn pending_len(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
