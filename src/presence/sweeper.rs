use super::admission::AdmissionFilter;
use super::cache::{PresenceCache, PresenceCacheEntry};
use super::classifier::{self, HealthThresholds};
use super::debounce::DebounceGate;
use crate::broadcast::{Broadcaster, EngineEvent, PresenceEvent, TOPIC_POSITION};
use crate::store::{LastKnownPosition, PositionStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub went_offline: usize,
    pub came_back: usize,
    pub persist_failures: usize,
    pub cache_purged: usize,
}

/// Periodic offline-episode detector.
///
/// Per device key the lifecycle is ONLINE → offline past the threshold
/// (persist last position once, mark the episode) → back ONLINE
/// (episode mark cleared so a later outage persists again). The episode
/// set is the only state the sweeper owns; the cache is read-only to
/// it, and ingestion never waits on a sweep.
pub struct OfflineSweeper {
    cache: Arc<PresenceCache>,
    admission: Arc<AdmissionFilter>,
    debounce: Arc<DebounceGate>,
    broadcaster: Arc<Broadcaster>,
    store: Arc<dyn PositionStore>,
    offline_threshold: ChronoDuration,
    thresholds: HealthThresholds,
    persisted_offline: Mutex<HashSet<String>>,
}

impl OfflineSweeper {
    pub fn new(
        cache: Arc<PresenceCache>,
        admission: Arc<AdmissionFilter>,
        debounce: Arc<DebounceGate>,
        broadcaster: Arc<Broadcaster>,
        store: Arc<dyn PositionStore>,
        offline_threshold: std::time::Duration,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            cache,
            admission,
            debounce,
            broadcaster,
            store,
            offline_threshold: ChronoDuration::from_std(offline_threshold)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
            thresholds,
            persisted_offline: Mutex::new(HashSet::new()),
        }
    }

    /// One sweep pass. Persistence failures are logged and leave the
    /// episode unclaimed so the next tick retries; they never abort the
    /// pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let entries = self.cache.get_all();

        let (newly_offline, back_online) = self.partition(&entries, now);

        for entry in newly_offline {
            let device_key = entry.reading.device_key.clone();
            // Claim the episode before the write; overlapping passes
            // then cannot upsert the same episode twice. A failed write
            // releases the claim.
            let claimed = self
                .persisted_offline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(device_key.clone());
            if !claimed {
                continue;
            }

            let position = LastKnownPosition::from_entry(&entry, now);
            match self.store.upsert(&position).await {
                Ok(()) => {
                    summary.went_offline += 1;
                    tracing::info!(
                        device = %device_key,
                        lat = ?position.lat,
                        lon = ?position.lon,
                        "device went offline; last position persisted"
                    );
                    self.publish_state(entry, now);
                }
                Err(err) => {
                    self.persisted_offline
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&device_key);
                    summary.persist_failures += 1;
                    tracing::error!(
                        device = %device_key,
                        error = %err,
                        "failed to persist last position; will retry next sweep"
                    );
                }
            }
        }

        for entry in back_online {
            let device_key = entry.reading.device_key.clone();
            let cleared = self
                .persisted_offline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&device_key);
            if cleared {
                summary.came_back += 1;
                tracing::info!(device = %device_key, "device came back online");
                self.publish_state(entry, now);
            }
        }

        // Housekeeping rides the same tick: hard-TTL cache eviction and
        // bounded-memory pruning of the admission/debounce maps.
        summary.cache_purged = self.cache.purge_expired(now);
        let evicted = self.admission.evict_idle(now);
        let pruned = self.debounce.prune_idle(now);
        if summary.cache_purged > 0 || evicted > 0 || pruned > 0 {
            tracing::debug!(
                cache_purged = summary.cache_purged,
                admission_evicted = evicted,
                tickets_pruned = pruned,
                "sweep housekeeping"
            );
        }

        summary
    }

    fn partition(
        &self,
        entries: &[PresenceCacheEntry],
        now: DateTime<Utc>,
    ) -> (Vec<PresenceCacheEntry>, Vec<PresenceCacheEntry>) {
        let marked = self
            .persisted_offline
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut newly_offline = Vec::new();
        let mut back_online = Vec::new();
        for entry in entries {
            let offline = entry.age(now) >= self.offline_threshold;
            let is_marked = marked.contains(&entry.reading.device_key);
            if offline && !is_marked {
                newly_offline.push(entry.clone());
            } else if !offline && is_marked {
                back_online.push(entry.clone());
            }
        }
        (newly_offline, back_online)
    }

    fn publish_state(&self, entry: PresenceCacheEntry, now: DateTime<Utc>) {
        let state = classifier::classify(&entry, now, self.offline_threshold, &self.thresholds);
        self.broadcaster.publish(
            TOPIC_POSITION,
            EngineEvent::Presence(PresenceEvent {
                reading: entry.reading,
                state,
            }),
        );
    }

    /// Run the sweeper on a fixed period until `stop` flips. The
    /// in-flight pass always completes before the task exits, so a
    /// shutdown can never leave a half-claimed episode behind.
    pub fn spawn(
        self: Arc<Self>,
        period: std::time::Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = self.sweep(Utc::now()).await;
                        if summary.went_offline > 0 || summary.came_back > 0 {
                            tracing::info!(
                                went_offline = summary.went_offline,
                                came_back = summary.came_back,
                                persist_failures = summary.persist_failures,
                                "offline sweep finished"
                            );
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            tracing::info!("offline sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
