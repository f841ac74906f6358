mod admission;
mod cache;
mod classifier;
mod debounce;
mod sweeper;


pub use admission::{Admission, AdmissionFilter};
pub use cache::{PresenceCache, PresenceCacheEntry};
pub use classifier::{
    classify, triggered_conditions, ConditionClass, DeviceState, HealthThresholds,
};
pub use debounce::DebounceGate;
pub use sweeper::{OfflineSweeper, SweepSummary};

use crate::broadcast::{AlertEvent, Broadcaster, EngineEvent, PresenceEvent, TOPIC_ALERTS, TOPIC_POSITION};
use crate::reading::DeviceReading;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;

/// What happened to one inbound reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Device key not yet confirmed; the reading was counted and
    /// dropped.
    Pending(u32),
    /// Reading cached and published, with the state derived for it.
    Cached(DeviceState),
}

/// The ingestion gate. For every inbound reading, in order: admission
/// check, GPS carry-forward, cache write, classification, delta
/// publish, debounced alert emission.
///
/// Cheap to clone; all state lives behind `Arc`s owned by the service
/// root, so the MQTT task and the sweeper share the same stores without
/// any ambient globals.
#[derive(Clone)]
pub struct PresenceEngine {
    cache: Arc<PresenceCache>,
    admission: Arc<AdmissionFilter>,
    debounce: Arc<DebounceGate>,
    broadcaster: Arc<Broadcaster>,
    offline_threshold: ChronoDuration,
    thresholds: HealthThresholds,
}

impl PresenceEngine {
    pub fn new(
        cache: Arc<PresenceCache>,
        admission: Arc<AdmissionFilter>,
        debounce: Arc<DebounceGate>,
        broadcaster: Arc<Broadcaster>,
        offline_threshold: std::time::Duration,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            cache,
            admission,
            debounce,
            broadcaster,
            offline_threshold: ChronoDuration::from_std(offline_threshold)
                .unwrap_or_else(|_| ChronoDuration::seconds(30)),
            thresholds,
        }
    }

    pub fn cache(&self) -> &Arc<PresenceCache> {
        &self.cache
    }

    pub fn ingest(&self, mut reading: DeviceReading) -> IngestOutcome {
        let now = reading.received_at;

        match self.admission.observe(&reading.device_key, now) {
            Admission::Pending(count) => {
                tracing::debug!(
                    device = %reading.device_key,
                    sightings = count,
                    "device pending admission; reading dropped"
                );
                return IngestOutcome::Pending(count);
            }
            Admission::Admitted => {}
        }

        // A helmet that loses GPS lock reports (0,0); keep showing its
        // last good fix rather than jumping the marker to the gulf of
        // Guinea.
        if reading.position().is_none() {
            let previous = self
                .cache
                .get(&reading.device_key)
                .and_then(|entry| entry.reading.position());
            match previous {
                Some((lat, lon)) => {
                    reading.lat = Some(lat);
                    reading.lon = Some(lon);
                    tracing::warn!(
                        device = %reading.device_key,
                        "GPS fix lost; carrying cached position forward"
                    );
                }
                None => {
                    if reading.lat.is_some() || reading.lon.is_some() {
                        tracing::warn!(
                            device = %reading.device_key,
                            "GPS fix lost; no cached position available"
                        );
                    }
                    reading.lat = None;
                    reading.lon = None;
                }
            }
        }

        if let (Some(rssi), Some(snr)) = (reading.rssi, reading.snr) {
            if rssi < -120 {
                tracing::warn!(device = %reading.device_key, rssi, snr, "weak LoRa signal");
            }
        }

        self.cache.put(reading.clone());

        let state =
            classifier::classify_reading(&reading, now, self.offline_threshold, &self.thresholds);
        self.broadcaster.publish(
            TOPIC_POSITION,
            EngineEvent::Presence(PresenceEvent {
                reading: reading.clone(),
                state,
            }),
        );

        for condition in triggered_conditions(&reading, &self.thresholds) {
            if self
                .debounce
                .should_notify(&reading.device_key, condition.class, now)
            {
                tracing::warn!(
                    device = %reading.device_key,
                    condition = ?condition.class,
                    detail = %condition.detail,
                    "alert raised"
                );
                self.broadcaster.publish(
                    TOPIC_ALERTS,
                    EngineEvent::Alert(AlertEvent {
                        device_key: reading.device_key.clone(),
                        condition: condition.class,
                        detail: condition.detail,
                        lat: reading.lat,
                        lon: reading.lon,
                        worker: reading.worker.clone(),
                        raised_at: now,
                    }),
                );
            } else {
                tracing::debug!(
                    device = %reading.device_key,
                    condition = ?condition.class,
                    "alert suppressed by cooldown"
                );
            }
        }

        IngestOutcome::Cached(state)
    }
}
