//! Topic-keyed fan-out of presence deltas and gated alerts.
//!
//! The broadcaster conveys *changes*; the presence cache conveys
//! *current state*. A subscriber connecting after an event misses it
//! and is expected to snapshot via `PresenceCache::get_all` before
//! following deltas. If a subscriber falls behind and its buffer fills,
//! old events are dropped (`RecvError::Lagged`); publishing never
//! blocks the ingest path.

use crate::presence::{ConditionClass, DeviceState};
use crate::reading::DeviceReading;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

pub const TOPIC_POSITION: &str = "helmet/position";
pub const TOPIC_ALERTS: &str = "helmet/alerts";

/// A device's reading plus its derived state, published on every cache
/// write and on online/offline transitions.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PresenceEvent {
    pub reading: DeviceReading,
    pub state: DeviceState,
}

/// An alert that already passed the debounce gate; the external
/// notification dispatcher subscribes to these and owns delivery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertEvent {
    pub device_key: String,
    pub condition: ConditionClass,
    pub detail: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub worker: Option<String>,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Presence(PresenceEvent),
    Alert(AlertEvent),
}

/// Fire-and-forget fan-out to all current subscribers of a named topic.
#[derive(Debug)]
pub struct Broadcaster {
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<EngineEvent>>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Publish to a topic; returns how many subscribers received the
    /// event. No subscribers (or no such topic yet) is not an error,
    /// the event simply evaporates.
    pub fn publish(&self, topic: &str, event: EngineEvent) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        match topics.get(topic) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to a topic, creating its channel on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<EngineEvent> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn presence_event(key: &str) -> EngineEvent {
        EngineEvent::Presence(PresenceEvent {
            reading: DeviceReading {
                device_key: key.to_string(),
                producer_timestamp: None,
                received_at: Utc::now(),
                battery: None,
                voltage: None,
                current: None,
                power: None,
                lat: None,
                lon: None,
                fall_detected: false,
                help_request: false,
                counter: None,
                worker: None,
                rssi: None,
                snr: None,
            },
            state: DeviceState::Active,
        })
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let broadcaster = Broadcaster::new(8);
        assert_eq!(broadcaster.publish(TOPIC_POSITION, presence_event("AA:BB")), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_per_topic() {
        let broadcaster = Broadcaster::new(8);
        let mut positions = broadcaster.subscribe(TOPIC_POSITION);
        let mut alerts = broadcaster.subscribe(TOPIC_ALERTS);

        assert_eq!(broadcaster.publish(TOPIC_POSITION, presence_event("AA:BB")), 1);

        let event = positions.recv().await.expect("event");
        match event {
            EngineEvent::Presence(p) => assert_eq!(p.reading.device_key, "AA:BB"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(alerts.try_recv().is_err());
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_value(presence_event("AA:BB")).expect("serialized");
        assert_eq!(json["type"], "presence");
        assert_eq!(json["reading"]["device_key"], "AA:BB");
        assert_eq!(json["state"], "active");

        let alert = EngineEvent::Alert(AlertEvent {
            device_key: "AA:BB".to_string(),
            condition: ConditionClass::HelpRequest,
            detail: "help requested".to_string(),
            lat: None,
            lon: None,
            worker: None,
            raised_at: Utc::now(),
        });
        let json = serde_json::to_value(alert).expect("serialized");
        assert_eq!(json["type"], "alert");
        assert_eq!(json["condition"], "help_request");
    }

    #[tokio::test]
    async fn slow_subscriber_loses_oldest_events() {
        let broadcaster = Broadcaster::new(2);
        let mut rx = broadcaster.subscribe(TOPIC_POSITION);

        for i in 0..4 {
            broadcaster.publish(TOPIC_POSITION, presence_event(&format!("dev-{i}")));
        }

        // The first recv reports the lag, then delivery resumes from
        // the oldest retained event.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 2),
            other => panic!("expected lag, got {other:?}"),
        }
        match rx.recv().await.expect("event") {
            EngineEvent::Presence(p) => assert_eq!(p.reading.device_key, "dev-2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
