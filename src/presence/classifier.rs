use super::cache::PresenceCacheEntry;
use crate::reading::DeviceReading;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Presence/health state of a device, derived on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Active,
    Inactive,
    Alert,
}

/// Telemetry danger thresholds, centralized in [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub battery_low: f64,
    pub voltage_low: f64,
    pub current_high: f64,
}

/// Notification condition class, debounced independently per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionClass {
    DeviceFault,
    Fall,
    HelpRequest,
}

/// A condition a reading tripped, with a human-readable detail for the
/// notification dispatcher.
#[derive(Debug, Clone)]
pub struct TriggeredCondition {
    pub class: ConditionClass,
    pub detail: String,
}

/// Derive a device's state from its cache entry.
///
/// Staleness dominates telemetry: a device that stopped reporting at or
/// past the offline threshold is inactive, never alerting, no matter
/// what its last telemetry values were. Evaluated on read so threshold
/// tuning never requires cache invalidation.
pub fn classify(
    entry: &PresenceCacheEntry,
    now: DateTime<Utc>,
    offline_threshold: ChronoDuration,
    thresholds: &HealthThresholds,
) -> DeviceState {
    classify_reading(&entry.reading, now, offline_threshold, thresholds)
}

pub fn classify_reading(
    reading: &DeviceReading,
    now: DateTime<Utc>,
    offline_threshold: ChronoDuration,
    thresholds: &HealthThresholds,
) -> DeviceState {
    if now - reading.received_at >= offline_threshold {
        return DeviceState::Inactive;
    }
    if device_fault_detail(reading, thresholds).is_some() {
        return DeviceState::Alert;
    }
    DeviceState::Active
}

/// Aggregate description of every telemetry threshold breach, or `None`
/// when the reading is healthy. Battery, voltage and current breaches
/// share one condition class (and so one debounce ticket) per device.
pub fn device_fault_detail(
    reading: &DeviceReading,
    thresholds: &HealthThresholds,
) -> Option<String> {
    let mut faults = Vec::new();
    if let Some(battery) = reading.battery {
        if battery < thresholds.battery_low {
            faults.push(format!("battery low: {battery:.1}%"));
        }
    }
    if let Some(voltage) = reading.voltage {
        if voltage < thresholds.voltage_low {
            faults.push(format!("voltage low: {voltage:.2}V"));
        }
    }
    if let Some(current) = reading.current {
        if current.abs() > thresholds.current_high {
            faults.push(format!("abnormal current: {current:.2}A"));
        }
    }
    if faults.is_empty() {
        None
    } else {
        Some(faults.join("; "))
    }
}

/// Every notification-worthy condition a reading raises.
pub fn triggered_conditions(
    reading: &DeviceReading,
    thresholds: &HealthThresholds,
) -> Vec<TriggeredCondition> {
    let mut conditions = Vec::new();
    if reading.fall_detected {
        conditions.push(TriggeredCondition {
            class: ConditionClass::Fall,
            detail: "fall detected".to_string(),
        });
    }
    if reading.help_request {
        conditions.push(TriggeredCondition {
            class: ConditionClass::HelpRequest,
            detail: "help requested".to_string(),
        });
    }
    if let Some(detail) = device_fault_detail(reading, thresholds) {
        conditions.push(TriggeredCondition {
            class: ConditionClass::DeviceFault,
            detail,
        });
    }
    conditions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            battery_low: 20.0,
            voltage_low: 10.0,
            current_high: 50.0,
        }
    }

    fn reading(battery: Option<f64>, received_at: DateTime<Utc>) -> DeviceReading {
        DeviceReading {
            device_key: "AA:BB".to_string(),
            producer_timestamp: None,
            received_at,
            battery,
            voltage: Some(12.0),
            current: Some(1.0),
            power: None,
            lat: None,
            lon: None,
            fall_detected: false,
            help_request: false,
            counter: None,
            worker: None,
            rssi: None,
            snr: None,
        }
    }

    #[test]
    fn fresh_low_battery_is_alert_stale_is_inactive() {
        let t = Utc::now();
        let threshold = ChronoDuration::seconds(30);
        let low_battery = reading(Some(15.0), t);

        let state = classify_reading(&low_battery, t + ChronoDuration::seconds(5), threshold, &thresholds());
        assert_eq!(state, DeviceState::Alert);

        let state = classify_reading(&low_battery, t + ChronoDuration::seconds(35), threshold, &thresholds());
        assert_eq!(state, DeviceState::Inactive);
    }

    #[test]
    fn age_exactly_at_threshold_is_inactive() {
        let t = Utc::now();
        let threshold = ChronoDuration::seconds(30);
        let healthy = reading(Some(90.0), t);

        let state = classify_reading(&healthy, t + ChronoDuration::seconds(30), threshold, &thresholds());
        assert_eq!(state, DeviceState::Inactive);

        let state = classify_reading(&healthy, t + ChronoDuration::milliseconds(29_999), threshold, &thresholds());
        assert_eq!(state, DeviceState::Active);
    }

    #[test]
    fn current_breach_uses_magnitude() {
        let t = Utc::now();
        let mut r = reading(Some(90.0), t);
        r.current = Some(-60.0);
        let state = classify_reading(&r, t, ChronoDuration::seconds(30), &thresholds());
        assert_eq!(state, DeviceState::Alert);
        assert!(device_fault_detail(&r, &thresholds())
            .expect("fault")
            .contains("abnormal current"));
    }

    #[test]
    fn missing_telemetry_fields_are_not_faults() {
        let t = Utc::now();
        let mut r = reading(None, t);
        r.voltage = None;
        r.current = None;
        assert!(device_fault_detail(&r, &thresholds()).is_none());
        assert_eq!(
            classify_reading(&r, t, ChronoDuration::seconds(30), &thresholds()),
            DeviceState::Active
        );
    }

    #[test]
    fn safety_flags_and_faults_report_separate_conditions() {
        let t = Utc::now();
        let mut r = reading(Some(10.0), t);
        r.fall_detected = true;
        r.help_request = true;
        let conditions = triggered_conditions(&r, &thresholds());
        assert_eq!(conditions.len(), 3);
        let classes: Vec<ConditionClass> = conditions.iter().map(|c| c.class).collect();
        assert!(classes.contains(&ConditionClass::Fall));
        assert!(classes.contains(&ConditionClass::HelpRequest));
        assert!(classes.contains(&ConditionClass::DeviceFault));
    }
}
