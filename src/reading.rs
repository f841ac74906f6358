use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One normalized helmet telemetry sample. Everything except the device
/// key is optional: a partially-populated reading is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReading {
    pub device_key: String,
    /// Device-reported measurement time. Helmet clocks drift (or are
    /// absent entirely), so this is carried for display only and never
    /// used for staleness.
    pub producer_timestamp: Option<DateTime<Utc>>,
    /// Ingestion-side arrival time; the sole input to freshness checks.
    pub received_at: DateTime<Utc>,
    pub battery: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub fall_detected: bool,
    pub help_request: bool,
    pub counter: Option<i64>,
    pub worker: Option<String>,
    pub rssi: Option<i64>,
    pub snr: Option<f64>,
}

impl DeviceReading {
    /// The reading's GPS fix, if it is usable. Helmets report (0, 0)
    /// when they lose GPS lock, and LoRa corruption can produce
    /// out-of-range coordinates; both count as "no fix".
    pub fn position(&self) -> Option<(f64, f64)> {
        let (lat, lon) = (self.lat?, self.lon?);
        if lat == 0.0 && lon == 0.0 {
            return None;
        }
        if lat.abs() > 90.0 || lon.abs() > 180.0 {
            return None;
        }
        Some((lat, lon))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] simd_json::Error),
    #[error("payload missing device key")]
    MissingDeviceKey,
}

#[derive(Debug, Deserialize)]
struct WireReading<'a> {
    #[serde(default, borrow)]
    mac: Option<&'a str>,
    #[serde(default, borrow)]
    timestamp: Option<WireTimestamp<'a>>,
    #[serde(default)]
    battery: Option<f64>,
    #[serde(default)]
    voltage: Option<f64>,
    #[serde(default)]
    current: Option<f64>,
    #[serde(default)]
    power: Option<f64>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default, rename = "fallDetected")]
    fall_detected: Option<WireFlag>,
    #[serde(default, rename = "helpRequest")]
    help_request: Option<WireFlag>,
    #[serde(default)]
    counter: Option<i64>,
    #[serde(default, borrow)]
    worker: Option<&'a str>,
    #[serde(default)]
    rssi: Option<i64>,
    #[serde(default)]
    snr: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> WireTimestamp<'a> {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            WireTimestamp::Int(ms) => millis_to_dt(*ms),
            WireTimestamp::Float(secs) => millis_to_dt((*secs * 1000.0) as i64),
        }
    }
}

// Helmets firmware sends 0/1, the gateway rewrites to booleans.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFlag {
    Bool(bool),
    Int(i64),
}

impl WireFlag {
    fn as_bool(&self) -> bool {
        match self {
            WireFlag::Bool(b) => *b,
            WireFlag::Int(i) => *i != 0,
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    let secs = ms / 1000;
    let nanos = ((ms % 1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Normalize a raw ingest payload into a [`DeviceReading`].
///
/// Only the `mac` field is required; anything else missing defaults to
/// absent. Callers stamp `received_at` once at arrival so every
/// downstream freshness computation sees the same instant.
pub fn parse_reading(
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<DeviceReading, ParseError> {
    let wire: WireReading = simd_json::from_slice(payload)?;

    let device_key = wire
        .mac
        .map(str::trim)
        .filter(|mac| !mac.is_empty())
        .ok_or(ParseError::MissingDeviceKey)?
        .to_string();

    let producer_timestamp = wire.timestamp.as_ref().and_then(|ts| ts.to_datetime());

    Ok(DeviceReading {
        device_key,
        producer_timestamp,
        received_at,
        battery: wire.battery,
        voltage: wire.voltage,
        current: wire.current,
        power: wire.power,
        lat: wire.lat,
        lon: wire.lon,
        fall_detected: wire.fall_detected.map(|f| f.as_bool()).unwrap_or(false),
        help_request: wire.help_request.map(|f| f.as_bool()).unwrap_or(false),
        counter: wire.counter,
        worker: wire.worker.map(|w| w.trim().to_string()).filter(|w| !w.is_empty()),
        rssi: wire.rssi,
        snr: wire.snr,
    })
}
