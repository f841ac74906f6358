use crate::presence::HealthThresholds;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Runtime configuration, sourced from `HELMET_*` environment variables
/// with production defaults.
///
/// Every timeout in the system lives here under one name. The offline
/// threshold is consumed by both the read-path classifier and the
/// sweeper so the two can never disagree about what "offline" means;
/// the cache TTL is the separate hard-eviction bound (hours, not
/// seconds) after which a silent device is forgotten entirely.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub offline_threshold_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub admission_threshold: u32,
    pub admission_gap_seconds: u64,
    pub admission_idle_seconds: u64,
    pub alert_cooldown_seconds: u64,
    pub battery_low_percent: f64,
    pub voltage_low_volts: f64,
    pub current_high_amps: f64,
    pub broadcast_capacity: usize,
    pub otlp_endpoint: Option<String>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("HELMET_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("HELMET_DATABASE_URL or DATABASE_URL is required")?;
        let db_pool_size = env_u64("HELMET_DB_POOL_SIZE", 5) as u32;

        let mqtt_host = env::var("HELMET_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = env::var("HELMET_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(1883);
        let mqtt_username = env::var("HELMET_MQTT_USERNAME").ok();
        let mqtt_password = env::var("HELMET_MQTT_PASSWORD").ok();
        let mqtt_topic_prefix =
            env::var("HELMET_MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "helmet".to_string());
        let mqtt_keepalive_secs = env_u64("HELMET_MQTT_KEEPALIVE_SECS", 30);
        let mqtt_client_id = env::var("HELMET_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("helmet-presence-{}", std::process::id()));
        let enable_mqtt_listener = env::var("HELMET_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let offline_threshold_seconds = env_u64("HELMET_OFFLINE_THRESHOLD_SECONDS", 30);
        let sweep_interval_seconds = env_u64("HELMET_SWEEP_INTERVAL_SECONDS", 60);
        let cache_ttl_seconds = env_u64("HELMET_CACHE_TTL_SECONDS", 12 * 60 * 60);
        let admission_threshold = env_u64("HELMET_ADMISSION_THRESHOLD", 3).max(1) as u32;
        let admission_gap_seconds = env_u64("HELMET_ADMISSION_GAP_SECONDS", 10);
        let admission_idle_seconds = env_u64("HELMET_ADMISSION_IDLE_SECONDS", 30 * 60);
        let alert_cooldown_seconds = env_u64("HELMET_ALERT_COOLDOWN_SECONDS", 60);

        let battery_low_percent = env_f64("HELMET_BATTERY_LOW_PERCENT", 20.0);
        let voltage_low_volts = env_f64("HELMET_VOLTAGE_LOW_VOLTS", 10.0);
        let current_high_amps = env_f64("HELMET_CURRENT_HIGH_AMPS", 50.0);

        let broadcast_capacity = env_u64("HELMET_BROADCAST_CAPACITY", 100).max(1) as usize;
        let otlp_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

        Ok(Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            enable_mqtt_listener,
            offline_threshold_seconds,
            sweep_interval_seconds,
            cache_ttl_seconds,
            admission_threshold,
            admission_gap_seconds,
            admission_idle_seconds,
            alert_cooldown_seconds,
            battery_low_percent,
            voltage_low_volts,
            current_high_amps,
            broadcast_capacity,
            otlp_endpoint,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn admission_gap(&self) -> Duration {
        Duration::from_secs(self.admission_gap_seconds)
    }

    pub fn admission_idle_window(&self) -> Duration {
        Duration::from_secs(self.admission_idle_seconds)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_seconds)
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            battery_low: self.battery_low_percent,
            voltage_low: self.voltage_low_volts,
            current_high: self.current_high_amps,
        }
    }
}
