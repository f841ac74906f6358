use crate::config::Config;
use crate::presence::PresenceEngine;
use crate::reading::parse_reading;
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

/// MQTT ingest loop: subscribe to the helmet telemetry feed, normalize
/// each publish, and hand it to the engine. Reconnects forever; a
/// single bad payload is dropped and logged, never fatal.
pub async fn run_listener(config: Config, engine: PresenceEngine) -> Result<()> {
    let telemetry_filter = format!("{}/+/telemetry", config.mqtt_topic_prefix);
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        match client
            .subscribe(telemetry_filter.clone(), QoS::AtLeastOnce)
            .await
        {
            Ok(_) => {
                tracing::info!(topic = %telemetry_filter, "subscribed to helmet telemetry feed");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let received_at = Utc::now();
                    let mut payload = publish.payload.to_vec();
                    match parse_reading(&mut payload, received_at) {
                        Ok(reading) => {
                            engine.ingest(reading);
                        }
                        Err(err) => {
                            tracing::warn!(
                                error = %err,
                                topic = %publish.topic,
                                "dropping unreadable helmet payload"
                            );
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
