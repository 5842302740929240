use crate::config::Config;
use crate::payload::PayloadService;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Topic layout: `{prefix}/{deviceModel}/{reference}/payload`.
pub async fn run_listener(config: Config, service: Arc<PayloadService>) -> Result<()> {
    let payload_filter = format!("{}/+/+/payload", config.mqtt_topic_prefix);
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
            .subscribe(payload_filter.clone(), QoS::AtLeastOnce)
            .await
        {
            Ok(_) => tracing::info!(topic=%payload_filter, "subscribed to payload feed"),
            Err(err) => {
                tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let parts: Vec<&str> = publish.topic.split('/').collect();
                    if parts.len() != 4 || parts[3] != "payload" {
                        tracing::warn!(topic=%publish.topic, "ignoring unexpected topic");
                        continue;
                    }
                    let (device_model, reference) = (parts[1], parts[2]);

                    let mut payload = publish.payload.to_vec();
                    let payload: serde_json::Value =
                        match simd_json::serde::from_slice(&mut payload) {
                            Ok(value) => value,
                            Err(err) => {
                                tracing::warn!(
                                    error=%err,
                                    topic=%publish.topic,
                                    "failed to decode MQTT payload"
                                );
                                continue;
                            }
                        };

                    if let Err(err) = service.receive(device_model, reference, payload).await {
                        tracing::warn!(
                            error=%err,
                            device_model,
                            reference,
                            "failed to ingest payload"
                        );
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
