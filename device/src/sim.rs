use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{Local, NaiveDateTime, Timelike};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{info, warn};

use envmon_common::{
    AiRequest, AiResponse, ControlMessage, ControlState, HistoryRecord, HistoryRequest,
    HistoryResponse, TelemetryReading, MAX_MQTT_PAYLOAD_BYTES, TOPIC_AI_REQUEST,
    TOPIC_AI_RESPONSE, TOPIC_DEVICE_CONTROL, TOPIC_HISTORY_DATA, TOPIC_HISTORY_REQUEST,
    TOPIC_TELEMETRY,
};

const STM_VERSION: &str = "2.4";
const ESP_VERSION: &str = "1.7";

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let interval_secs = std::env::var("ENVMON_SIM_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(5)
        .max(1);

    let mut mqtt_options = MqttOptions::new("env-device-sim", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }
    // Full history batches outgrow rumqttc's 10 KiB default.
    mqtt_options.set_max_packet_size(MAX_MQTT_PAYLOAD_BYTES, MAX_MQTT_PAYLOAD_BYTES);

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);
    let control = Arc::new(Mutex::new(ControlState::default()));

    {
        let mqtt = mqtt.clone();
        let control = control.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        if let Err(err) =
                            handle_request(&mqtt, &control, &message.topic, &message.payload).await
                        {
                            warn!("request handling error: {err:#}");
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("device sim connected");
                        if let Err(err) = subscribe_request_topics(&mqtt).await {
                            warn!("device sim subscribe failed: {err:#}");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("device sim mqtt poll error: {err}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    info!("device simulator publishing every {interval_secs}s");

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        // Hardware integration point:
        // replace these simulated readings with the STM32 sensor head output.
        let reading = simulated_reading(tick);
        let payload = serde_json::to_vec(&reading)?;
        mqtt.publish(TOPIC_TELEMETRY, QoS::AtMostOnce, false, payload)
            .await
            .context("failed to publish telemetry")?;
    }
}

async fn subscribe_request_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [TOPIC_HISTORY_REQUEST, TOPIC_AI_REQUEST, TOPIC_DEVICE_CONTROL];
    for topic in topics {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

async fn handle_request(
    mqtt: &AsyncClient,
    control: &Arc<Mutex<ControlState>>,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;

    match topic {
        TOPIC_HISTORY_REQUEST => {
            let request: HistoryRequest =
                serde_json::from_str(message).context("bad history request")?;
            let data = build_history(request.number, Local::now().naive_local());
            let count = data.len();
            let response = HistoryResponse {
                client_id: Some(request.client_id),
                data,
            };
            let payload = serde_json::to_vec(&response)?;
            mqtt.publish(TOPIC_HISTORY_DATA, QoS::AtLeastOnce, false, payload)
                .await?;
            info!("served history request ({count} records)");
        }
        TOPIC_AI_REQUEST => {
            let request: AiRequest = serde_json::from_str(message).context("bad api request")?;
            let response = key_response(request, std::env::var("ENVMON_SIM_API_KEY").ok());
            let payload = serde_json::to_vec(&response)?;
            mqtt.publish(TOPIC_AI_RESPONSE, QoS::AtLeastOnce, false, payload)
                .await?;
            info!("served api key request");
        }
        TOPIC_DEVICE_CONTROL => {
            let command: ControlMessage =
                serde_json::from_str(message).context("bad control payload")?;
            // Only dashboard commands are applied; our own state echoes
            // carry DriveStatus 0 and come right back on this topic.
            if command.drive_status != Some(1) {
                return Ok(());
            }
            let state = {
                let mut control = control.lock().await;
                if let Some(auto) = command.auto {
                    control.auto = auto;
                }
                if let Some(light) = command.light {
                    control.light = light;
                }
                *control
            };
            let echo = ControlMessage::device_state(state.auto, state.light);
            let payload = serde_json::to_vec(&echo)?;
            mqtt.publish(TOPIC_DEVICE_CONTROL, QoS::AtLeastOnce, false, payload)
                .await?;
            info!("control applied: Auto={} Light={}", state.auto, state.light);
        }
        _ => {}
    }

    Ok(())
}

fn simulated_reading(tick: u64) -> TelemetryReading {
    TelemetryReading {
        temperature: Some(220 + ((tick % 12) as i64) * 5),
        humidity: Some(540 + ((tick % 9) as i64) * 10),
        wind_speed: Some(18 + ((tick % 7) as i64) * 4),
        illumination: Some(760 + ((tick % 15) as i64) * 40),
        pm25: Some(28 + ((tick % 11) as i64) * 3),
        sunray: Some(30 + ((tick % 6) as i64) * 7),
        pressure: Some(101_325 + ((tick % 5) as i64) * 20),
        altitude: Some(4_520),
        stm_ver: Some(STM_VERSION.to_string()),
        esp_ver: Some(ESP_VERSION.to_string()),
    }
}

/// Builds newest-first records the way the hardware reports them. A
/// request for 7 means one record per day; anything else walks back one
/// hour per record.
fn build_history(number: u32, now: NaiveDateTime) -> Vec<HistoryRecord> {
    let hourly = number != 7;
    let count = number.clamp(1, 240) as i64;

    (0..count)
        .map(|step| {
            let moment = if hourly {
                now - chrono::Duration::hours(step)
            } else {
                now - chrono::Duration::days(step)
            };
            HistoryRecord {
                date: moment.format("%Y%m%d").to_string(),
                hour: hourly.then(|| moment.hour()),
                temperature: Some(210 + (step % 10) * 6),
                humidity: Some(500 + (step % 8) * 15),
                wind_speed: Some(14 + (step % 6) * 5),
                illumination: Some(640 + (step % 12) * 55),
                pm25: Some(22 + (step % 9) * 4),
                sunray: Some(25 + (step % 5) * 9),
            }
        })
        .collect()
}

fn key_response(request: AiRequest, key: Option<String>) -> AiResponse {
    match key {
        Some(key) if !key.trim().is_empty() => AiResponse {
            client_id: Some(request.client_id),
            request_id: Some(request.request_id),
            success: Some(true),
            result: Some(key.trim().to_string()),
            error: None,
        },
        _ => AiResponse {
            client_id: Some(request.client_id),
            request_id: Some(request.request_id),
            success: Some(false),
            result: None,
            error: Some("no API key configured on device".to_string()),
        },
    }
}
