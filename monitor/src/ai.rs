use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use envmon_common::{AiConfig, Channel, MonitorError, TelemetryBuffer};

/// Hard deadline for one completion round trip.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone)]
struct ChannelReport {
    latest: f64,
    min: f64,
    max: f64,
}

/// Point-in-time view of the telemetry window, captured under the buffer
/// lock and handed to the assistant without holding it.
#[derive(Debug, Clone)]
pub struct EnvironmentSnapshot {
    taken_at: String,
    reports: Vec<(Channel, ChannelReport)>,
}

impl EnvironmentSnapshot {
    pub fn capture(buffer: &TelemetryBuffer, taken_at: String) -> Self {
        let reports = Channel::CHARTED
            .iter()
            .filter_map(|&channel| {
                let stats = buffer.stats(channel)?;
                let latest = buffer.latest(channel)?;
                Some((
                    channel,
                    ChannelReport {
                        latest,
                        min: stats.min,
                        max: stats.max,
                    },
                ))
            })
            .collect();
        Self { taken_at, reports }
    }

    fn report(&self, channel: Channel) -> Option<&ChannelReport> {
        self.reports
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, report)| report)
    }
}

/// One line per channel. Extremes are shown where the dashboard shows
/// them; wind and illumination are current-value only.
fn prompt_line(snapshot: &EnvironmentSnapshot, label: &str, channel: Channel, extremes: bool) -> String {
    let unit = channel.unit();
    match snapshot.report(channel) {
        Some(report) if extremes => format!(
            "- {label}: {} {unit} (max {} {unit}, min {} {unit})",
            report.latest, report.max, report.min
        ),
        Some(report) => format!("- {label}: {} {unit}", report.latest),
        None => format!("- {label}: unknown"),
    }
}

fn build_system_prompt(snapshot: &EnvironmentSnapshot) -> String {
    let mut lines = vec![
        "You are an environmental monitoring assistant analyzing campus outdoor sensor data."
            .to_string(),
        String::new(),
        "Current outdoor readings:".to_string(),
    ];
    lines.push(prompt_line(snapshot, "temperature", Channel::Temperature, true));
    lines.push(prompt_line(snapshot, "humidity", Channel::Humidity, true));
    lines.push(prompt_line(snapshot, "wind speed", Channel::WindSpeed, false));
    lines.push(prompt_line(snapshot, "illumination", Channel::Illumination, false));
    lines.push(prompt_line(snapshot, "PM2.5", Channel::Pm25, true));
    lines.push(prompt_line(snapshot, "UV index", Channel::Sunray, true));
    lines.push(format!("- sampled at: {}", snapshot.taken_at));
    lines.push(String::new());
    lines.push("Your responsibilities:".to_string());
    lines.push("1. Assess the overall conditions using every reading, including the sample time".to_string());
    lines.push("2. Judge how plausible and comfortable the current values are".to_string());
    lines.push("3. Point out potential problems or anomalies".to_string());
    lines.push("4. Give practical suggestions for improvement".to_string());
    lines.push("5. Keep answers short and plain, under 300 words".to_string());
    lines.push(String::new());
    lines.push(
        "If the user asks about something unrelated to the environment, politely say you only \
         analyze environment data. Base every statement on the readings above and never invent \
         values."
            .to_string(),
    );
    lines.join("\n")
}

/// Chat client for the LLM completion endpoint. Keeps a rolling history so
/// follow-up questions carry context.
pub struct Assistant {
    http: reqwest::Client,
    config: AiConfig,
    api_key: Option<String>,
    history: Vec<ChatMessage>,
}

impl Assistant {
    pub fn new(mut config: AiConfig, api_key: Option<String>, model_override: Option<String>) -> Self {
        config.sanitize();
        if let Some(model) = model_override {
            if !model.trim().is_empty() {
                config.model = model;
            }
        }
        Self {
            http: reqwest::Client::new(),
            config,
            api_key,
            history: Vec::new(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn set_api_key(&mut self, key: String) {
        self.api_key = Some(key);
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_messages(&self, system_prompt: String, user_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.config.context_messages + 2);
        messages.push(ChatMessage {
            role: "system",
            content: system_prompt,
        });
        let tail = self.history.len().saturating_sub(self.config.context_messages);
        messages.extend(self.history[tail..].iter().cloned());
        messages.push(ChatMessage {
            role: "user",
            content: user_message.to_string(),
        });
        messages
    }

    fn remember(&mut self, user_message: &str, reply: &str) {
        self.history.push(ChatMessage {
            role: "user",
            content: user_message.to_string(),
        });
        self.history.push(ChatMessage {
            role: "assistant",
            content: reply.to_string(),
        });
        while self.history.len() > self.config.history_limit {
            self.history.remove(0);
        }
    }

    pub async fn ask(
        &mut self,
        user_message: &str,
        snapshot: &EnvironmentSnapshot,
    ) -> Result<String, MonitorError> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(MonitorError::validation("assistant API key is not configured"));
        };

        let messages = self.build_messages(build_system_prompt(snapshot), user_message);
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&api_key)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    MonitorError::Timeout(REQUEST_TIMEOUT_SECS * 1_000)
                } else {
                    MonitorError::transport(err)
                }
            })?;

        let status = response.status();
        let json: Value = response.json().await.map_err(MonitorError::transport)?;
        if !status.is_success() {
            let detail = json
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(MonitorError::Transport(format!("HTTP {status}: {detail}")));
        }

        let reply = json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(|content| content.trim().to_string())
            .unwrap_or_else(|| "no response content".to_string());

        self.remember(user_message, &reply);
        Ok(reply)
    }
}
