use serde::{Deserialize, Serialize};

use crate::types::RangeSelector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub clean_session: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            clean_session: true,
        }
    }
}

impl BrokerConfig {
    pub fn sanitize(&mut self) {
        if self.host.trim().is_empty() {
            self.host = "localhost".to_string();
        }
        if self.port == 0 {
            self.port = 1883;
        }
        self.keep_alive_secs = self.keep_alive_secs.clamp(5, 300);
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(1, 60);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub max_retries: u32,
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            max_interval_ms: 30_000,
            multiplier: 1.5,
            max_retries: 3,
            jitter: 0.1,
        }
    }
}

impl ReconnectConfig {
    pub fn sanitize(&mut self) {
        if self.base_interval_ms == 0 {
            self.base_interval_ms = 1_000;
        }
        if self.max_interval_ms < self.base_interval_ms {
            self.max_interval_ms = self.base_interval_ms;
        }
        if self.multiplier < 1.0 {
            self.multiplier = 1.0;
        }
        self.jitter = self.jitter.clamp(0.0, 1.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub live_capacity: usize,
    pub history_capacity: usize,
    pub trend_lookback: usize,
    pub trend_epsilon: f64,
    pub redraw_min_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            live_capacity: 25,
            history_capacity: 240,
            trend_lookback: 5,
            trend_epsilon: 0.1,
            redraw_min_interval_ms: 500,
        }
    }
}

impl BufferConfig {
    pub fn sanitize(&mut self) {
        if self.live_capacity == 0 {
            self.live_capacity = 25;
        }
        if self.history_capacity < self.live_capacity {
            self.history_capacity = self.live_capacity;
        }
        if self.trend_lookback == 0 {
            self.trend_lookback = 5;
        }
        if self.trend_epsilon < 0.0 {
            self.trend_epsilon = 0.0;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub history_limit: usize,
    pub context_messages: usize,
    pub key_fetch_timeout_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://ark.cn-beijing.volces.com/api/v3/chat/completions".to_string(),
            model: "doubao-seed-1-6-flash-250828".to_string(),
            max_tokens: 500,
            temperature: 0.7,
            history_limit: 20,
            context_messages: 6,
            key_fetch_timeout_ms: 3_000,
        }
    }
}

impl AiConfig {
    pub fn sanitize(&mut self) {
        if self.max_tokens == 0 {
            self.max_tokens = 500;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);
        // History is stored as user/assistant pairs.
        if self.history_limit < 2 {
            self.history_limit = 2;
        }
        if self.context_messages > self.history_limit {
            self.context_messages = self.history_limit;
        }
        if self.key_fetch_timeout_ms == 0 {
            self.key_fetch_timeout_ms = 3_000;
        }
    }
}

/// User preferences persisted across sessions. The broker password is
/// deliberately absent; it is supplied per session and never written out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Preferences {
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub username: Option<String>,
    pub range: RangeSelector,
    pub chart_smooth: bool,
    pub ai_api_key: Option<String>,
    pub ai_model: Option<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            broker_host: None,
            broker_port: None,
            username: None,
            range: RangeSelector::OneDay,
            chart_smooth: true,
            ai_api_key: None,
            ai_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub broker: BrokerConfig,
    pub reconnect: ReconnectConfig,
    pub buffer: BufferConfig,
    #[serde(default)]
    pub ai: AiConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            reconnect: ReconnectConfig::default(),
            buffer: BufferConfig::default(),
            ai: AiConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.broker.sanitize();
        self.reconnect.sanitize();
        self.buffer.sanitize();
        self.ai.sanitize();
    }
}
