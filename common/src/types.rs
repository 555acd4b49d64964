use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Temperature,
    Humidity,
    WindSpeed,
    Illumination,
    Pm25,
    Sunray,
    Pressure,
    Altitude,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Self::Temperature,
        Self::Humidity,
        Self::WindSpeed,
        Self::Illumination,
        Self::Pm25,
        Self::Sunray,
        Self::Pressure,
        Self::Altitude,
    ];

    /// The six channels shown in the chart view and exported to CSV.
    pub const CHARTED: [Channel; 6] = [
        Self::Temperature,
        Self::Humidity,
        Self::WindSpeed,
        Self::Illumination,
        Self::Pm25,
        Self::Sunray,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Temperature => 0,
            Self::Humidity => 1,
            Self::WindSpeed => 2,
            Self::Illumination => 3,
            Self::Pm25 => 4,
            Self::Sunray => 5,
            Self::Pressure => 6,
            Self::Altitude => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::WindSpeed => "windSpeed",
            Self::Illumination => "illumination",
            Self::Pm25 => "pm25",
            Self::Sunray => "sunray",
            Self::Pressure => "pressure",
            Self::Altitude => "altitude",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "C",
            Self::Humidity => "%",
            Self::WindSpeed => "m/s",
            Self::Illumination => "lux",
            Self::Pm25 => "ug/m3",
            Self::Sunray => "UVI",
            Self::Pressure => "kPa",
            Self::Altitude => "m",
        }
    }

    /// Converts a raw fixed-point wire value to engineering units.
    /// Applied exactly once, at ingestion.
    pub fn scale(self, raw: i64) -> f64 {
        match self {
            Self::Temperature | Self::Humidity | Self::WindSpeed | Self::Sunray | Self::Altitude => {
                raw as f64 / 10.0
            }
            Self::Pressure => raw as f64 / 1000.0,
            Self::Illumination | Self::Pm25 => raw as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

impl TrendDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Flat => "flat",
        }
    }

    pub fn arrow(self) -> &'static str {
        match self {
            Self::Up => "↑",
            Self::Down => "↓",
            Self::Flat => "→",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelStats {
    pub min: f64,
    pub max: f64,
    pub trend: TrendDirection,
}

/// Coarse history range selector; encoded on the wire as 6/24/7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeSelector {
    #[serde(rename = "6hours")]
    SixHours,
    #[serde(rename = "1day")]
    OneDay,
    #[serde(rename = "1week")]
    OneWeek,
}

impl Default for RangeSelector {
    fn default() -> Self {
        Self::OneDay
    }
}

impl RangeSelector {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SixHours => "6hours",
            Self::OneDay => "1day",
            Self::OneWeek => "1week",
        }
    }

    pub fn wire_number(self) -> u32 {
        match self {
            Self::SixHours => 6,
            Self::OneDay => 24,
            Self::OneWeek => 7,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "6hours" => Some(Self::SixHours),
            "1day" => Some(Self::OneDay),
            "1week" => Some(Self::OneWeek),
            _ => None,
        }
    }
}

/// Raw telemetry payload as published on `environment/data`.
/// Sensor values are fixed-point integers; see [`Channel::scale`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<i64>,
    #[serde(rename = "windSpeed", skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub illumination: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm25: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sunray: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stm_ver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub esp_ver: Option<String>,
}

impl TelemetryReading {
    pub fn raw(&self, channel: Channel) -> Option<i64> {
        match channel {
            Channel::Temperature => self.temperature,
            Channel::Humidity => self.humidity,
            Channel::WindSpeed => self.wind_speed,
            Channel::Illumination => self.illumination,
            Channel::Pm25 => self.pm25,
            Channel::Sunray => self.sunray,
            Channel::Pressure => self.pressure,
            Channel::Altitude => self.altitude,
        }
    }
}

/// Firmware versions the device tags onto its telemetry payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceVersions {
    pub stm: Option<String>,
    pub esp: Option<String>,
}

impl DeviceVersions {
    /// Merge semantics match the dashboard's latest-data cache: absent
    /// fields keep their previous value.
    pub fn merge_from(&mut self, reading: &TelemetryReading) -> bool {
        let mut changed = false;
        if let Some(stm) = &reading.stm_ver {
            if self.stm.as_deref() != Some(stm) {
                self.stm = Some(stm.clone());
                changed = true;
            }
        }
        if let Some(esp) = &reading.esp_ver {
            if self.esp.as_deref() != Some(esp) {
                self.esp = Some(esp.clone());
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub number: u32,
}

/// One historical record as published on `environment/history`.
/// Hourly records carry `hour`; daily records omit it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default)]
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hour: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<i64>,
    #[serde(rename = "windSpeed", skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub illumination: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm25: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sunray: Option<i64>,
}

impl HistoryRecord {
    pub fn raw(&self, channel: Channel) -> Option<i64> {
        match channel {
            Channel::Temperature => self.temperature,
            Channel::Humidity => self.humidity,
            Channel::WindSpeed => self.wind_speed,
            Channel::Illumination => self.illumination,
            Channel::Pm25 => self.pm25,
            Channel::Sunray => self.sunray,
            Channel::Pressure | Channel::Altitude => None,
        }
    }

    /// Builds the chart time label: `"MM-DD HH:00"` for hourly records,
    /// `"MM-DD"` for daily ones. Live labels never contain a dash, which
    /// is what distinguishes the two origins during a historical merge.
    /// Records without a usable `YYYYMMDD` date fall back to the caller's
    /// current-time label.
    pub fn time_label(&self, fallback: &str) -> String {
        let (month, day) = match (self.date.get(4..6), self.date.get(6..8)) {
            (Some(month), Some(day)) => (month, day),
            _ => return fallback.to_string(),
        };
        match self.hour {
            Some(hour) => format!("{month}-{day} {hour:02}:00"),
            None => format!("{month}-{day}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub data: Vec<HistoryRecord>,
}

/// Device-control message on `environment/con`. `DriveStatus` encodes the
/// origin: 1 is a dashboard command, 0 is device-reported state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "Auto", skip_serializing_if = "Option::is_none")]
    pub auto: Option<u8>,
    #[serde(rename = "Light", skip_serializing_if = "Option::is_none")]
    pub light: Option<u8>,
    #[serde(rename = "DriveStatus", skip_serializing_if = "Option::is_none")]
    pub drive_status: Option<u8>,
}

impl ControlMessage {
    pub fn command(auto: u8, light: u8) -> Self {
        Self {
            auto: Some(auto),
            light: Some(light),
            drive_status: Some(1),
        }
    }

    pub fn device_state(auto: u8, light: u8) -> Self {
        Self {
            auto: Some(auto),
            light: Some(light),
            drive_status: Some(0),
        }
    }

    pub fn is_device_state(&self) -> bool {
        self.drive_status == Some(0)
    }
}

/// Local cache of the last known device-control state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    pub auto: u8,
    pub light: u8,
}

impl ControlState {
    /// Applies a device-originated message; dashboard echoes
    /// (`DriveStatus == 1`) are ignored to avoid state flapping.
    pub fn apply(&mut self, message: &ControlMessage) -> bool {
        if !message.is_device_state() {
            return false;
        }
        if let Some(auto) = message.auto {
            self.auto = auto;
        }
        if let Some(light) = message.light {
            self.light = light;
        }
        true
    }
}

/// Request envelope published on `Get/AI_API`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub timestamp: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub message: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

/// Reply envelope received on `Set/AI_API`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
