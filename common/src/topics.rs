pub const TOPIC_TELEMETRY: &str = "environment/data";
pub const TOPIC_HISTORY_REQUEST: &str = "environment/set";
pub const TOPIC_HISTORY_DATA: &str = "environment/history";
pub const TOPIC_DEVICE_CONTROL: &str = "environment/con";

pub const TOPIC_AI_REQUEST: &str = "Get/AI_API";
pub const TOPIC_AI_RESPONSE: &str = "Set/AI_API";

/// Transport packet ceiling configured on both ends. rumqttc defaults to
/// 10 KiB, well under the ~28 KB a full 240-record history batch needs.
pub const MAX_MQTT_PAYLOAD_BYTES: usize = 64 * 1024;
