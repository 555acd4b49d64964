pub mod buffer;
pub mod config;
pub mod correlator;
pub mod error;
pub mod export;
pub mod reconnect;
pub mod session;
pub mod topics;
pub mod types;

pub use buffer::{RedrawDecision, RedrawGate, TelemetryBuffer};
pub use config::{
    AiConfig, BrokerConfig, BufferConfig, Preferences, ReconnectConfig, RuntimeConfig,
};
pub use correlator::{PendingRequest, RequestCorrelator, RequestPurpose, KEY_FETCH_MARKER};
pub use error::MonitorError;
pub use reconnect::{ReconnectDecision, Reconnector};
pub use session::{Role, UserSession};
pub use topics::*;
pub use types::{
    AiRequest, AiResponse, Channel, ChannelStats, ConnectionState, ControlMessage, ControlState,
    DeviceVersions, HistoryRecord, HistoryRequest, HistoryResponse, RangeSelector,
    TelemetryReading, TrendDirection,
};
