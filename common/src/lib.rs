pub mod config;
pub mod engine;
pub mod telemetry;
pub mod types;

pub use config::{NetworkConfig, NodeConfig, PinConfig, TelemetryConfig};
pub use engine::{NodeAction, NodeEngine, SampleError, RELAY_ON_ABOVE_C};
pub use telemetry::{format_timestamp, round1, TelemetryFrame, TIMESTAMP_UNKNOWN};
pub use types::{
    Command, LinkState, SensorSample, SocketEvent, CMD_LED_OFF, CMD_LED_ON, HANDSHAKE_TOKEN,
};
