use serde::{Deserialize, Serialize};

/// Literal sent as the first text frame after the socket comes up so the
/// server can tell the device apart from dashboard clients.
pub const HANDSHAKE_TOKEN: &str = "ESP32_CONNECTED";

pub const CMD_LED_ON: &str = "LED_ON";
pub const CMD_LED_OFF: &str = "LED_OFF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    LedOn,
    LedOff,
}

impl Command {
    /// Exact, case-sensitive full-frame match. Anything else is not a
    /// command and the frame is dropped without a reply.
    pub fn parse(body: &str) -> Option<Self> {
        match body {
            CMD_LED_ON => Some(Self::LedOn),
            CMD_LED_OFF => Some(Self::LedOff),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LedOn => CMD_LED_ON,
            Self::LedOff => CMD_LED_OFF,
        }
    }
}

/// One raw sample of every attached peripheral, taken on demand. NaN in
/// either float marks a failed sensor read; validation happens in the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub temperature_c: f32,
    pub humidity: f32,
    pub is_dark: bool,
    /// Wall clock at sample time, `None` until SNTP has synchronized.
    pub epoch_seconds: Option<i64>,
}

/// Discrete transport events, drained by the main loop once per iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_match_exactly() {
        assert_eq!(Command::parse("LED_ON"), Some(Command::LedOn));
        assert_eq!(Command::parse("LED_OFF"), Some(Command::LedOff));
        assert_eq!(Command::parse("led_on"), None);
        assert_eq!(Command::parse("LED_ON "), None);
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("connection_successful"), None);
    }

    #[test]
    fn command_round_trips_through_literal() {
        for command in [Command::LedOn, Command::LedOff] {
            assert_eq!(Command::parse(command.as_str()), Some(command));
        }
    }

    #[test]
    fn link_state_labels() {
        assert_eq!(LinkState::Disconnected.as_str(), "DISCONNECTED");
        assert_eq!(LinkState::Connecting.as_str(), "CONNECTING");
        assert_eq!(LinkState::Connected.as_str(), "CONNECTED");
    }
}
