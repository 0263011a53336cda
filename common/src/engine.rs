use thiserror::Error;

use crate::{
    config::NodeConfig,
    telemetry::{format_timestamp, TelemetryFrame},
    types::{Command, LinkState, SensorSample, SocketEvent, HANDSHAKE_TOKEN},
};

/// Relay output goes HIGH strictly above this temperature. There is no
/// hysteresis band: readings oscillating around the threshold will chatter
/// the relay, and that behavior is part of the contract.
pub const RELAY_ON_ABOVE_C: f32 = 22.0;

/// Pin and socket writes the platform layer must apply, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    SetLed(bool),
    SetRelay(bool),
    SendText(String),
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("sample rejected: temperature is not a number")]
    InvalidTemperature,
    #[error("sample rejected: humidity is not a number")]
    InvalidHumidity,
    #[error("failed to encode telemetry frame")]
    Encode(#[from] serde_json::Error),
}

/// All mutable device state in one value owned by the control loop: link
/// state, actuator levels, and the telemetry attempt clock. Dropping the
/// engine and building a fresh one is a simulated reboot.
#[derive(Debug, Clone)]
pub struct NodeEngine {
    config: NodeConfig,
    link: LinkState,
    led_on: bool,
    relay_on: bool,
    last_attempt_ms: u64,
}

impl NodeEngine {
    pub fn new(mut config: NodeConfig) -> Self {
        config.sanitize();
        Self {
            config,
            link: LinkState::Disconnected,
            led_on: false,
            relay_on: false,
            last_attempt_ms: 0,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn led_on(&self) -> bool {
        self.led_on
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    /// True once the send interval has elapsed since the previous attempt.
    /// The caller samples the peripherals only when this says so.
    pub fn telemetry_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_attempt_ms) >= self.config.telemetry.send_interval_ms
    }

    /// Consumes one sample. Advances the attempt clock unconditionally, so a
    /// rejected sample still enforces the minimum spacing between attempts.
    /// A valid sample yields the relay level and one encoded telemetry frame;
    /// the frame is emitted whether or not the session is up (the transport
    /// discards it when disconnected).
    pub fn process_sample(
        &mut self,
        now_ms: u64,
        sample: &SensorSample,
    ) -> Result<Vec<NodeAction>, SampleError> {
        self.last_attempt_ms = now_ms;

        if sample.temperature_c.is_nan() {
            return Err(SampleError::InvalidTemperature);
        }
        if sample.humidity.is_nan() {
            return Err(SampleError::InvalidHumidity);
        }

        self.relay_on = sample.temperature_c > RELAY_ON_ABOVE_C;

        let timestamp = if self.config.telemetry.timestamp_enabled {
            Some(format_timestamp(
                sample.epoch_seconds,
                self.config.telemetry.utc_offset_minutes,
            ))
        } else {
            None
        };
        let frame = TelemetryFrame::from_sample(sample, timestamp);

        Ok(vec![
            NodeAction::SetRelay(self.relay_on),
            NodeAction::SendText(frame.encode()?),
        ])
    }

    /// Single-threaded event dispatch: the loop drains transport events once
    /// per iteration and feeds them here in delivery order.
    pub fn handle_socket_event(&mut self, event: SocketEvent) -> Vec<NodeAction> {
        match event {
            SocketEvent::Connecting => {
                self.link = LinkState::Connecting;
                Vec::new()
            }
            SocketEvent::Connected => {
                self.link = LinkState::Connected;
                vec![NodeAction::SendText(HANDSHAKE_TOKEN.to_string())]
            }
            SocketEvent::Disconnected | SocketEvent::Error(_) => {
                self.link = LinkState::Disconnected;
                Vec::new()
            }
            SocketEvent::Text(body) => self.handle_text(&body),
        }
    }

    /// Applies one inbound text frame. Unrecognized bodies are ignored and
    /// never acknowledged.
    pub fn handle_text(&mut self, body: &str) -> Vec<NodeAction> {
        match Command::parse(body) {
            Some(Command::LedOn) => {
                self.led_on = true;
                vec![NodeAction::SetLed(true)]
            }
            Some(Command::LedOff) => {
                self.led_on = false;
                vec![NodeAction::SetLed(false)]
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CMD_LED_OFF;

    fn engine() -> NodeEngine {
        NodeEngine::new(NodeConfig::default())
    }

    fn sample(temperature_c: f32, humidity: f32, is_dark: bool) -> SensorSample {
        SensorSample {
            temperature_c,
            humidity,
            is_dark,
            epoch_seconds: None,
        }
    }

    fn plain_engine() -> NodeEngine {
        let mut config = NodeConfig::default();
        config.telemetry.timestamp_enabled = false;
        NodeEngine::new(config)
    }

    #[test]
    fn relay_follows_threshold_strictly() {
        let mut engine = plain_engine();

        let actions = engine.process_sample(3_000, &sample(23.4, 56.2, false)).unwrap();
        assert_eq!(actions[0], NodeAction::SetRelay(true));
        assert!(engine.relay_on());

        let actions = engine.process_sample(6_000, &sample(21.9, 56.2, false)).unwrap();
        assert_eq!(actions[0], NodeAction::SetRelay(false));
        assert!(!engine.relay_on());
    }

    #[test]
    fn relay_stays_low_at_exact_threshold() {
        let mut engine = plain_engine();

        let actions = engine.process_sample(3_000, &sample(22.0, 50.0, false)).unwrap();

        assert_eq!(actions[0], NodeAction::SetRelay(false));
    }

    #[test]
    fn hot_dark_sample_produces_documented_frame() {
        let mut engine = plain_engine();

        let actions = engine.process_sample(3_000, &sample(23.4, 56.2, true)).unwrap();

        assert_eq!(
            actions,
            vec![
                NodeAction::SetRelay(true),
                NodeAction::SendText(r#"{"temperature":23.4,"humidity":56.2,"light":1}"#.to_string()),
            ]
        );
    }

    #[test]
    fn timestamped_frame_falls_back_to_unknown() {
        let mut engine = engine();

        let actions = engine.process_sample(3_000, &sample(23.4, 56.2, false)).unwrap();

        assert_eq!(
            actions[1],
            NodeAction::SendText(
                r#"{"temperature":23.4,"humidity":56.2,"light":0,"timestamp":"unknown"}"#
                    .to_string()
            )
        );
    }

    #[test]
    fn nan_sample_is_rejected_without_touching_relay() {
        let mut engine = plain_engine();
        engine.process_sample(3_000, &sample(23.4, 56.2, false)).unwrap();
        assert!(engine.relay_on());

        let err = engine
            .process_sample(6_000, &sample(f32::NAN, 56.2, false))
            .unwrap_err();

        assert!(matches!(err, SampleError::InvalidTemperature));
        assert!(engine.relay_on());

        let err = engine
            .process_sample(9_000, &sample(23.4, f32::NAN, false))
            .unwrap_err();

        assert!(matches!(err, SampleError::InvalidHumidity));
    }

    #[test]
    fn rejected_sample_still_advances_attempt_clock() {
        let mut engine = plain_engine();

        assert!(engine.telemetry_due(3_000));
        let _ = engine.process_sample(3_000, &sample(f32::NAN, 56.2, false));

        assert!(!engine.telemetry_due(5_999));
        assert!(engine.telemetry_due(6_000));
    }

    #[test]
    fn exactly_one_attempt_per_interval_crossing() {
        let mut engine = plain_engine();
        let mut attempts = Vec::new();

        for now_ms in (0..=12_500).step_by(100) {
            if engine.telemetry_due(now_ms) {
                engine.process_sample(now_ms, &sample(21.0, 40.0, false)).unwrap();
                attempts.push(now_ms);
            }
        }

        assert_eq!(attempts, vec![3_000, 6_000, 9_000, 12_000]);
    }

    #[test]
    fn handshake_sent_on_connect_transition() {
        let mut engine = engine();
        assert_eq!(engine.link(), LinkState::Disconnected);

        engine.handle_socket_event(SocketEvent::Connecting);
        assert_eq!(engine.link(), LinkState::Connecting);

        let actions = engine.handle_socket_event(SocketEvent::Connected);
        assert_eq!(engine.link(), LinkState::Connected);
        assert_eq!(actions, vec![NodeAction::SendText("ESP32_CONNECTED".to_string())]);
    }

    #[test]
    fn socket_loss_returns_to_disconnected() {
        let mut engine = engine();
        engine.handle_socket_event(SocketEvent::Connected);

        engine.handle_socket_event(SocketEvent::Error("transport failure".to_string()));

        assert_eq!(engine.link(), LinkState::Disconnected);
    }

    #[test]
    fn led_commands_are_idempotent() {
        let mut engine = engine();

        assert_eq!(engine.handle_text("LED_ON"), vec![NodeAction::SetLed(true)]);
        assert_eq!(engine.handle_text("LED_ON"), vec![NodeAction::SetLed(true)]);
        assert!(engine.led_on());

        assert_eq!(
            engine.handle_socket_event(SocketEvent::Text(CMD_LED_OFF.to_string())),
            vec![NodeAction::SetLed(false)]
        );
        assert!(!engine.led_on());
    }

    #[test]
    fn unrecognized_frames_leave_state_unchanged() {
        let mut engine = engine();
        engine.handle_text("LED_ON");

        assert!(engine.handle_text("connection_successful").is_empty());
        assert!(engine.handle_text("LED_DIM").is_empty());
        assert!(engine.led_on());
    }

    #[test]
    fn led_survives_reconnect_cycles() {
        let mut engine = engine();
        engine.handle_socket_event(SocketEvent::Connected);
        engine.handle_text("LED_ON");

        engine.handle_socket_event(SocketEvent::Disconnected);
        let actions = engine.handle_socket_event(SocketEvent::Connected);

        assert!(engine.led_on());
        // Reconnect re-sends the handshake only; the LED pin is not rewritten.
        assert_eq!(actions, vec![NodeAction::SendText("ESP32_CONNECTED".to_string())]);
    }
}
