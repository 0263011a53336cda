use chrono::{FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SensorSample;

/// Placeholder timestamp until the first successful SNTP sync.
pub const TIMESTAMP_UNKNOWN: &str = "unknown";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The outbound wire schema. Field order is the wire order; the server and
/// the dashboards rely on these exact keys and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub temperature: f32,
    pub humidity: f32,
    pub light: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TelemetryFrame {
    /// Builds the frame from a validated sample. Floats are rounded to one
    /// decimal here, at the encode boundary; the sampler never rounds.
    pub fn from_sample(sample: &SensorSample, timestamp: Option<String>) -> Self {
        Self {
            temperature: round1(sample.temperature_c),
            humidity: round1(sample.humidity),
            light: u8::from(sample.is_dark),
            timestamp,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

/// Renders `YYYY-MM-DD HH:MM:SS` at the configured fixed offset, or the
/// literal `unknown` while the wall clock has never been synchronized.
pub fn format_timestamp(epoch_seconds: Option<i64>, utc_offset_minutes: i32) -> String {
    let Some(epoch) = epoch_seconds else {
        return TIMESTAMP_UNKNOWN.to_string();
    };
    let Some(offset) = FixedOffset::east_opt(utc_offset_minutes * 60) else {
        return TIMESTAMP_UNKNOWN.to_string();
    };
    match Utc.timestamp_opt(epoch, 0).single() {
        Some(instant) => instant
            .with_timezone(&offset)
            .format(TIMESTAMP_FORMAT)
            .to_string(),
        None => TIMESTAMP_UNKNOWN.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample(temperature_c: f32, humidity: f32, is_dark: bool) -> SensorSample {
        SensorSample {
            temperature_c,
            humidity,
            is_dark,
            epoch_seconds: None,
        }
    }

    #[test]
    fn encodes_basic_frame_in_wire_order() {
        let frame = TelemetryFrame::from_sample(&sample(23.4, 56.2, false), None);

        assert_eq!(
            frame.encode().unwrap(),
            r#"{"temperature":23.4,"humidity":56.2,"light":0}"#
        );
    }

    #[test]
    fn encodes_dark_reading_as_one() {
        let frame = TelemetryFrame::from_sample(&sample(23.4, 56.2, true), None);

        assert_eq!(
            frame.encode().unwrap(),
            r#"{"temperature":23.4,"humidity":56.2,"light":1}"#
        );
    }

    #[test]
    fn encodes_timestamped_frame() {
        let frame = TelemetryFrame::from_sample(
            &sample(23.4, 56.2, false),
            Some("2024-05-01 14:32:10".to_string()),
        );

        assert_eq!(
            frame.encode().unwrap(),
            r#"{"temperature":23.4,"humidity":56.2,"light":0,"timestamp":"2024-05-01 14:32:10"}"#
        );
    }

    #[test]
    fn rounds_to_one_decimal_at_encode_time() {
        let frame = TelemetryFrame::from_sample(&sample(23.46, 55.24, false), None);

        assert_eq!(frame.temperature, 23.5);
        assert_eq!(frame.humidity, 55.2);
    }

    #[test]
    fn encoded_frame_round_trips() {
        let frame = TelemetryFrame::from_sample(&sample(19.96, 60.04, true), None);
        let decoded: TelemetryFrame = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(decoded, frame);
        assert_eq!(decoded.temperature, 20.0);
        assert_eq!(decoded.humidity, 60.0);
        assert_eq!(decoded.light, 1);
        assert_eq!(decoded.timestamp, None);
    }

    #[test]
    fn formats_timestamp_at_fixed_offset() {
        // 2024-05-01T19:32:10Z is 14:32:10 at UTC-05:00.
        assert_eq!(
            format_timestamp(Some(1_714_591_930), -300),
            "2024-05-01 14:32:10"
        );
        assert_eq!(format_timestamp(Some(0), 0), "1970-01-01 00:00:00");
    }

    #[test]
    fn unsynced_clock_renders_unknown() {
        assert_eq!(format_timestamp(None, -300), TIMESTAMP_UNKNOWN);
    }
}
