use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub ws_host: String,
    pub ws_port: u16,
    pub ws_path: String,
    pub verify_tls: bool,
    pub reconnect_interval_ms: u64,
    pub ping_interval_secs: u16,
    pub pong_timeout_secs: u16,
    pub max_missed_pongs: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            ws_host: "domotica-ws.onrender.com".to_string(),
            ws_port: 443,
            ws_path: "/".to_string(),
            // The hosting provider terminates TLS with a chain the device
            // cannot validate against its bundle; verification stays off
            // unless a deployment opts back in.
            verify_tls: false,
            reconnect_interval_ms: 5_000,
            ping_interval_secs: 15,
            pong_timeout_secs: 3,
            max_missed_pongs: 2,
        }
    }
}

impl NetworkConfig {
    pub fn ws_url(&self) -> String {
        let scheme = if self.ws_port == 443 { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.ws_host, self.ws_port, self.ws_path)
    }

    pub fn sanitize(&mut self) {
        if self.ws_host.trim().is_empty() {
            self.ws_host = Self::default().ws_host;
        }
        if self.ws_port == 0 {
            self.ws_port = 443;
        }
        if !self.ws_path.starts_with('/') {
            self.ws_path.insert(0, '/');
        }
        self.reconnect_interval_ms = self.reconnect_interval_ms.max(5_000);
        self.ping_interval_secs = self.ping_interval_secs.max(1);
        self.pong_timeout_secs = self.pong_timeout_secs.max(1);
        self.max_missed_pongs = self.max_missed_pongs.max(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub send_interval_ms: u64,
    pub timestamp_enabled: bool,
    pub utc_offset_minutes: i32,
    pub sntp_sync_wait_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: 3_000,
            timestamp_enabled: true,
            utc_offset_minutes: -300,
            sntp_sync_wait_ms: 10_000,
        }
    }
}

impl TelemetryConfig {
    pub fn sanitize(&mut self) {
        self.send_interval_ms = self.send_interval_ms.max(1_000);
        // Offsets beyond UTC±14:00 are always a configuration mistake.
        self.utc_offset_minutes = self.utc_offset_minutes.clamp(-14 * 60, 14 * 60);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinConfig {
    pub led: i32,
    pub relay: i32,
    pub ldr: i32,
    pub dht: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            led: 2,
            relay: 17,
            ldr: 26,
            dht: 25,
        }
    }
}

impl PinConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.led < 0 {
            self.led = defaults.led;
        }
        if self.relay < 0 {
            self.relay = defaults.relay;
        }
        if self.ldr < 0 {
            self.ldr = defaults.ldr;
        }
        if self.dht < 0 {
            self.dht = defaults.dht;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub pins: PinConfig,
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.network.sanitize();
        self.telemetry.sanitize();
        self.pins.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_node() {
        let config = NodeConfig::default();

        assert_eq!(config.network.ws_host, "domotica-ws.onrender.com");
        assert_eq!(config.network.ws_port, 443);
        assert_eq!(config.network.ws_path, "/");
        assert!(!config.network.verify_tls);
        assert_eq!(config.network.reconnect_interval_ms, 5_000);
        assert_eq!(config.network.ping_interval_secs, 15);
        assert_eq!(config.network.pong_timeout_secs, 3);
        assert_eq!(config.network.max_missed_pongs, 2);
        assert_eq!(config.telemetry.send_interval_ms, 3_000);
        assert!(config.telemetry.timestamp_enabled);
        assert_eq!(
            config.pins,
            PinConfig {
                led: 2,
                relay: 17,
                ldr: 26,
                dht: 25
            }
        );
    }

    #[test]
    fn ws_url_picks_scheme_from_port() {
        let mut network = NetworkConfig::default();
        assert_eq!(network.ws_url(), "wss://domotica-ws.onrender.com:443/");

        network.ws_host = "127.0.0.1".to_string();
        network.ws_port = 8080;
        assert_eq!(network.ws_url(), "ws://127.0.0.1:8080/");
    }

    #[test]
    fn sanitize_restores_floors() {
        let mut config = NodeConfig::default();
        config.network.reconnect_interval_ms = 100;
        config.network.max_missed_pongs = 0;
        config.network.ws_path = "telemetry".to_string();
        config.telemetry.send_interval_ms = 0;
        config.telemetry.utc_offset_minutes = -100_000;
        config.pins.relay = -1;

        config.sanitize();

        assert_eq!(config.network.reconnect_interval_ms, 5_000);
        assert_eq!(config.network.max_missed_pongs, 1);
        assert_eq!(config.network.ws_path, "/telemetry");
        assert_eq!(config.telemetry.send_interval_ms, 1_000);
        assert_eq!(config.telemetry.utc_offset_minutes, -14 * 60);
        assert_eq!(config.pins.relay, 17);
    }
}
