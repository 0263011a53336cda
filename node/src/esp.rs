use std::{
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyInputPin, AnyOutputPin, Input, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    io::EspIOError,
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
    ws::client::{EspWebSocketClient, EspWebSocketClientConfig, WebSocketEvent, WebSocketEventType},
    ws::FrameType,
};
use log::{debug, info, warn};

use domotica_common::{NodeAction, NodeConfig, NodeEngine, SensorSample, SocketEvent};

const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const POST_BOOT_SETTLE_MS: u64 = 1_000;
const LOOP_POLL_INTERVAL_MS: u64 = 50;

/// Clock readings before this are the unsynchronized 1970 epoch and are
/// reported as "no wall clock yet".
const MIN_VALID_EPOCH: u64 = 1_700_000_000;

struct SensorSuite {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    ldr_pin: PinDriver<'static, AnyInputPin, Input>,
    delay: Ets,
}

impl SensorSuite {
    fn new(dht_pin: AnyIOPin, ldr_pin: AnyInputPin) -> anyhow::Result<Self> {
        let mut dht_pin = PinDriver::input_output_od(dht_pin)?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        let ldr_pin = PinDriver::input(ldr_pin)?;

        Ok(Self {
            dht_pin,
            ldr_pin,
            delay: Ets,
        })
    }

    /// On-demand read of every peripheral. A failed DHT transaction yields
    /// NaN fields; the engine rejects the whole sample.
    fn read(&mut self, epoch_seconds: Option<i64>) -> SensorSample {
        let (temperature_c, humidity) = match dht11::blocking::read(&mut self.delay, &mut self.dht_pin)
        {
            Ok(reading) => (
                reading.temperature as f32,
                reading.relative_humidity as f32,
            ),
            Err(err) => {
                warn!("DHT11 read failed: {err:?}");
                (f32::NAN, f32::NAN)
            }
        };

        SensorSample {
            temperature_c,
            humidity,
            is_dark: self.ldr_pin.is_high(),
            epoch_seconds,
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = NodeConfig::default();
    apply_build_time_overrides(&mut config);
    config.sanitize();

    info!(
        "booting domotica node; server {}, interval {}ms, verify_tls={}",
        config.network.ws_url(),
        config.telemetry.send_interval_ms,
        config.network.verify_tls
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;

    let mut led = PinDriver::output(unsafe { AnyOutputPin::new(config.pins.led) })?;
    let mut relay = PinDriver::output(unsafe { AnyOutputPin::new(config.pins.relay) })?;
    led.set_low()?;
    relay.set_low()?;

    let mut sensors = SensorSuite::new(
        unsafe { AnyIOPin::new(config.pins.dht) },
        unsafe { AnyInputPin::new(config.pins.ldr) },
    )
    .context("failed to initialize sensor suite")?;

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    connect_wifi(&mut wifi, &config)?;
    disable_wifi_power_save();

    // Let the DHT line settle before the first read.
    thread::sleep(Duration::from_millis(POST_BOOT_SETTLE_MS));

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    if config.telemetry.timestamp_enabled {
        let wait_ms = config.telemetry.sntp_sync_wait_ms;
        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        loop {
            if sntp.get_sync_status() == SyncStatus::Completed {
                info!("clock synchronized");
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "clock not synchronized within {wait_ms}ms; timestamps report \"unknown\" until sync completes"
                );
                break;
            }
            thread::sleep(Duration::from_millis(250));
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let mut engine = NodeEngine::new(config.clone());
    let (event_tx, event_rx) = mpsc::channel::<SocketEvent>();

    engine.handle_socket_event(SocketEvent::Connecting);
    let mut session = create_ws_client(&config, event_tx)?;

    let boot = Instant::now();
    loop {
        feed_watchdog();

        if !wifi.is_connected().unwrap_or(false) {
            warn!("wifi link down; re-issuing association request");
            if let Err(err) = wifi.connect() {
                warn!("wifi reconnect failed: {err:#}");
            }
            thread::sleep(Duration::from_secs(1));
            continue;
        }

        drain_socket_events(&event_rx, &mut engine, &mut led, &mut relay, &mut session);

        let now_ms = boot.elapsed().as_millis() as u64;
        if engine.telemetry_due(now_ms) {
            let sample = sensors.read(current_epoch());
            match engine.process_sample(now_ms, &sample) {
                Ok(actions) => {
                    apply_actions(&mut engine, &mut led, &mut relay, &mut session, actions)
                }
                Err(err) => warn!("{err}"),
            }
        }

        thread::sleep(Duration::from_millis(LOOP_POLL_INTERVAL_MS));
    }
}

/// Drains transport events accumulated since the previous iteration. The
/// socket callback only enqueues; every state change happens here, on the
/// loop thread, in delivery order.
fn drain_socket_events(
    event_rx: &Receiver<SocketEvent>,
    engine: &mut NodeEngine,
    led: &mut PinDriver<'static, AnyOutputPin, Output>,
    relay: &mut PinDriver<'static, AnyOutputPin, Output>,
    session: &mut EspWebSocketClient<'static>,
) {
    loop {
        match event_rx.try_recv() {
            Ok(event) => {
                match &event {
                    SocketEvent::Connected => info!("session established"),
                    SocketEvent::Disconnected => warn!("session lost; client will reconnect"),
                    SocketEvent::Error(detail) => warn!("session error: {detail}"),
                    SocketEvent::Text(body) => debug!("received frame: {body}"),
                    SocketEvent::Connecting => {}
                }
                let actions = engine.handle_socket_event(event);
                apply_actions(engine, led, relay, session, actions);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
}

fn apply_actions(
    engine: &mut NodeEngine,
    led: &mut PinDriver<'static, AnyOutputPin, Output>,
    relay: &mut PinDriver<'static, AnyOutputPin, Output>,
    session: &mut EspWebSocketClient<'static>,
    actions: Vec<NodeAction>,
) {
    for action in actions {
        match action {
            NodeAction::SetLed(on) => {
                let result = if on { led.set_high() } else { led.set_low() };
                match result {
                    Ok(()) => info!("indicator LED -> {}", level(on)),
                    Err(err) => warn!("failed to drive LED pin: {err}"),
                }
            }
            NodeAction::SetRelay(on) => {
                let result = if on { relay.set_high() } else { relay.set_low() };
                match result {
                    Ok(()) => debug!("relay -> {}", level(on)),
                    Err(err) => warn!("failed to drive relay pin: {err}"),
                }
            }
            NodeAction::SendText(frame) => {
                match session.send(FrameType::Text(false), frame.as_bytes()) {
                    Ok(()) => info!("sent: {frame}"),
                    // No queueing, no resend; the next tick produces a
                    // fresh frame.
                    Err(err) => debug!(
                        "send dropped ({} link): {err}",
                        engine.link().as_str()
                    ),
                }
            }
        }
    }
}

fn level(on: bool) -> &'static str {
    if on {
        "HIGH"
    } else {
        "LOW"
    }
}

fn create_ws_client(
    config: &NodeConfig,
    event_tx: Sender<SocketEvent>,
) -> anyhow::Result<EspWebSocketClient<'static>> {
    let network = &config.network;
    let ws_config = EspWebSocketClientConfig {
        crt_bundle_attach: network
            .verify_tls
            .then_some(esp_idf_svc::sys::esp_crt_bundle_attach),
        skip_cert_common_name_check: !network.verify_tls,
        reconnect_timeout_ms: Duration::from_millis(network.reconnect_interval_ms),
        network_timeout_ms: Duration::from_secs(10),
        ping_interval_sec: Duration::from_secs(network.ping_interval_secs.into()),
        pingpong_timeout_sec: Duration::from_secs(
            u64::from(network.pong_timeout_secs) * u64::from(network.max_missed_pongs),
        ),
        ..Default::default()
    };

    let client = EspWebSocketClient::new(
        &network.ws_url(),
        &ws_config,
        Duration::from_secs(10),
        move |event| forward_socket_event(&event_tx, event),
    )
    .context("failed to create websocket client")?;

    Ok(client)
}

/// Runs on the transport task; translates client events into the loop's
/// channel without touching any state itself.
fn forward_socket_event(
    event_tx: &Sender<SocketEvent>,
    event: &Result<WebSocketEvent<'_>, EspIOError>,
) {
    let forwarded = match event {
        Ok(event) => match &event.event_type {
            WebSocketEventType::Connected => Some(SocketEvent::Connected),
            WebSocketEventType::Disconnected
            | WebSocketEventType::Close(_)
            | WebSocketEventType::Closed => Some(SocketEvent::Disconnected),
            WebSocketEventType::Text(body) => Some(SocketEvent::Text(body.to_string())),
            // Pings are answered by the client itself.
            _ => None,
        },
        Err(err) => Some(SocketEvent::Error(format!("{err}"))),
    };

    if let Some(event) = forwarded {
        let _ = event_tx.send(event);
    }
}

fn connect_wifi(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    config: &NodeConfig,
) -> anyhow::Result<()> {
    let network = &config.network;
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    // Association retries forever; there is nothing useful to do offline.
    loop {
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
            match wifi.connect() {
                Ok(()) => match wifi.wait_netif_up() {
                    Ok(()) => {
                        info!("wifi connected and netif up on attempt {attempt}");
                        return Ok(());
                    }
                    Err(err) => warn!("wifi netif up failed on attempt {attempt}: {err:#}"),
                },
                Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
            }

            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }

        warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; retrying");
    }
}

fn current_epoch() -> Option<i64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let seconds = elapsed.as_secs();
    (seconds > MIN_VALID_EPOCH).then_some(seconds as i64)
}

fn apply_build_time_overrides(config: &mut NodeConfig) {
    if config.network.wifi_ssid.is_empty() {
        config.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }
    if config.network.wifi_pass.is_empty() {
        config.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
    if let Some(host) = option_env!("WS_HOST") {
        config.network.ws_host = host.to_string();
    }
    if let Some(port) = option_env!("WS_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.network.ws_port = port;
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
