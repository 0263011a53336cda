use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use domotica_common::{NodeAction, NodeConfig, NodeEngine, SensorSample, SocketEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Granularity of the control loop; matches the non-blocking service cadence
/// of the device build.
const LOOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = NodeConfig::default();
    config.network.ws_host = std::env::var("WS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    config.network.ws_port = std::env::var("WS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    config.sanitize();

    let url = config.network.ws_url();
    let reconnect = Duration::from_millis(config.network.reconnect_interval_ms);

    let mut engine = NodeEngine::new(config);
    let mut pins = SimulatedPins::default();
    let mut sensors = SimulatedSensors::default();
    let boot = Instant::now();

    info!("node simulator started; server {url}");

    loop {
        engine.handle_socket_event(SocketEvent::Connecting);
        match connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                if let Err(err) =
                    run_session(&mut engine, &mut pins, &mut sensors, boot, socket).await
                {
                    warn!("session ended: {err:#}");
                }
                engine.handle_socket_event(SocketEvent::Disconnected);
            }
            Err(err) => {
                warn!("connect to {url} failed: {err}");
                engine.handle_socket_event(SocketEvent::Disconnected);
            }
        }

        // Sampling keeps running while the session is down; frames produced
        // offline are dropped at the transport boundary.
        idle_offline(&mut engine, &mut pins, &mut sensors, boot, reconnect).await;
    }
}

async fn run_session(
    engine: &mut NodeEngine,
    pins: &mut SimulatedPins,
    sensors: &mut SimulatedSensors,
    boot: Instant,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> anyhow::Result<()> {
    let network = engine.config().network.clone();
    let ping_period = Duration::from_secs(network.ping_interval_secs.into());
    let pong_timeout = Duration::from_secs(network.pong_timeout_secs.into());

    let (mut sink, mut stream) = socket.split();

    info!("session established");
    let actions = engine.handle_socket_event(SocketEvent::Connected);
    apply_actions(pins, Some(&mut sink), actions).await?;

    let mut poll = interval(LOOP_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = interval_at(Instant::now() + ping_period, ping_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut missed_pongs: u8 = 0;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        let pong_watch = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = poll.tick() => {
                let now_ms = boot.elapsed().as_millis() as u64;
                if engine.telemetry_due(now_ms) {
                    let sample = sensors.sample();
                    match engine.process_sample(now_ms, &sample) {
                        Ok(actions) => apply_actions(pins, Some(&mut sink), actions).await?,
                        Err(err) => warn!("{err}"),
                    }
                }
            }
            _ = heartbeat.tick() => {
                sink.send(Message::Ping(Vec::new()))
                    .await
                    .context("failed to send heartbeat ping")?;
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + pong_timeout);
                }
            }
            _ = pong_watch => {
                pong_deadline = None;
                missed_pongs += 1;
                warn!(
                    "heartbeat pong missed ({missed_pongs}/{})",
                    network.max_missed_pongs
                );
                if missed_pongs >= network.max_missed_pongs {
                    anyhow::bail!("server missed {missed_pongs} heartbeat(s)");
                }
            }
            message = stream.next() => {
                let Some(message) = message else {
                    anyhow::bail!("server closed the connection");
                };
                handle_message(
                    engine,
                    pins,
                    &mut sink,
                    message.context("transport error")?,
                    &mut missed_pongs,
                    &mut pong_deadline,
                )
                .await?;
            }
        }
    }
}

async fn handle_message(
    engine: &mut NodeEngine,
    pins: &mut SimulatedPins,
    sink: &mut WsSink,
    message: Message,
    missed_pongs: &mut u8,
    pong_deadline: &mut Option<Instant>,
) -> anyhow::Result<()> {
    match message {
        Message::Text(body) => {
            debug!("received frame: {body}");
            let actions = engine.handle_socket_event(SocketEvent::Text(body));
            apply_actions(pins, Some(sink), actions).await?;
        }
        Message::Ping(payload) => {
            sink.send(Message::Pong(payload))
                .await
                .context("failed to answer ping")?;
        }
        Message::Pong(_) => {
            *missed_pongs = 0;
            *pong_deadline = None;
        }
        Message::Close(frame) => {
            anyhow::bail!("server sent close: {frame:?}");
        }
        Message::Binary(_) | Message::Frame(_) => {}
    }
    Ok(())
}

async fn idle_offline(
    engine: &mut NodeEngine,
    pins: &mut SimulatedPins,
    sensors: &mut SimulatedSensors,
    boot: Instant,
    wait: Duration,
) {
    let deadline = Instant::now() + wait;
    let mut poll = interval(LOOP_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while Instant::now() < deadline {
        poll.tick().await;
        let now_ms = boot.elapsed().as_millis() as u64;
        if engine.telemetry_due(now_ms) {
            let sample = sensors.sample();
            match engine.process_sample(now_ms, &sample) {
                Ok(actions) => {
                    if let Err(err) = apply_actions(pins, None, actions).await {
                        warn!("failed to apply actions: {err:#}");
                    }
                }
                Err(err) => warn!("{err}"),
            }
        }
    }
}

async fn apply_actions(
    pins: &mut SimulatedPins,
    mut sink: Option<&mut WsSink>,
    actions: Vec<NodeAction>,
) -> anyhow::Result<()> {
    for action in actions {
        match action {
            NodeAction::SetLed(on) => pins.set_led(on),
            NodeAction::SetRelay(on) => pins.set_relay(on),
            NodeAction::SendText(frame) => match sink.as_deref_mut() {
                Some(sink) => {
                    sink.send(Message::Text(frame.clone()))
                        .await
                        .context("failed to send frame")?;
                    info!("sent: {frame}");
                }
                None => debug!("no active session, dropping frame: {frame}"),
            },
        }
    }
    Ok(())
}

/// Stand-ins for the output pins so the simulator can run on a dev machine.
#[derive(Debug, Default)]
struct SimulatedPins {
    led: bool,
    relay: bool,
}

impl SimulatedPins {
    fn set_led(&mut self, on: bool) {
        if self.led != on {
            info!("[sim] indicator LED -> {}", level(on));
        }
        self.led = on;
    }

    fn set_relay(&mut self, on: bool) {
        if self.relay != on {
            info!("[sim] relay -> {}", level(on));
        }
        self.relay = on;
    }
}

fn level(on: bool) -> &'static str {
    if on {
        "HIGH"
    } else {
        "LOW"
    }
}

/// Hardware integration point: on the ESP target these readings come from the
/// DHT11 and LDR drivers.
#[derive(Debug, Default)]
struct SimulatedSensors {
    tick: u64,
}

impl SimulatedSensors {
    fn sample(&mut self) -> SensorSample {
        self.tick = self.tick.saturating_add(1);

        let temperature_c = 21.0 + (self.tick % 8) as f32 * 0.4;
        let humidity = 52.0 + (self.tick % 6) as f32 * 0.5;
        let is_dark = self.tick % 20 >= 10;

        SensorSample {
            temperature_c,
            humidity,
            is_dark,
            epoch_seconds: current_epoch(),
        }
    }
}

fn current_epoch() -> Option<i64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|elapsed| elapsed.as_secs() as i64)
}
