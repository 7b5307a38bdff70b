use std::{
    collections::hash_map::RandomState,
    hash::BuildHasher,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, info, warn};

use rgbw_light_common::{
    encode_discovery, IdentitySource, IdentityStore, KvBackend, LightReader, MqttEvent, Outbound,
    Qos, RuntimeConfig, StateDocument, StateStore, StorageError, SyncEngine, TransportError,
    TransportErrorKind, NAMESPACE,
};

const LAYOUT_MARKER: &str = ".layout";
const LAYOUT_VERSION: &str = "1";
const RENDER_INTERVAL_MS: u64 = 100;
const MQTT_RETRY_DELAY_SECS: u64 = 2;

type Engine = SyncEngine<FileBackend>;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<Engine>>,
    mqtt: AsyncClient,
}

#[derive(Debug, Serialize)]
struct TopicsView {
    config: String,
    command: String,
    state: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(rename = "deviceId")]
    device_id: String,
    topics: TopicsView,
    connected: bool,
    light: StateDocument,
}

/// One file per key under `<data dir>/<namespace>/`.
#[derive(Debug)]
struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn unavailable(context: &str, err: std::io::Error) -> StorageError {
    StorageError::Unavailable(format!("{context}: {err}"))
}

impl KvBackend for FileBackend {
    fn init(&mut self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.root)
            .map_err(|err| unavailable("failed to create data dir", err))?;

        let marker = self.root.join(LAYOUT_MARKER);
        match std::fs::read_to_string(&marker) {
            Ok(version) if version.trim() == LAYOUT_VERSION => Ok(()),
            Ok(version) => Err(StorageError::Corrupt(format!(
                "layout version `{}` found, expected `{LAYOUT_VERSION}`",
                version.trim()
            ))),
            Err(err) if err.kind() == ErrorKind::NotFound => std::fs::write(&marker, LAYOUT_VERSION)
                .map_err(|err| unavailable("failed to write layout marker", err)),
            Err(err) => Err(unavailable("failed to read layout marker", err)),
        }
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(unavailable("failed to erase data dir", err)),
        }
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(self.key_path(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(unavailable("failed to read key", err)),
        }
    }

    fn set_bytes(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.key_path(key);
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, value).map_err(|err| unavailable("failed to write key", err))?;
        std::fs::rename(&staging, &path).map_err(|err| unavailable("failed to replace key", err))
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        // Every set_bytes is already an atomic rename.
        Ok(())
    }
}

/// Workstations have no factory MAC to lean on; ids come from a hashed
/// time/pid/hasher-key seed.
struct HostIdentitySource {
    seed: [u8; 32],
    counter: u64,
}

impl HostIdentitySource {
    fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let hasher_key = RandomState::new().hash_one(nanos);

        let mut hasher = Sha256::new();
        hasher.update(nanos.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(hasher_key.to_le_bytes());

        Self {
            seed: hasher.finalize().into(),
            counter: 0,
        }
    }
}

impl IdentitySource for HostIdentitySource {
    fn hardware_id(&mut self) -> Option<[u8; 6]> {
        None
    }

    fn random_u32(&mut self) -> u32 {
        self.counter = self.counter.wrapping_add(1);
        let digest = Sha256::new()
            .chain_update(self.seed)
            .chain_update(self.counter.to_le_bytes())
            .finalize();
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("LIGHT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.rgbw-light"));

    let mut runtime = load_runtime_config(&data_dir).await.unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.network.sanitize();

    let mut store = StateStore::init(FileBackend::new(data_dir.join(NAMESPACE)))
        .context("failed to open state store")?;
    let identity = IdentityStore::new()
        .get_or_create_identity(&mut store, &mut HostIdentitySource::new())
        .context("failed to resolve device identity")?;

    let mut mqtt_options = MqttOptions::new(
        format!("rgbw-light-{identity}"),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if runtime.network.has_mqtt_credentials() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let engine = SyncEngine::new(identity, runtime.device.clone(), store);
    spawn_render_loop(engine.reader());

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        mqtt,
    };

    // The host network is up before the process starts.
    let startup = app_state.engine.lock().await.on_network_ready();
    let mut eventloop = Some(eventloop);
    for action in startup {
        match action {
            Outbound::Connect => {
                if let Some(eventloop) = eventloop.take() {
                    info!(
                        "connecting to mqtt broker {}",
                        runtime.network.mqtt_url()
                    );
                    spawn_mqtt_loop(app_state.clone(), eventloop);
                }
            }
            other => execute_outbound(&app_state.mqtt, other),
        }
    }

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/discovery", get(handle_get_discovery))
        .with_state(app_state);

    let port = std::env::var("LIGHT_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("status server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn load_runtime_config(data_dir: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(data_dir.join("runtime.json")).await {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    let network = &mut runtime.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: EventLoop) {
    tokio::spawn(async move {
        let mut connected = false;
        loop {
            let (events, failed) = match eventloop.poll().await {
                Ok(event) => (map_event(event, &mut connected), false),
                Err(err) => (map_poll_error(&err, &mut connected), true),
            };

            for event in events {
                let actions = { app_state.engine.lock().await.handle(event) };
                for action in actions {
                    execute_outbound(&app_state.mqtt, action);
                }
            }

            if failed {
                tokio::time::sleep(Duration::from_secs(MQTT_RETRY_DELAY_SECS)).await;
            }
        }
    });
}

fn map_event(event: Event, connected: &mut bool) -> Vec<MqttEvent> {
    let Event::Incoming(packet) = event else {
        return Vec::new();
    };

    match packet {
        Incoming::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
            *connected = true;
            vec![MqttEvent::Connected]
        }
        Incoming::ConnAck(ack) => vec![MqttEvent::Error(TransportError::new(
            TransportErrorKind::Protocol,
            format!("broker refused connection: {:?}", ack.code),
        ))],
        Incoming::Publish(message) => vec![MqttEvent::Data {
            topic: message.topic,
            payload: message.payload.to_vec(),
        }],
        Incoming::SubAck(ack) => vec![MqttEvent::Subscribed(u32::from(ack.pkid))],
        Incoming::PubAck(ack) => vec![MqttEvent::Published(u32::from(ack.pkid))],
        Incoming::Disconnect => {
            *connected = false;
            vec![MqttEvent::Disconnected]
        }
        _ => Vec::new(),
    }
}

fn map_poll_error(err: &ConnectionError, connected: &mut bool) -> Vec<MqttEvent> {
    let kind = match err {
        ConnectionError::Io(_)
        | ConnectionError::NetworkTimeout
        | ConnectionError::ConnectionRefused(_) => TransportErrorKind::Connection,
        ConnectionError::MqttState(_) => TransportErrorKind::Protocol,
        _ => TransportErrorKind::Other,
    };

    let mut events = Vec::with_capacity(2);
    if *connected {
        *connected = false;
        events.push(MqttEvent::Disconnected);
    }
    events.push(MqttEvent::Error(TransportError::new(kind, err.to_string())));
    events
}

fn to_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn execute_outbound(mqtt: &AsyncClient, action: Outbound) {
    let result = match action {
        Outbound::Connect => {
            debug!("mqtt transport already running");
            Ok(())
        }
        Outbound::Subscribe { topic, qos } => mqtt.try_subscribe(topic, to_qos(qos)),
        Outbound::Publish {
            topic,
            payload,
            qos,
            retain,
        } => mqtt.try_publish(topic, to_qos(qos), retain, payload),
    };

    if let Err(err) = result {
        warn!("mqtt request failed: {err}");
    }
}

fn spawn_render_loop(reader: LightReader) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(RENDER_INTERVAL_MS));
        let mut last = None;
        loop {
            interval.tick().await;
            let levels = reader.snapshot().output_levels();
            if last != Some(levels) {
                info!(
                    "render output r={} g={} b={} w={}",
                    levels[0], levels[1], levels[2], levels[3]
                );
                last = Some(levels);
            }
        }
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.engine.lock().await;
    let topics = engine.topics();

    Json(StatusView {
        device_id: engine.identity().to_string(),
        topics: TopicsView {
            config: topics.config.clone(),
            command: topics.command.clone(),
            state: topics.state.clone(),
        },
        connected: engine.connection() == rgbw_light_common::ConnectionState::Connected,
        light: StateDocument::from(&engine.light_state()),
    })
}

async fn handle_get_discovery(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.engine.lock().await;
    let body = encode_discovery(engine.identity(), engine.topics(), engine.metadata());
    ([(header::CONTENT_TYPE, "application/json")], body)
}
