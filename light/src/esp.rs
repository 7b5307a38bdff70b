use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::AnyOutputPin,
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, CHANNEL0, CHANNEL1, CHANNEL2, CHANNEL3, TIMER0},
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use rgbw_light_common::{
    config::NetworkConfig, IdentitySource, IdentityStore, KvBackend, LightReader, MqttEvent,
    Outbound, Qos, RuntimeConfig, StateStore, StorageError, SyncEngine, TransportError,
    TransportErrorKind, CHANNEL_MAX, NAMESPACE,
};

const NVS_RUNTIME_KEY: &str = "runtime_json";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const MQTT_RETRY_DELAY_MS: u64 = 2_000;
const RENDER_INTERVAL_MS: u64 = 100;
const PWM_FREQUENCY_KHZ: u32 = 5;
const LED_PINS: [i32; 4] = [4, 5, 6, 7];

type SharedClient = Arc<Mutex<EspMqttClient<'static>>>;

struct NvsBackend {
    partition: Option<EspDefaultNvsPartition>,
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsBackend {
    fn new() -> Self {
        Self {
            partition: None,
            nvs: None,
        }
    }

    fn partition(&self) -> Option<EspDefaultNvsPartition> {
        self.partition.clone()
    }

    fn handle(&self) -> Result<&EspNvs<NvsDefault>, StorageError> {
        self.nvs
            .as_ref()
            .ok_or_else(|| StorageError::Unavailable("nvs namespace not open".into()))
    }

    fn handle_mut(&mut self) -> Result<&mut EspNvs<NvsDefault>, StorageError> {
        self.nvs
            .as_mut()
            .ok_or_else(|| StorageError::Unavailable("nvs namespace not open".into()))
    }
}

fn nvs_error(context: &str, err: EspError) -> StorageError {
    StorageError::Unavailable(format!("{context}: {err}"))
}

impl KvBackend for NvsBackend {
    fn init(&mut self) -> Result<(), StorageError> {
        let rc = unsafe { esp_idf_svc::sys::nvs_flash_init() };
        if rc == esp_idf_svc::sys::ESP_ERR_NVS_NO_FREE_PAGES
            || rc == esp_idf_svc::sys::ESP_ERR_NVS_NEW_VERSION_FOUND
        {
            return Err(StorageError::Corrupt(format!(
                "nvs_flash_init returned {rc}"
            )));
        }
        if rc != esp_idf_svc::sys::ESP_OK {
            return Err(StorageError::Unavailable(format!(
                "nvs_flash_init failed with code {rc}"
            )));
        }

        if self.partition.is_none() {
            let partition = EspDefaultNvsPartition::take()
                .map_err(|err| nvs_error("failed to take nvs partition", err))?;
            self.partition = Some(partition);
        }
        let partition = self.partition.clone().ok_or_else(|| {
            StorageError::Unavailable("nvs partition missing".into())
        })?;

        let nvs = EspNvs::new(partition, NAMESPACE, true)
            .map_err(|err| nvs_error("failed to open nvs namespace", err))?;
        self.nvs = Some(nvs);
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.nvs = None;
        let rc = unsafe { esp_idf_svc::sys::nvs_flash_erase() };
        if rc == esp_idf_svc::sys::ESP_OK {
            return Ok(());
        }
        Err(StorageError::Unavailable(format!(
            "nvs_flash_erase failed with code {rc}"
        )))
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let nvs = self.handle()?;
        let Some(len) = nvs
            .blob_len(key)
            .map_err(|err| nvs_error("failed to stat nvs key", err))?
        else {
            return legacy_string(nvs, key);
        };

        let mut buffer = vec![0_u8; len];
        let value = nvs
            .get_blob(key, &mut buffer)
            .map_err(|err| nvs_error("failed to read nvs key", err))?;
        Ok(value.map(<[u8]>::to_vec))
    }

    fn set_bytes(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.handle_mut()?
            .set_blob(key, value)
            .map_err(|err| nvs_error("failed to write nvs key", err))
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        // EspNvs commits inside set_blob.
        self.handle().map(|_| ())
    }
}

/// Entries written by earlier firmware with `nvs_set_str`.
fn legacy_string(nvs: &EspNvs<NvsDefault>, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let Some(len) = nvs
        .str_len(key)
        .map_err(|err| nvs_error("failed to stat nvs string", err))?
    else {
        return Ok(None);
    };

    let mut buffer = vec![0_u8; len];
    let value = nvs
        .get_str(key, &mut buffer)
        .map_err(|err| nvs_error("failed to read nvs string", err))?;
    Ok(value.map(|value| value.as_bytes().to_vec()))
}

struct EspIdentitySource;

impl IdentitySource for EspIdentitySource {
    fn hardware_id(&mut self) -> Option<[u8; 6]> {
        let mut mac = [0_u8; 6];
        let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
        if rc == esp_idf_svc::sys::ESP_OK {
            Some(mac)
        } else {
            warn!("esp_efuse_mac_get_default failed with code {rc}");
            None
        }
    }

    fn random_u32(&mut self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_random() }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let mut store = StateStore::init(NvsBackend::new()).context("failed to open nvs store")?;
    let identity = IdentityStore::new()
        .get_or_create_identity(&mut store, &mut EspIdentitySource)
        .context("failed to resolve device identity")?;

    let mut runtime = load_runtime_config(store.backend()).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_network_defaults(&mut runtime.network);
    runtime.network.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}`",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_url(),
    );

    let nvs_partition = store
        .backend()
        .partition()
        .ok_or_else(|| anyhow!("nvs partition unavailable"))?;

    let Peripherals { modem, ledc, .. } = Peripherals::take()?;
    let engine = SyncEngine::new(identity, runtime.device.clone(), store);
    spawn_render_loop(
        engine.reader(),
        ledc.timer0,
        (ledc.channel0, ledc.channel1, ledc.channel2, ledc.channel3),
    );

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let engine = Arc::new(Mutex::new(engine));
    let startup = engine
        .lock()
        .map_err(|_| anyhow!("engine lock poisoned"))?
        .on_network_ready();

    let mut _mqtt = None;
    for action in startup {
        if action == Outbound::Connect {
            let client_id = {
                let engine = engine.lock().map_err(|_| anyhow!("engine lock poisoned"))?;
                format!("rgbw-light-{}", engine.identity())
            };
            let (client, conn) = create_mqtt_client(&runtime.network, &client_id)?;
            let client = Arc::new(Mutex::new(client));
            spawn_mqtt_receiver(engine.clone(), conn, client.clone());
            _mqtt = Some(client);
        }
    }

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn load_runtime_config(backend: &NvsBackend) -> anyhow::Result<RuntimeConfig> {
    match backend.get_bytes(NVS_RUNTIME_KEY)? {
        Some(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn ensure_network_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }
    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
    if let Some(host) = option_env!("MQTT_HOST") {
        if network.mqtt_host.is_empty() || network.mqtt_host == rgbw_light_common::config::DEFAULT_MQTT_HOST {
            network.mqtt_host = host.to_string();
        }
    }
    if network.mqtt_user.is_empty() {
        if let Some(user) = option_env!("MQTT_USER") {
            network.mqtt_user = user.to_string();
        }
    }
    if network.mqtt_pass.is_empty() {
        if let Some(pass) = option_env!("MQTT_PASS") {
            network.mqtt_pass = pass.to_string();
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

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

    // The rest of the firmware is useless offline, so keep trying.
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt} failed: {err:#}");
                let _ = wifi.disconnect();
                let delay = if attempt % WIFI_CONNECT_ATTEMPTS == 0 {
                    WIFI_RETRY_DELAY_MS * 10
                } else {
                    WIFI_RETRY_DELAY_MS
                };
                thread::sleep(Duration::from_millis(delay));
            }
        }
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
    client_id: &str,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = network.mqtt_url();

    let conf = MqttClientConfiguration {
        client_id: Some(client_id),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn to_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

fn execute_outbound(mqtt: &SharedClient, action: Outbound) {
    let Ok(mut client) = mqtt.lock() else {
        warn!("mqtt client lock poisoned");
        return;
    };

    let result = match action {
        Outbound::Connect => {
            debug!("mqtt transport already running");
            return;
        }
        Outbound::Subscribe { topic, qos } => client.subscribe(&topic, to_qos(qos)),
        Outbound::Publish {
            topic,
            payload,
            qos,
            retain,
        } => client.publish(&topic, to_qos(qos), retain, &payload),
    };

    if let Err(err) = result {
        warn!("mqtt request failed: {err:?}");
    }
}

fn map_event(payload: EventPayload<'_, EspError>) -> Option<MqttEvent> {
    match payload {
        EventPayload::Connected(_) => Some(MqttEvent::Connected),
        EventPayload::Disconnected => Some(MqttEvent::Disconnected),
        EventPayload::Subscribed(id) => Some(MqttEvent::Subscribed(id)),
        EventPayload::Published(id) => Some(MqttEvent::Published(id)),
        EventPayload::Received {
            topic: Some(topic),
            data,
            details,
            ..
        } => {
            // Chunked deliveries are not reassembled.
            if !matches!(details, Details::Complete) {
                return None;
            }
            Some(MqttEvent::Data {
                topic: topic.to_string(),
                payload: data.to_vec(),
            })
        }
        EventPayload::Error(err) => Some(MqttEvent::Error(TransportError::new(
            TransportErrorKind::Connection,
            format!("{err:?}"),
        ))),
        _ => None,
    }
}

fn spawn_mqtt_receiver(
    engine: Arc<Mutex<SyncEngine<NvsBackend>>>,
    mut conn: EspMqttConnection,
    mqtt: SharedClient,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => map_event(event.payload()),
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_millis(MQTT_RETRY_DELAY_MS));
                    Some(MqttEvent::Error(TransportError::new(
                        TransportErrorKind::Other,
                        format!("{err:?}"),
                    )))
                }
            };

            let Some(event) = event else {
                continue;
            };

            let actions = match engine.lock() {
                Ok(mut engine) => engine.handle(event),
                Err(_) => {
                    warn!("engine lock poisoned; dropping mqtt event");
                    continue;
                }
            };
            for action in actions {
                execute_outbound(&mqtt, action);
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn spawn_render_loop(
    reader: LightReader,
    timer: TIMER0,
    channels: (CHANNEL0, CHANNEL1, CHANNEL2, CHANNEL3),
) {
    thread::Builder::new()
        .name("led-render".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            if let Err(err) = render_loop(reader, timer, channels) {
                warn!("led renderer stopped: {err:#}");
            }
        })
        .expect("failed to spawn led render thread");
}

fn render_loop(
    reader: LightReader,
    timer: TIMER0,
    (red, green, blue, white): (CHANNEL0, CHANNEL1, CHANNEL2, CHANNEL3),
) -> anyhow::Result<()> {
    let timer = LedcTimerDriver::new(
        timer,
        &TimerConfig::default()
            .frequency(PWM_FREQUENCY_KHZ.kHz().into())
            .resolution(Resolution::Bits12),
    )?;

    let pin = |index: usize| unsafe { AnyOutputPin::new(LED_PINS[index]) };
    let mut drivers = [
        LedcDriver::new(red, &timer, pin(0))?,
        LedcDriver::new(green, &timer, pin(1))?,
        LedcDriver::new(blue, &timer, pin(2))?,
        LedcDriver::new(white, &timer, pin(3))?,
    ];
    info!("led renderer started on GPIO {LED_PINS:?}");

    let mut last = None;
    loop {
        let levels = reader.snapshot().output_levels();
        if last != Some(levels) {
            for (driver, level) in drivers.iter_mut().zip(levels) {
                let duty = u32::from(level) * driver.get_max_duty() / u32::from(CHANNEL_MAX);
                driver.set_duty(duty)?;
            }
            last = Some(levels);
        }
        thread::sleep(Duration::from_millis(RENDER_INTERVAL_MS));
    }
}
