//! Connection/session state machine that owns the live light state.
//!
//! The engine never talks to the network itself. Each input returns the
//! [`Outbound`] operations the runtime must execute, in order.

use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};

use crate::{
    codec::{decode_command, encode_discovery, encode_state},
    config::DeviceMetadata,
    error::TransportError,
    identity::DeviceIdentity,
    store::{KvBackend, StateStore},
    topics::{derive_topics, TopicSet},
    types::{LightReader, LightState},
};

pub const MAX_COMMAND_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Start the MQTT transport; it reports back with [`MqttEvent::Connected`].
    Connect,
    Subscribe {
        topic: String,
        qos: Qos,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    Disconnected,
    Subscribed(u32),
    Published(u32),
    Data { topic: String, payload: Vec<u8> },
    Error(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

pub struct SyncEngine<B: KvBackend> {
    identity: DeviceIdentity,
    topics: TopicSet,
    metadata: DeviceMetadata,
    store: StateStore<B>,
    light: Arc<RwLock<LightState>>,
    connection: ConnectionState,
}

impl<B: KvBackend> SyncEngine<B> {
    pub fn new(identity: DeviceIdentity, metadata: DeviceMetadata, store: StateStore<B>) -> Self {
        let topics = derive_topics(&identity);
        info!(
            "topics configured with device id {identity}: config={}, command={}, state={}",
            topics.config, topics.command, topics.state
        );

        let initial = store.load_light_state();
        Self {
            identity,
            topics,
            metadata,
            store,
            light: Arc::new(RwLock::new(initial)),
            connection: ConnectionState::Disconnected,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn metadata(&self) -> &DeviceMetadata {
        &self.metadata
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn light_state(&self) -> LightState {
        *self.light.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reader(&self) -> LightReader {
        LightReader::new(self.light.clone())
    }

    pub fn store(&self) -> &StateStore<B> {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn store_mut(&mut self) -> &mut StateStore<B> {
        &mut self.store
    }

    pub fn on_network_ready(&self) -> Vec<Outbound> {
        info!("network ready; starting mqtt transport");
        vec![Outbound::Connect]
    }

    pub fn handle(&mut self, event: MqttEvent) -> Vec<Outbound> {
        match event {
            MqttEvent::Connected => self.on_connected(),
            MqttEvent::Disconnected => {
                if self.connection == ConnectionState::Connected {
                    info!("mqtt disconnected; waiting for transport to reconnect");
                }
                self.connection = ConnectionState::Disconnected;
                Vec::new()
            }
            MqttEvent::Subscribed(id) => {
                info!("mqtt subscribed, msg_id={id}");
                Vec::new()
            }
            MqttEvent::Published(id) => {
                debug!("mqtt published, msg_id={id}");
                Vec::new()
            }
            MqttEvent::Data { topic, payload } => self.on_data(&topic, &payload),
            MqttEvent::Error(err) => {
                warn!("{err}");
                Vec::new()
            }
        }
    }

    fn on_connected(&mut self) -> Vec<Outbound> {
        info!("mqtt connected");
        self.connection = ConnectionState::Connected;

        vec![
            Outbound::Subscribe {
                topic: self.topics.command.clone(),
                qos: Qos::AtMostOnce,
            },
            Outbound::Publish {
                topic: self.topics.config.clone(),
                payload: encode_discovery(&self.identity, &self.topics, &self.metadata),
                qos: Qos::AtLeastOnce,
                retain: true,
            },
            self.state_publication(&self.light_state()),
        ]
    }

    fn on_data(&mut self, topic: &str, payload: &[u8]) -> Vec<Outbound> {
        if self.connection != ConnectionState::Connected {
            debug!("ignoring message on {topic} while disconnected");
            return Vec::new();
        }
        if topic != self.topics.command {
            debug!("ignoring message on unexpected topic {topic}");
            return Vec::new();
        }
        if payload.len() > MAX_COMMAND_BYTES {
            warn!("dropping oversized command payload ({} bytes)", payload.len());
            return Vec::new();
        }

        let previous = self.light_state();
        let next = match decode_command(payload, &previous) {
            Ok(next) => next,
            Err(err) => {
                warn!("{err}");
                return Vec::new();
            }
        };

        // Stored before it becomes visible or is confirmed to the hub.
        if let Err(err) = self.store.save_light_state(&next) {
            warn!("failed to persist light state, command not confirmed: {err}");
            return Vec::new();
        }
        *self.light.write().unwrap_or_else(PoisonError::into_inner) = next;

        vec![self.state_publication(&next)]
    }

    fn state_publication(&self, state: &LightState) -> Outbound {
        Outbound::Publish {
            topic: self.topics.state.clone(),
            payload: encode_state(state),
            qos: Qos::AtMostOnce,
            retain: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::TransportErrorKind,
        identity::{IdentitySource, IdentityStore},
        store::MemoryBackend,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    struct FixedMac([u8; 6]);

    impl IdentitySource for FixedMac {
        fn hardware_id(&mut self) -> Option<[u8; 6]> {
            Some(self.0)
        }

        fn random_u32(&mut self) -> u32 {
            unreachable!("hardware id available")
        }
    }

    fn engine_with(backend: MemoryBackend) -> SyncEngine<MemoryBackend> {
        let mut store = StateStore::init(backend).unwrap();
        let identity = IdentityStore::new()
            .get_or_create_identity(&mut store, &mut FixedMac([0, 0, 0, 0xa1, 0xb2, 0xc3]))
            .unwrap();
        SyncEngine::new(identity, DeviceMetadata::default(), store)
    }

    fn connected_engine() -> SyncEngine<MemoryBackend> {
        let mut engine = engine_with(MemoryBackend::new());
        engine.handle(MqttEvent::Connected);
        engine
    }

    fn command(engine: &SyncEngine<MemoryBackend>, payload: &str) -> MqttEvent {
        MqttEvent::Data {
            topic: engine.topics().command.clone(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn published_json(outbound: &Outbound) -> (String, Value, bool) {
        match outbound {
            Outbound::Publish {
                topic,
                payload,
                retain,
                ..
            } => (
                topic.clone(),
                serde_json::from_slice(payload).unwrap(),
                *retain,
            ),
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn first_boot_scenario() {
        let mut engine = engine_with(MemoryBackend::new());
        assert_eq!(engine.identity().as_str(), "a1b2c3");
        assert_eq!(engine.connection(), ConnectionState::Disconnected);
        assert_eq!(engine.on_network_ready(), vec![Outbound::Connect]);

        let actions = engine.handle(MqttEvent::Connected);
        assert_eq!(engine.connection(), ConnectionState::Connected);
        assert_eq!(actions.len(), 3);
        assert_eq!(
            actions[0],
            Outbound::Subscribe {
                topic: "homeassistant/light/a1b2c3_light/set".to_string(),
                qos: Qos::AtMostOnce,
            }
        );

        let (topic, discovery, retain) = published_json(&actions[1]);
        assert_eq!(topic, "homeassistant/light/a1b2c3_light/config");
        assert!(retain);
        assert_eq!(discovery["unique_id"], "a1b2c3_light");
        assert_eq!(discovery["device"]["ids"], json!(["a1b2c3"]));

        let (topic, state, retain) = published_json(&actions[2]);
        assert_eq!(topic, "homeassistant/light/a1b2c3_light/state");
        assert!(retain);
        assert_eq!(
            state,
            json!({"state":"OFF","brightness":0,"color":{"r":0,"g":0,"b":0,"w":0}})
        );

        let event = command(
            &engine,
            r#"{"state":"ON","color":{"r":4095,"g":0,"b":0,"w":0}}"#,
        );
        let actions = engine.handle(event);
        assert_eq!(actions.len(), 1);

        let (topic, echoed, retain) = published_json(&actions[0]);
        assert_eq!(topic, "homeassistant/light/a1b2c3_light/state");
        assert!(retain);
        assert_eq!(
            echoed,
            json!({"state":"ON","brightness":0,"color":{"r":4095,"g":0,"b":0,"w":0}})
        );

        let expected = LightState {
            is_on: true,
            r: 4095,
            ..LightState::default()
        };
        assert_eq!(engine.light_state(), expected);
        assert_eq!(engine.store().load_light_state(), expected);
    }

    #[test]
    fn reconnect_advertises_persisted_state() {
        let mut engine = connected_engine();
        let event = command(&engine, r#"{"state":"ON","brightness":900}"#);
        engine.handle(event);

        // Reboot: same storage, fresh engine.
        let backend = engine.store.into_backend();
        let mut engine = engine_with(backend);
        let actions = engine.handle(MqttEvent::Connected);

        let (_, state, _) = published_json(&actions[2]);
        assert_eq!(state["state"], "ON");
        assert_eq!(state["brightness"], 900);
    }

    #[test]
    fn repeated_connect_repeats_catch_up() {
        let mut engine = connected_engine();
        engine.handle(MqttEvent::Disconnected);
        assert_eq!(engine.connection(), ConnectionState::Disconnected);

        let actions = engine.handle(MqttEvent::Connected);
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], Outbound::Subscribe { .. }));
    }

    #[test]
    fn malformed_command_changes_nothing() {
        let mut engine = connected_engine();
        let before = engine.light_state();
        let commits = engine.store().backend().commits();

        let event = command(&engine, "not json");
        assert!(engine.handle(event).is_empty());
        assert_eq!(engine.light_state(), before);
        assert_eq!(engine.store().load_light_state(), before);
        assert_eq!(engine.store().backend().commits(), commits);
    }

    #[test]
    fn persist_failure_suppresses_confirmation() {
        let mut engine = connected_engine();
        engine.store_mut().backend_mut().fail_writes(true);

        let event = command(&engine, r#"{"state":"ON"}"#);
        assert!(engine.handle(event).is_empty());
        assert!(!engine.light_state().is_on);

        engine.store_mut().backend_mut().fail_writes(false);
        let event = command(&engine, r#"{"brightness":10}"#);
        let actions = engine.handle(event);
        let (_, state, _) = published_json(&actions[0]);
        assert_eq!(state["state"], "OFF");
        assert_eq!(state["brightness"], 10);
    }

    #[test]
    fn messages_while_disconnected_are_ignored() {
        let mut engine = engine_with(MemoryBackend::new());
        let event = command(&engine, r#"{"state":"ON"}"#);

        assert!(engine.handle(event).is_empty());
        assert!(!engine.light_state().is_on);
    }

    #[test]
    fn foreign_topics_are_ignored() {
        let mut engine = connected_engine();
        let actions = engine.handle(MqttEvent::Data {
            topic: "homeassistant/light/zzzzzz_light/set".to_string(),
            payload: br#"{"state":"ON"}"#.to_vec(),
        });

        assert!(actions.is_empty());
        assert!(!engine.light_state().is_on);
    }

    fn padded_command(len: usize) -> String {
        let body = r#"{"state":"ON"}"#;
        format!("{body}{}", " ".repeat(len - body.len()))
    }

    #[test]
    fn command_at_size_limit_is_accepted() {
        let mut engine = connected_engine();
        let payload = padded_command(MAX_COMMAND_BYTES);
        assert_eq!(payload.len(), 512);

        let event = command(&engine, &payload);
        let actions = engine.handle(event);

        assert_eq!(actions.len(), 1);
        assert!(engine.light_state().is_on);
    }

    #[test]
    fn command_over_size_limit_is_dropped() {
        let mut engine = connected_engine();
        let payload = padded_command(MAX_COMMAND_BYTES + 1);

        let event = command(&engine, &payload);

        assert!(engine.handle(event).is_empty());
        assert!(!engine.light_state().is_on);
        assert!(!engine.store().load_light_state().is_on);
    }

    #[test]
    fn out_of_range_command_is_clamped_before_echo() {
        let mut engine = connected_engine();
        let event = command(&engine, r#"{"brightness":65535,"color":{"w":5000}}"#);
        let actions = engine.handle(event);

        let (_, state, _) = published_json(&actions[0]);
        assert_eq!(state["brightness"], 4095);
        assert_eq!(state["color"]["w"], 4095);
        assert_eq!(engine.store().load_light_state().brightness, 4095);
    }

    #[test]
    fn reader_sees_committed_state() {
        let mut engine = connected_engine();
        let reader = engine.reader();
        assert_eq!(reader.snapshot(), LightState::default());

        let event = command(&engine, r#"{"state":"ON","color":{"b":77}}"#);
        engine.handle(event);

        let snapshot = reader.snapshot();
        assert!(snapshot.is_on);
        assert_eq!(snapshot.b, 77);
    }

    #[test]
    fn bookkeeping_events_produce_no_output() {
        let mut engine = connected_engine();
        let before = engine.light_state();

        assert!(engine.handle(MqttEvent::Subscribed(1)).is_empty());
        assert!(engine.handle(MqttEvent::Published(2)).is_empty());
        assert!(engine
            .handle(MqttEvent::Error(TransportError::new(
                TransportErrorKind::Connection,
                "connection reset"
            )))
            .is_empty());
        assert_eq!(engine.connection(), ConnectionState::Connected);
        assert_eq!(engine.light_state(), before);
    }
}
