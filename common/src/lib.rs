pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod store;
pub mod sync;
pub mod topics;
pub mod types;

pub use codec::{decode_command, encode_discovery, encode_state, StateDocument};
pub use config::{DeviceMetadata, NetworkConfig, RuntimeConfig};
pub use error::{CodecError, IdentityError, StorageError, TransportError, TransportErrorKind};
pub use identity::{DeviceIdentity, IdentitySource, IdentityStore};
pub use store::{KvBackend, MemoryBackend, StateStore, NAMESPACE};
pub use sync::{ConnectionState, MqttEvent, Outbound, Qos, SyncEngine};
pub use topics::{derive_topics, TopicSet};
pub use types::{LightReader, LightState, CHANNEL_MAX};
