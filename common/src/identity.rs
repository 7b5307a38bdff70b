use std::fmt;

use log::{info, warn};

use crate::{
    error::IdentityError,
    store::{KvBackend, StateStore},
};

pub const DEVICE_ID_LENGTH: usize = 6;

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Six lowercase alphanumeric characters naming this device on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Accepts exactly six ASCII lowercase letters or digits.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == DEVICE_ID_LENGTH
            && value
                .bytes()
                .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit());
        valid.then(|| Self(value.to_string()))
    }

    /// Accepts a trailing NUL, as left by ids written as C strings.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
        core::str::from_utf8(raw).ok().and_then(Self::parse)
    }

    /// Uses the NIC-specific half of a MAC address, hex encoded.
    pub fn from_hardware_id(mac: [u8; 6]) -> Self {
        Self(format!("{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5]))
    }

    pub fn random(source: &mut impl IdentitySource) -> Self {
        let id = (0..DEVICE_ID_LENGTH)
            .map(|_| {
                let index = source.random_u32() as usize % ID_CHARSET.len();
                char::from(ID_CHARSET[index])
            })
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entropy and hardware facts used when a device has no stored identity yet.
pub trait IdentitySource {
    /// Factory-programmed unique id (station MAC), if the target has one.
    fn hardware_id(&mut self) -> Option<[u8; 6]>;

    /// Unpredictable value; must not come from a fixed seed.
    fn random_u32(&mut self) -> u32;
}

/// Resolves the device identity once per boot and caches it.
#[derive(Debug, Default)]
pub struct IdentityStore {
    cached: Option<DeviceIdentity>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create_identity<B, S>(
        &mut self,
        store: &mut StateStore<B>,
        source: &mut S,
    ) -> Result<DeviceIdentity, IdentityError>
    where
        B: KvBackend,
        S: IdentitySource,
    {
        if let Some(identity) = &self.cached {
            return Ok(identity.clone());
        }

        let identity = match store.get_identity()? {
            Some(identity) => {
                info!("loaded device id {identity}");
                identity
            }
            None => {
                let identity = match source.hardware_id() {
                    Some(mac) => DeviceIdentity::from_hardware_id(mac),
                    None => {
                        warn!("no hardware id available; generating random device id");
                        DeviceIdentity::random(source)
                    }
                };
                store.set_identity(&identity)?;
                info!("new device id created and stored: {identity}");
                identity
            }
        };

        self.cached = Some(identity.clone());
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    struct ScriptedSource {
        mac: Option<[u8; 6]>,
        next: u32,
        hardware_calls: usize,
    }

    impl ScriptedSource {
        fn with_mac(mac: [u8; 6]) -> Self {
            Self {
                mac: Some(mac),
                next: 0,
                hardware_calls: 0,
            }
        }

        fn without_mac(start: u32) -> Self {
            Self {
                mac: None,
                next: start,
                hardware_calls: 0,
            }
        }
    }

    impl IdentitySource for ScriptedSource {
        fn hardware_id(&mut self) -> Option<[u8; 6]> {
            self.hardware_calls += 1;
            self.mac
        }

        fn random_u32(&mut self) -> u32 {
            let value = self.next;
            self.next = self.next.wrapping_add(7);
            value
        }
    }

    fn open_store(backend: MemoryBackend) -> StateStore<MemoryBackend> {
        StateStore::init(backend).unwrap()
    }

    #[test]
    fn derives_from_hardware_id() {
        let mut store = open_store(MemoryBackend::new());
        let mut source = ScriptedSource::with_mac([0x24, 0x6f, 0x28, 0xa1, 0xb2, 0xc3]);

        let identity = IdentityStore::new()
            .get_or_create_identity(&mut store, &mut source)
            .unwrap();

        assert_eq!(identity.as_str(), "a1b2c3");
        assert_eq!(store.get_identity().unwrap(), Some(identity));
    }

    #[test]
    fn falls_back_to_random_alphanumeric() {
        let mut store = open_store(MemoryBackend::new());
        let mut source = ScriptedSource::without_mac(0);

        let identity = IdentityStore::new()
            .get_or_create_identity(&mut store, &mut source)
            .unwrap();

        // 0, 7, 14, 21, 28, 35 index into the charset.
        assert_eq!(identity.as_str(), "ahov29");
    }

    #[test]
    fn random_ids_depend_on_entropy() {
        let first = DeviceIdentity::random(&mut ScriptedSource::without_mac(1));
        let second = DeviceIdentity::random(&mut ScriptedSource::without_mac(2));
        assert_ne!(first, second);
        assert!(DeviceIdentity::parse(first.as_str()).is_some());
    }

    #[test]
    fn stable_across_reboot() {
        let mut store = open_store(MemoryBackend::new());
        let first = IdentityStore::new()
            .get_or_create_identity(&mut store, &mut ScriptedSource::without_mac(3))
            .unwrap();

        // Process memory cleared, storage kept.
        let backend = store.into_backend();
        let mut store = open_store(backend);
        let mut source = ScriptedSource::with_mac([0, 0, 0, 0xde, 0xad, 0x01]);
        let second = IdentityStore::new()
            .get_or_create_identity(&mut store, &mut source)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(source.hardware_calls, 0);
    }

    #[test]
    fn cached_after_first_resolution() {
        let mut store = open_store(MemoryBackend::new());
        let mut identities = IdentityStore::new();
        let mut source = ScriptedSource::with_mac([0, 0, 0, 0x10, 0x20, 0x30]);

        let first = identities
            .get_or_create_identity(&mut store, &mut source)
            .unwrap();
        store.backend_mut().fail_reads(true);
        let second = identities
            .get_or_create_identity(&mut store, &mut source)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(source.hardware_calls, 1);
    }

    #[test]
    fn invalid_stored_identity_is_replaced() {
        let mut backend = MemoryBackend::new();
        backend.insert("device_id", b"NOT-OK");
        let mut store = open_store(backend);
        let mut source = ScriptedSource::with_mac([0, 0, 0, 0x0a, 0x0b, 0x0c]);

        let identity = IdentityStore::new()
            .get_or_create_identity(&mut store, &mut source)
            .unwrap();

        assert_eq!(identity.as_str(), "0a0b0c");
    }

    #[test]
    fn nul_terminated_stored_identity_is_kept() {
        let mut backend = MemoryBackend::new();
        backend.insert("device_id", b"k3x9q0\0");
        let mut store = open_store(backend);
        let mut source = ScriptedSource::with_mac([0, 0, 0, 0x0a, 0x0b, 0x0c]);

        let identity = IdentityStore::new()
            .get_or_create_identity(&mut store, &mut source)
            .unwrap();

        assert_eq!(identity.as_str(), "k3x9q0");
        assert_eq!(source.hardware_calls, 0);
        assert_eq!(store.backend().raw("device_id"), Some(&b"k3x9q0\0"[..]));
    }

    #[test]
    fn fails_when_identity_cannot_be_persisted() {
        let mut store = open_store(MemoryBackend::new());
        store.backend_mut().fail_writes(true);

        let result = IdentityStore::new()
            .get_or_create_identity(&mut store, &mut ScriptedSource::without_mac(0));

        assert!(matches!(result, Err(IdentityError::StorageUnavailable(_))));
    }

    #[test]
    fn parse_rejects_wrong_shape() {
        assert!(DeviceIdentity::parse("abc12").is_none());
        assert!(DeviceIdentity::parse("abc1234").is_none());
        assert!(DeviceIdentity::parse("ABC123").is_none());
        assert!(DeviceIdentity::parse("ab_123").is_none());
        assert!(DeviceIdentity::parse("a1b2c3").is_some());
    }
}
