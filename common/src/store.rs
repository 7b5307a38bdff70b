//! Durable storage for the device identity and the light-state record.
//!
//! The raw store is any [`KvBackend`] (NVS on the device, a directory of
//! files on the host). [`StateStore`] layers the recovery policy and the
//! checksummed record format on top of it.

use std::collections::{HashMap, VecDeque};

use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::{error::StorageError, identity::DeviceIdentity, types::LightState};

pub const NAMESPACE: &str = "device_cfg";
pub const DEVICE_ID_KEY: &str = "device_id";
pub const LIGHT_STATE_KEY: &str = "light_state";

const RECORD_MAGIC: u16 = 0xBEEF;
const RECORD_VERSION: u8 = 1;
const RECORD_BODY_SIZE: usize = 14;
const RECORD_CHECKSUM_SIZE: usize = 4;
pub const LIGHT_RECORD_SIZE: usize = RECORD_BODY_SIZE + RECORD_CHECKSUM_SIZE;

/// Opaque key/value byte store scoped to one namespace.
pub trait KvBackend {
    /// Opens the store. Returns [`StorageError::Corrupt`] when the backing
    /// medium needs an erase before it can be used.
    fn init(&mut self) -> Result<(), StorageError>;
    fn erase(&mut self) -> Result<(), StorageError>;
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set_bytes(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
}

#[derive(Debug)]
pub struct StateStore<B: KvBackend> {
    backend: B,
}

impl<B: KvBackend> StateStore<B> {
    /// Opens the backend, erasing and retrying once if it reports corruption.
    pub fn init(mut backend: B) -> Result<Self, StorageError> {
        match backend.init() {
            Ok(()) => {}
            Err(StorageError::Corrupt(reason)) => {
                warn!("storage corrupt ({reason}); erasing and reinitializing");
                backend.erase().map_err(into_unavailable)?;
                backend.init().map_err(into_unavailable)?;
            }
            Err(err) => return Err(err),
        }
        Ok(Self { backend })
    }

    pub fn load_light_state(&self) -> LightState {
        match self.backend.get_bytes(LIGHT_STATE_KEY) {
            Ok(Some(raw)) => match decode_record(&raw) {
                Ok(state) => {
                    info!(
                        "loaded light state - on: {}, r: {}, g: {}, b: {}, w: {}, brightness: {}",
                        state.is_on, state.r, state.g, state.b, state.w, state.brightness
                    );
                    state
                }
                Err(err) => {
                    warn!("discarding stored light state: {err}");
                    LightState::default()
                }
            },
            Ok(None) => {
                info!("no saved light state found, using defaults");
                LightState::default()
            }
            Err(err) => {
                warn!("failed to read light state, using defaults: {err}");
                LightState::default()
            }
        }
    }

    pub fn save_light_state(&mut self, state: &LightState) -> Result<(), StorageError> {
        let record = encode_record(state);
        self.backend.set_bytes(LIGHT_STATE_KEY, &record)?;
        self.backend.commit()?;
        info!(
            "stored light state - on: {}, r: {}, g: {}, b: {}, w: {}, brightness: {}",
            state.is_on, state.r, state.g, state.b, state.w, state.brightness
        );
        Ok(())
    }

    /// Stored identity, or `None` when absent or not a valid identity.
    pub fn get_identity(&self) -> Result<Option<DeviceIdentity>, StorageError> {
        let Some(raw) = self.backend.get_bytes(DEVICE_ID_KEY)? else {
            return Ok(None);
        };

        let identity = DeviceIdentity::from_bytes(&raw);
        if identity.is_none() {
            warn!("ignoring malformed stored device id ({} bytes)", raw.len());
        }
        Ok(identity)
    }

    pub fn set_identity(&mut self, identity: &DeviceIdentity) -> Result<(), StorageError> {
        self.backend.set_bytes(DEVICE_ID_KEY, identity.as_bytes())?;
        self.backend.commit()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

fn into_unavailable(err: StorageError) -> StorageError {
    match err {
        StorageError::Corrupt(reason) => {
            StorageError::Unavailable(format!("still corrupt after erase: {reason}"))
        }
        other => other,
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
enum RecordError {
    #[error("unexpected record size {0}")]
    WrongSize(usize),
    #[error("bad magic header {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

fn record_checksum(body: &[u8]) -> [u8; RECORD_CHECKSUM_SIZE] {
    let digest = Sha256::digest(body);
    let mut checksum = [0_u8; RECORD_CHECKSUM_SIZE];
    checksum.copy_from_slice(&digest[..RECORD_CHECKSUM_SIZE]);
    checksum
}

fn encode_record(state: &LightState) -> [u8; LIGHT_RECORD_SIZE] {
    let mut record = [0_u8; LIGHT_RECORD_SIZE];
    record[0..2].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    record[2] = RECORD_VERSION;
    record[3] = u8::from(state.is_on);

    let channels = [state.r, state.g, state.b, state.w, state.brightness];
    for (index, value) in channels.iter().enumerate() {
        let offset = 4 + index * 2;
        record[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    let checksum = record_checksum(&record[..RECORD_BODY_SIZE]);
    record[RECORD_BODY_SIZE..].copy_from_slice(&checksum);
    record
}

fn decode_record(raw: &[u8]) -> Result<LightState, RecordError> {
    if raw.len() != LIGHT_RECORD_SIZE {
        return Err(RecordError::WrongSize(raw.len()));
    }

    let magic = u16::from_le_bytes([raw[0], raw[1]]);
    if magic != RECORD_MAGIC {
        return Err(RecordError::BadMagic(magic));
    }
    if raw[2] != RECORD_VERSION {
        return Err(RecordError::UnsupportedVersion(raw[2]));
    }
    if record_checksum(&raw[..RECORD_BODY_SIZE])[..] != raw[RECORD_BODY_SIZE..] {
        return Err(RecordError::ChecksumMismatch);
    }

    let channel = |index: usize| {
        let offset = 4 + index * 2;
        u16::from_le_bytes([raw[offset], raw[offset + 1]])
    };

    let mut state = LightState {
        is_on: raw[3] != 0,
        r: channel(0),
        g: channel(1),
        b: channel(2),
        w: channel(3),
        brightness: channel(4),
    };
    state.sanitize();
    Ok(state)
}

/// In-memory backend with failure injection.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: HashMap<String, Vec<u8>>,
    init_failures: VecDeque<StorageError>,
    fail_reads: bool,
    fail_writes: bool,
    init_calls: usize,
    erase_calls: usize,
    commits: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error for the next `init` call; queued errors are consumed
    /// in order.
    pub fn fail_init_with(&mut self, err: StorageError) {
        self.init_failures.push_back(err);
    }

    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn insert(&mut self, key: &str, value: &[u8]) {
        self.entries.insert(key.to_string(), value.to_vec());
    }

    pub fn raw(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls
    }

    pub fn erase_calls(&self) -> usize {
        self.erase_calls
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl KvBackend for MemoryBackend {
    fn init(&mut self) -> Result<(), StorageError> {
        self.init_calls += 1;
        match self.init_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.erase_calls += 1;
        self.entries.clear();
        Ok(())
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if self.fail_reads {
            return Err(StorageError::Unavailable("injected read failure".into()));
        }
        Ok(self.entries.get(key).cloned())
    }

    fn set_bytes(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Unavailable("injected commit failure".into()));
        }
        self.commits += 1;
        Ok(())
    }
}
