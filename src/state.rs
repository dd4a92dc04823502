//! Persisted challenge state
//!
//! A [`StateStore`] is an ordered key/value map with an explicit split between
//! `initialize` (allowed once) and `merge` (always allowed, never removes keys).
//! Stores cross the build/run process boundary as a versioned JSON blob.

use crate::error::{GateError, GateResult};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Identifier written into every state blob
const BLOB_FORMAT: &str = "ctfgate-state";
/// Current blob schema version
const BLOB_VERSION: u32 = 1;

/// File name of the private store inside the state directory
pub const PRIVATE_STATE_FILE: &str = "state.json";
/// File name of the public store inside the state directory
pub const PUBLIC_STATE_FILE: &str = "state_public.json";

/// Ordered key/value store with merge semantics
#[derive(Debug, Clone)]
pub struct StateStore {
    name: String,
    entries: BTreeMap<String, Value>,
    initialized: bool,
}

/// On-disk representation of a store
#[derive(Debug, Serialize, Deserialize)]
struct StateBlob {
    format: String,
    version: u32,
    entries: BTreeMap<String, Value>,
}

impl StateStore {
    /// Create an empty, uninitialized store. The name only shows up in errors and logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set the initial contents. Fails if the store was already initialized.
    pub fn initialize<I, K>(&mut self, values: I) -> GateResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        if self.initialized {
            return Err(GateError::StateInitialization(self.name.clone()));
        }
        self.merge(values);
        self.initialized = true;
        Ok(())
    }

    /// Insert or overwrite every key in `values`. Existing keys not in `values` are kept.
    pub fn merge<I, K>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (key, value) in values {
            self.entries.insert(key.into(), value);
        }
    }

    /// Insert or overwrite a single key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Look up a key. Missing keys are `None`, never an error.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Look up a key and decode it. Missing or mistyped keys are `None`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.entries
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Look up a key and decode it, falling back to `default`
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_as(key).unwrap_or(default)
    }

    /// View a nested object as its own store
    pub fn sub_store(&self, key: &str) -> Option<StateStore> {
        match self.entries.get(key)? {
            Value::Object(map) => {
                let mut store = StateStore::new(format!("{}.{}", self.name, key));
                store.merge(map.clone());
                Some(store)
            }
            _ => None,
        }
    }

    /// Nest another store under `key`
    pub fn set_store(&mut self, key: impl Into<String>, store: &StateStore) {
        self.entries.insert(key.into(), store.to_value());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The whole store as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Encode the store as a durable blob
    pub fn serialize(&self) -> GateResult<Vec<u8>> {
        let blob = StateBlob {
            format: BLOB_FORMAT.to_string(),
            version: BLOB_VERSION,
            entries: self.entries.clone(),
        };
        serde_json::to_vec_pretty(&blob).map_err(|e| GateError::StateFormat(e.to_string()))
    }

    /// Decode a blob produced by [`StateStore::serialize`] into a fresh, uninitialized store
    pub fn deserialize(name: impl Into<String>, bytes: &[u8]) -> GateResult<Self> {
        let blob: StateBlob =
            serde_json::from_slice(bytes).map_err(|e| GateError::StateFormat(e.to_string()))?;

        if blob.format != BLOB_FORMAT {
            return Err(GateError::StateFormat(format!(
                "unexpected format '{}'",
                blob.format
            )));
        }
        if blob.version != BLOB_VERSION {
            return Err(GateError::StateFormat(format!(
                "unsupported version {} (expected {})",
                blob.version, BLOB_VERSION
            )));
        }

        let mut store = StateStore::new(name);
        store.merge(blob.entries);
        Ok(store)
    }

    /// Write the blob to `path`
    pub fn save(&self, path: &Path) -> GateResult<()> {
        let bytes = self.serialize()?;
        std::fs::write(path, bytes).map_err(|source| GateError::StateIo {
            path: path.display().to_string(),
            source,
        })?;
        debug!(store = %self.name, path = %path.display(), keys = self.len(), "State saved");
        Ok(())
    }

    /// Read a blob from `path`
    pub fn load(name: impl Into<String>, path: &Path) -> GateResult<Self> {
        let bytes = std::fs::read(path).map_err(|source| GateError::StateIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::deserialize(name, &bytes)
    }
}

impl PartialEq for StateStore {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// A store shared between the phase logic, background tasks and request handlers.
///
/// Writers take the single write lock; handlers only take short read locks.
#[derive(Debug, Clone)]
pub struct SharedState(Arc<RwLock<StateStore>>);

impl SharedState {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(StateStore::new(name))))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, StateStore> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, StateStore> {
        self.0.write()
    }

    /// Clone the current contents as a JSON object
    pub fn snapshot(&self) -> Value {
        self.0.read().to_value()
    }
}

/// The private and public stores of one challenge
#[derive(Debug, Clone)]
pub struct ChallengeState {
    pub private: SharedState,
    pub public: SharedState,
}

impl Default for ChallengeState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeState {
    pub fn new() -> Self {
        Self {
            private: SharedState::new("state"),
            public: SharedState::new("state_public"),
        }
    }

    /// Look a key up in the public store first, then the private one
    pub fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.public.read().get(key) {
            return Some(value.clone());
        }
        self.private.read().get(key).cloned()
    }

    /// Persist both stores into `dir`
    pub fn persist(&self, dir: &Path) -> GateResult<()> {
        std::fs::create_dir_all(dir).map_err(|source| GateError::StateIo {
            path: dir.display().to_string(),
            source,
        })?;
        self.private.read().save(&private_path(dir))?;
        self.public.read().save(&public_path(dir))?;
        info!(dir = %dir.display(), "Challenge state persisted");
        Ok(())
    }

    /// Load both stores from `dir` and merge them into this state.
    ///
    /// Keys already present are overwritten by the persisted values; nothing is removed.
    pub fn restore(&self, dir: &Path) -> GateResult<()> {
        let private = StateStore::load("state", &private_path(dir))?;
        let public = StateStore::load("state_public", &public_path(dir))?;

        let (private_keys, public_keys) = (private.len(), public.len());
        self.private.write().merge(private.entries);
        self.public.write().merge(public.entries);

        info!(
            dir = %dir.display(),
            private_keys,
            public_keys,
            "Challenge state restored"
        );
        Ok(())
    }
}

fn private_path(dir: &Path) -> PathBuf {
    dir.join(PRIVATE_STATE_FILE)
}

fn public_path(dir: &Path) -> PathBuf {
    dir.join(PUBLIC_STATE_FILE)
}
