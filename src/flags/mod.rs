//! Durable per-device booleans that survive restarts.
//!
//! Keys and stored values match what the web client kept in local storage so
//! that an exported store stays readable by either client:
//! `calibrado = "1"` and `session_ended_<device_id> = "true"`.

use std::{collections::HashMap, future::Future, sync::Mutex};

use anyhow::{anyhow, Result};

use crate::{db::Database, launch::DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Calibrated,
    SessionEndedReported,
}

impl Flag {
    /// `calibrado` is a single key; one client instance owns one device.
    pub fn storage_key(self, device: &DeviceId) -> String {
        match self {
            Flag::Calibrated => "calibrado".to_string(),
            Flag::SessionEndedReported => format!("session_ended_{device}"),
        }
    }

    fn set_value(self) -> &'static str {
        match self {
            Flag::Calibrated => "1",
            Flag::SessionEndedReported => "true",
        }
    }
}

pub trait FlagStore: Send + Sync + 'static {
    fn get(&self, device: &DeviceId, flag: Flag) -> impl Future<Output = Result<bool>> + Send;
    fn set(&self, device: &DeviceId, flag: Flag) -> impl Future<Output = Result<()>> + Send;
    fn clear(&self, device: &DeviceId, flag: Flag) -> impl Future<Output = Result<()>> + Send;
}

pub struct SqliteFlagStore {
    db: Database,
}

impl SqliteFlagStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl FlagStore for SqliteFlagStore {
    async fn get(&self, device: &DeviceId, flag: Flag) -> Result<bool> {
        let value = self.db.get_flag_value(&flag.storage_key(device)).await?;
        Ok(value.as_deref() == Some(flag.set_value()))
    }

    async fn set(&self, device: &DeviceId, flag: Flag) -> Result<()> {
        self.db
            .put_flag_value(&flag.storage_key(device), flag.set_value())
            .await
    }

    async fn clear(&self, device: &DeviceId, flag: Flag) -> Result<()> {
        self.db.delete_flag(&flag.storage_key(device)).await
    }
}

/// Volatile store for `--ephemeral` runs and tests.
#[derive(Default)]
pub struct MemoryFlagStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_values<T>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> T) -> Result<T> {
        let mut guard = self
            .values
            .lock()
            .map_err(|_| anyhow!("flag store lock poisoned"))?;
        Ok(f(&mut guard))
    }
}

impl FlagStore for MemoryFlagStore {
    async fn get(&self, device: &DeviceId, flag: Flag) -> Result<bool> {
        let key = flag.storage_key(device);
        self.with_values(|values| values.get(&key).map(String::as_str) == Some(flag.set_value()))
    }

    async fn set(&self, device: &DeviceId, flag: Flag) -> Result<()> {
        let key = flag.storage_key(device);
        self.with_values(|values| {
            values.insert(key, flag.set_value().to_string());
        })
    }

    async fn clear(&self, device: &DeviceId, flag: Flag) -> Result<()> {
        let key = flag.storage_key(device);
        self.with_values(|values| {
            values.remove(&key);
        })
    }
}

/// Store chosen at startup (`--ephemeral` picks memory).
pub enum AnyFlagStore {
    Sqlite(SqliteFlagStore),
    Memory(MemoryFlagStore),
}

impl FlagStore for AnyFlagStore {
    async fn get(&self, device: &DeviceId, flag: Flag) -> Result<bool> {
        match self {
            AnyFlagStore::Sqlite(store) => store.get(device, flag).await,
            AnyFlagStore::Memory(store) => store.get(device, flag).await,
        }
    }

    async fn set(&self, device: &DeviceId, flag: Flag) -> Result<()> {
        match self {
            AnyFlagStore::Sqlite(store) => store.set(device, flag).await,
            AnyFlagStore::Memory(store) => store.set(device, flag).await,
        }
    }

    async fn clear(&self, device: &DeviceId, flag: Flag) -> Result<()> {
        match self {
            AnyFlagStore::Sqlite(store) => store.clear(device, flag).await,
            AnyFlagStore::Memory(store) => store.clear(device, flag).await,
        }
    }
}
