//! Process-wide table of discovered motors (spec §3 `MotorRecord`/`Registry`,
//! §4.7 C7).
//!
//! The registry is a single `tokio::sync::Mutex<HashMap<u8, MotorRecord>>`
//! behind a small wrapper. Discovery (`mcp-discovery`) and the HTTP surface
//! mutate it; DMX ingest only reads a snapshot. There is deliberately no
//! fine-grained per-motor locking: the registry is mutated rarely (on
//! rescans and manual parameter edits) and read cheaply by cloning out of
//! the lock, so a single mutex is the simplest correct design.

use std::collections::HashMap;

use tokio::sync::Mutex;

/// A discovered motor and the per-motor parameters the bridge applies to it.
///
/// `addr` always equals the key this record is stored under in the
/// registry (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MotorRecord {
    pub addr: u8,
    pub max_speed: i32,
    pub min_speed: i32,
    pub accel: i32,
    pub max_pos: i32,
    pub last_known_temp: Option<i32>,
}

/// Defaults applied to every `MotorRecord` created by discovery, sourced
/// from configuration (spec §3 "Default values are set from configuration
/// on discovery").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryDefaults {
    pub max_speed: i32,
    pub min_speed: i32,
    pub accel: i32,
    pub max_pos: i32,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            max_speed: 1000,
            min_speed: 1,
            accel: 1000,
            max_pos: 5000,
        }
    }
}

impl RegistryDefaults {
    /// Build a fresh `MotorRecord` for a newly discovered motor at `addr`,
    /// carrying the probed temperature if one was obtained.
    pub fn seed(&self, addr: u8, last_known_temp: Option<i32>) -> MotorRecord {
        MotorRecord {
            addr,
            max_speed: self.max_speed,
            min_speed: self.min_speed,
            accel: self.accel,
            max_pos: self.max_pos,
            last_known_temp,
        }
    }
}

/// The shared motor table. Share via `Arc`; every operation takes `&self`.
#[derive(Default)]
pub struct Registry {
    motors: Mutex<HashMap<u8, MotorRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            motors: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically discard the current table and install `motors` in its
    /// place (spec §4.4: "Result replaces the registry atomically at end of
    /// scan"). Panics in debug builds if two records share an address or a
    /// record's `addr` field disagrees with itself as a key — both would
    /// violate the spec §3 invariant and indicate a bug in the caller.
    pub async fn replace(&self, motors: impl IntoIterator<Item = MotorRecord>) {
        let mut table = HashMap::new();
        for motor in motors {
            let addr = motor.addr;
            let prior = table.insert(addr, motor);
            debug_assert!(prior.is_none(), "duplicate motor address {addr}");
        }
        *self.motors.lock().await = table;
    }

    /// Look up a single motor by address.
    pub async fn get(&self, addr: u8) -> Option<MotorRecord> {
        self.motors.lock().await.get(&addr).copied()
    }

    /// Snapshot every motor currently known, in unspecified order.
    pub async fn snapshot(&self) -> Vec<MotorRecord> {
        self.motors.lock().await.values().copied().collect()
    }

    /// The set of addresses currently known, in unspecified order.
    pub async fn addrs(&self) -> Vec<u8> {
        self.motors.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.motors.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.motors.lock().await.is_empty()
    }

    /// Mutate the record at `addr` in place if it exists, returning whether
    /// a record was found. Used by the HTTP surface for single-field
    /// parameter edits (`/p/setmaxpos` and friends).
    pub async fn update(&self, addr: u8, f: impl FnOnce(&mut MotorRecord)) -> bool {
        let mut table = self.motors.lock().await;
        match table.get_mut(&addr) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Insert or overwrite a single record (used by configuration load,
    /// which seeds the registry without running discovery).
    pub async fn insert(&self, motor: MotorRecord) {
        self.motors.lock().await.insert(motor.addr, motor);
    }
}
