//! Named on-disk configuration snapshots (spec §4.8, C8).
//!
//! A `NamedConfiguration` is a single JSON document per name containing the
//! registry's motor parameters and the DMX universe. One name may be marked
//! "default" by repointing a `default.json` pointer at it; at boot, C10
//! loads `default` if present, seeding the registry and DMX universe before
//! discovery runs.
//!
//! The distilled source keeps two sibling files per name (motors and
//! Art-Net, written with two separate `open`/`write` calls) and repoints two
//! separate `default.json`/`default_artnet.json` symlinks. A crash between
//! the two writes leaves an inconsistent pair. This crate keeps both halves
//! in one file, written with a single `tokio::fs::write`, so there is no
//! window where a save is half-applied.

use std::path::{Path, PathBuf};

use motor_registry::MotorRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const DEFAULT_NAME: &str = "default";

/// The on-disk projection of a [`MotorRecord`]: everything but
/// `last_known_temp`, which is runtime telemetry and has no business being
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMotorConfig {
    pub addr: u8,
    pub max_speed: i32,
    pub min_speed: i32,
    pub accel: i32,
    pub max_pos: i32,
}

impl From<MotorRecord> for StoredMotorConfig {
    fn from(motor: MotorRecord) -> Self {
        Self {
            addr: motor.addr,
            max_speed: motor.max_speed,
            min_speed: motor.min_speed,
            accel: motor.accel,
            max_pos: motor.max_pos,
        }
    }
}

impl StoredMotorConfig {
    /// Rehydrate into a [`MotorRecord`] with no known temperature — the
    /// caller is responsible for re-probing it if desired.
    pub fn into_record(self) -> MotorRecord {
        MotorRecord {
            addr: self.addr,
            max_speed: self.max_speed,
            min_speed: self.min_speed,
            accel: self.accel,
            max_pos: self.max_pos,
            last_known_temp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtnetConfig {
    pub universe: u16,
}

/// A saved snapshot of the registry and DMX universe, addressable by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedConfiguration {
    pub motors: Vec<StoredMotorConfig>,
    pub artnet: StoredArtnetConfig,
}

/// One entry in [`list_named`]'s result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSummary {
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no configuration named {0:?}")]
    NotFound(String),
}

fn config_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

fn default_path(dir: &Path) -> PathBuf {
    dir.join(format!("{DEFAULT_NAME}.json"))
}

/// Load a named configuration. Passing `"default"` loads whatever
/// `default.json` currently points at (or is a copy of, on platforms
/// without symlink support); if no default has ever been set this returns
/// `ConfigError::NotFound`, which callers at boot treat as "start with an
/// empty registry", not a fatal error.
pub async fn load_named(dir: &Path, name: &str) -> Result<NamedConfiguration, ConfigError> {
    let path = config_path(dir, name);
    let bytes = tokio::fs::read(&path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(name.to_string())
        } else {
            ConfigError::Io(err)
        }
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write `config` to `dir/{name}.json`. If `set_default` is true, also
/// repoint `dir/default.json` at the freshly written file (spec §4.8).
pub async fn save_named(
    dir: &Path,
    name: &str,
    config: &NamedConfiguration,
    set_default: bool,
) -> Result<(), ConfigError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = config_path(dir, name);
    let json = serde_json::to_vec_pretty(config)?;
    tokio::fs::write(&path, json).await?;

    if set_default {
        point_default_at(dir, &path).await?;
    }
    Ok(())
}

/// List every saved configuration, reporting which one (if any) is
/// currently the default.
pub async fn list_named(dir: &Path) -> Result<Vec<ConfigSummary>, ConfigError> {
    let default_target = current_default_target(dir).await;

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut summaries = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some("default.json") {
            continue;
        }
        let Some(name) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|_| path.extension().and_then(|e| e.to_str()) == Some("json"))
        else {
            continue;
        };
        let is_default = default_target
            .as_deref()
            .is_some_and(|target| paths_equivalent(target, &path));
        summaries.push(ConfigSummary {
            name: name.to_string(),
            is_default,
        });
    }
    Ok(summaries)
}

/// Delete a named configuration file. Deleting the configuration that
/// `default.json` points at leaves a dangling default, which [`load_named`]
/// surfaces as [`ConfigError::NotFound`] — treated as "no default" at boot,
/// not a crash (spec §4.8).
pub async fn delete_named(dir: &Path, name: &str) -> Result<(), ConfigError> {
    let path = config_path(dir, name);
    tokio::fs::remove_file(&path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(name.to_string())
        } else {
            ConfigError::Io(err)
        }
    })
}

#[cfg(unix)]
async fn point_default_at(dir: &Path, target: &Path) -> Result<(), ConfigError> {
    let default_path = default_path(dir);
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if default_path.symlink_metadata().is_ok() {
            std::fs::remove_file(&default_path)?;
        }
        std::os::unix::fs::symlink(&target, &default_path)
    })
    .await
    .expect("spawn_blocking panicked")?;
    Ok(())
}

/// Platforms without unprivileged symlink creation (see DESIGN.md) fall
/// back to copying the file; `default.json` is then a snapshot rather than
/// a live pointer, so it goes stale if `name` is later overwritten without
/// also resaving as default.
#[cfg(not(unix))]
async fn point_default_at(dir: &Path, target: &Path) -> Result<(), ConfigError> {
    let default_path = default_path(dir);
    let _ = tokio::fs::remove_file(&default_path).await;
    tokio::fs::copy(target, &default_path).await?;
    Ok(())
}

/// The path `default.json` currently resolves to, if it exists at all.
/// On unix this follows the symlink; elsewhere (a plain copy) there is no
/// link to follow, so the default's own path stands in for comparison.
async fn current_default_target(dir: &Path) -> Option<PathBuf> {
    let default_path = default_path(dir);
    #[cfg(unix)]
    {
        tokio::task::spawn_blocking(move || std::fs::read_link(&default_path).ok())
            .await
            .unwrap_or(None)
    }
    #[cfg(not(unix))]
    {
        default_path.exists().then_some(default_path)
    }
}

fn paths_equivalent(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> NamedConfiguration {
        NamedConfiguration {
            motors: vec![
                StoredMotorConfig { addr: 1, max_speed: 1000, min_speed: 10, accel: 500, max_pos: 5000 },
                StoredMotorConfig { addr: 2, max_speed: 800, min_speed: 5, accel: 400, max_pos: 3000 },
            ],
            artnet: StoredArtnetConfig { universe: 3 },
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let config = sample();
        save_named(dir.path(), "show-a", &config, false).await.unwrap();
        let loaded = load_named(dir.path(), "show-a").await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn loading_an_unknown_name_is_not_found() {
        let dir = tempdir().unwrap();
        let err = load_named(dir.path(), "nope").await.unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn set_default_makes_default_loadable() {
        let dir = tempdir().unwrap();
        let config = sample();
        save_named(dir.path(), "show-a", &config, true).await.unwrap();
        let loaded = load_named(dir.path(), "default").await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn list_reports_exactly_one_default() {
        let dir = tempdir().unwrap();
        save_named(dir.path(), "show-a", &sample(), false).await.unwrap();
        save_named(dir.path(), "show-b", &sample(), true).await.unwrap();

        let mut summaries = list_named(dir.path()).await.unwrap();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(summaries.len(), 2);
        assert!(!summaries[0].is_default);
        assert!(summaries[1].is_default);
        assert_eq!(summaries[1].name, "show-b");
    }

    #[tokio::test]
    async fn resaving_default_repoints_it() {
        let dir = tempdir().unwrap();
        save_named(dir.path(), "show-a", &sample(), true).await.unwrap();
        let mut other = sample();
        other.artnet.universe = 9;
        save_named(dir.path(), "show-b", &other, true).await.unwrap();

        let loaded = load_named(dir.path(), "default").await.unwrap();
        assert_eq!(loaded.artnet.universe, 9);
    }

    #[tokio::test]
    async fn delete_removes_the_named_file() {
        let dir = tempdir().unwrap();
        save_named(dir.path(), "show-a", &sample(), false).await.unwrap();
        delete_named(dir.path(), "show-a").await.unwrap();
        assert!(matches!(
            load_named(dir.path(), "show-a").await.unwrap_err(),
            ConfigError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn deleting_the_default_target_leaves_a_dangling_pointer_not_a_crash() {
        let dir = tempdir().unwrap();
        save_named(dir.path(), "show-a", &sample(), true).await.unwrap();
        delete_named(dir.path(), "show-a").await.unwrap();

        let err = load_named(dir.path(), "default").await.unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[tokio::test]
    async fn listing_an_empty_directory_returns_no_entries() {
        let dir = tempdir().unwrap();
        std::fs::remove_dir(dir.path()).unwrap();
        let summaries = list_named(dir.path()).await.unwrap();
        assert!(summaries.is_empty());
    }
}
