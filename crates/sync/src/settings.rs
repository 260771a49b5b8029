use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_storage::DEFAULT_MESSAGES_BATCH;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::autoscroll::DEFAULT_AUTOSCROLL_THRESHOLD;

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "sync.json";
pub const DATABASE_FILE_NAME: &str = "parley.sqlite3";
pub const ENV_PREFIX: &str = "PARLEY_";
pub const DEFAULT_FALLBACK_INTERVAL_MS: u64 = 1_000;
const MIN_FALLBACK_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fallback_interval_ms")]
    pub fallback_interval_ms: u64,
    #[serde(default = "default_autoscroll_threshold")]
    pub autoscroll_threshold: f64,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fallback_interval_ms: default_fallback_interval_ms(),
            autoscroll_threshold: default_autoscroll_threshold(),
            database_path: None,
        }
    }
}

impl SyncSettings {
    pub fn normalized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = default_batch_size();
        }
        // Sub-tick intervals would turn the fallback into a busy loop.
        self.fallback_interval_ms = self.fallback_interval_ms.max(MIN_FALLBACK_INTERVAL_MS);
        if !self.autoscroll_threshold.is_finite() || self.autoscroll_threshold < 0.0 {
            self.autoscroll_threshold = default_autoscroll_threshold();
        }
        self.database_path = self
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        self
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| SettingsStore::default_config_dir().join(DATABASE_FILE_NAME))
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<SyncSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Wraps already-resolved settings without touching disk on load.
    pub fn from_settings(settings: SyncSettings, config_path: PathBuf) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings.normalized())),
            config_path,
        }
    }

    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: SyncSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> SyncSettings {
        // Environment overrides apply even when no settings file exists yet.
        let figment = Figment::from(Serialized::defaults(SyncSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<SyncSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse sync settings, using defaults"
                );
                SyncSettings::default()
            }
        }
    }

    fn persist(&self, settings: &SyncSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved sync settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_batch_size() -> usize {
    DEFAULT_MESSAGES_BATCH
}

fn default_fallback_interval_ms() -> u64 {
    DEFAULT_FALLBACK_INTERVAL_MS
}

fn default_autoscroll_threshold() -> f64 {
    DEFAULT_AUTOSCROLL_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("absent.json"));
        let settings = store.settings();
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.fallback_interval(), Duration::from_secs(1));
        assert_eq!(settings.autoscroll_threshold, 100.0);
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(SyncSettings {
                batch_size: 25,
                fallback_interval_ms: 5,
                ..SyncSettings::default()
            })
            .unwrap();
        assert_eq!(store.settings().fallback_interval_ms, MIN_FALLBACK_INTERVAL_MS);
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().batch_size, 25);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "batch_size": 0, "autoscroll_threshold": 40.0 }"#).unwrap();

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.batch_size, DEFAULT_MESSAGES_BATCH);
        assert_eq!(settings.autoscroll_threshold, 40.0);
        assert_eq!(settings.fallback_interval_ms, DEFAULT_FALLBACK_INTERVAL_MS);
    }
}
