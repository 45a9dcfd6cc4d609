use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use palaver_llm::ProviderConfig;
use palaver_session::ControllerConfig;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434/v1";
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 300;
pub const SETTINGS_DIRECTORY_NAME: &str = "palaver";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "sessions.db";
pub const ENV_PREFIX: &str = "PALAVER_";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: Option<String>,
    pub max_tokens: Option<u64>,
    pub settle_delay_ms: u64,
    pub database_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            default_model: None,
            max_tokens: None,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            database_path: None,
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            DEFAULT_PROVIDER_ID.to_string()
        } else {
            self.provider_id.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = if self.endpoint.trim().is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else {
            self.endpoint.trim().to_string()
        };
        self.default_model = self
            .default_model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        self
    }

    /// Fills an empty key from the conventional OpenAI variable.
    pub fn with_api_key_fallback(mut self, fallback: Option<String>) -> Self {
        if self.api_key.is_empty()
            && let Some(key) = fallback.map(|key| key.trim().to_string())
        {
            self.api_key = key;
        }
        self
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            max_tokens: self.max_tokens,
            default_model: self.default_model.clone(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".palaver"))
                .join(DATABASE_FILE_NAME)
        })
    }
}

/// File-backed settings. Environment overrides apply on read and are never persisted.
pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".palaver"))
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

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Settings as stored on disk.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Stored settings overlaid with `PALAVER_*` variables and the OpenAI key fallback.
    pub fn effective(&self) -> Settings {
        let stored = self.settings();
        let figment =
            Figment::from(Serialized::defaults(stored.as_ref())).merge(Env::prefixed(ENV_PREFIX));

        let settings = match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!("ignoring malformed {ENV_PREFIX}* environment overrides: {error}");
                stored.as_ref().clone()
            }
        };
        settings.with_api_key_fallback(std::env::var(OPENAI_API_KEY_ENV).ok())
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
            return Settings::default();
        }

        let figment = Figment::from(Serialized::defaults(Settings::default())).merge(Json::file(path));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
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

        tracing::info!("saved settings to {:?}", self.config_path);
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

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SettingsStore::new(dir.path().join(SETTINGS_FILE_NAME));
        assert_eq!(*store.settings(), Settings::default());
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(Settings {
                default_model: Some("  llama3  ".to_string()),
                max_tokens: Some(512),
                ..Settings::default()
            })
            .expect("persist settings");

        let reloaded = SettingsStore::new(path.clone());
        assert_eq!(reloaded.settings().default_model.as_deref(), Some("llama3"));
        assert_eq!(reloaded.settings().max_tokens, Some(512));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "endpoint": "https://api.openai.com/v1" }"#)
            .expect("write settings");

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.endpoint, "https://api.openai.com/v1");
        assert_eq!(settings.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(settings.settle_delay_ms, DEFAULT_SETTLE_DELAY_MS);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").expect("write settings");

        assert_eq!(*SettingsStore::new(path).settings(), Settings::default());
    }

    #[test]
    fn api_key_fallback_only_fills_blank_keys() {
        let filled = Settings::default().with_api_key_fallback(Some(" sk-env ".to_string()));
        assert_eq!(filled.api_key, "sk-env");

        let kept = Settings {
            api_key: "sk-file".to_string(),
            ..Settings::default()
        }
        .with_api_key_fallback(Some("sk-env".to_string()));
        assert_eq!(kept.api_key, "sk-file");
    }

    #[test]
    fn controller_config_carries_delay_and_model() {
        let config = Settings {
            settle_delay_ms: 50,
            default_model: Some("m1".to_string()),
            ..Settings::default()
        }
        .controller_config();
        assert_eq!(config.settle_delay, Duration::from_millis(50));
        assert_eq!(config.default_model.as_deref(), Some("m1"));
    }
}
