use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use kerbside_session::{ParticipantId, ParticipantIdentity, SessionConfig};
use kerbside_transport::{ReconnectPolicy, SocketResult, TransportConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:4000";
pub const SETTINGS_DIRECTORY_NAME: &str = "kerbside";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "KERBSIDE_";

const DEFAULT_DEDUP_WINDOW_MS: u64 = 5_000;
const DEFAULT_SEND_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_reconnect_attempts")]
    pub attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            attempts: default_reconnect_attempts(),
            delay_ms: default_reconnect_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ReconnectSettings {
    fn normalized(mut self) -> Self {
        self.attempts = non_zero(self.attempts, DEFAULT_RECONNECT_ATTEMPTS);
        self.delay_ms = non_zero(self.delay_ms, DEFAULT_RECONNECT_DELAY_MS);
        self.max_delay_ms = non_zero(self.max_delay_ms, DEFAULT_RECONNECT_MAX_DELAY_MS);
        self.connect_timeout_ms = non_zero(self.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        // A cap below the first delay would make every attempt wait the cap.
        self.max_delay_ms = self.max_delay_ms.max(self.delay_ms);
        self
    }

    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts: self.attempts,
            initial_delay: Duration::from_millis(self.delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub participant_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_send_retry_delay_ms")]
    pub send_retry_delay_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            participant_id: String::new(),
            display_name: String::new(),
            dedup_window_ms: default_dedup_window_ms(),
            send_retry_delay_ms: default_send_retry_delay_ms(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.participant_id = self.participant_id.trim().to_string();
        self.display_name = self.display_name.trim().to_string();
        self.dedup_window_ms = non_zero(self.dedup_window_ms, DEFAULT_DEDUP_WINDOW_MS);
        self.send_retry_delay_ms = non_zero(self.send_retry_delay_ms, DEFAULT_SEND_RETRY_DELAY_MS);
        self.reconnect = self.reconnect.normalized();
        self
    }

    /// The local participant, if an id is configured.
    pub fn identity(&self) -> Option<ParticipantIdentity> {
        let id = ParticipantId::parse(&self.participant_id).ok()?;
        Some(ParticipantIdentity::new(id, self.display_name.clone()))
    }

    pub fn to_transport_config(&self) -> SocketResult<TransportConfig> {
        Ok(TransportConfig::new(&self.endpoint)?
            .with_reconnect(self.reconnect.to_policy())
            .with_connect_timeout(Duration::from_millis(self.reconnect.connect_timeout_ms)))
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            send_retry_delay: Duration::from_millis(self.send_retry_delay_ms),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".kerbside"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layered(&config_path);
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

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the settings file if present, then `KERBSIDE_*` variables
    /// (`KERBSIDE_RECONNECT__ATTEMPTS` reaches `reconnect.attempts`).
    fn load_layered(path: &Path) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
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

        tracing::info!(path = ?self.config_path, "saved settings");
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

fn non_zero<T: Default + PartialEq>(value: T, fallback: T) -> T {
    if value == T::default() { fallback } else { value }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_dedup_window_ms() -> u64 {
    DEFAULT_DEDUP_WINDOW_MS
}

fn default_send_retry_delay_ms() -> u64 {
    DEFAULT_SEND_RETRY_DELAY_MS
}

fn default_reconnect_attempts() -> u32 {
    DEFAULT_RECONNECT_ATTEMPTS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_reconnect_max_delay_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let store = SettingsStore::new(jail.directory().join("missing.json"));
            let settings = store.settings();

            assert_eq!(*settings, ChatSettings::default());
            assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
            assert_eq!(settings.to_session_config(), SessionConfig::default());
            assert!(settings.identity().is_none());
            Ok(())
        });
    }

    #[test]
    fn file_then_environment_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{
                    "endpoint": " https://chat.example.com ",
                    "participant_id": "65f0",
                    "display_name": "Asha",
                    "reconnect": { "attempts": 3 }
                }"#,
            )?;
            jail.set_env("KERBSIDE_DISPLAY_NAME", "Asha K");
            jail.set_env("KERBSIDE_RECONNECT__MAX_DELAY_MS", "8000");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();

            assert_eq!(settings.endpoint, "https://chat.example.com");
            assert_eq!(settings.display_name, "Asha K");
            assert_eq!(settings.reconnect.attempts, 3);
            assert_eq!(settings.reconnect.delay_ms, DEFAULT_RECONNECT_DELAY_MS);
            assert_eq!(settings.reconnect.max_delay_ms, 8_000);

            let identity = settings.identity().unwrap();
            assert_eq!(identity.id.as_str(), "65f0");
            assert!(identity.can_join());
            Ok(())
        });
    }

    #[test]
    fn zero_and_blank_values_fall_back_to_defaults() {
        let settings = ChatSettings {
            endpoint: "   ".to_string(),
            dedup_window_ms: 0,
            send_retry_delay_ms: 0,
            reconnect: ReconnectSettings {
                attempts: 0,
                delay_ms: 3_000,
                max_delay_ms: 1_000,
                connect_timeout_ms: 0,
            },
            ..ChatSettings::default()
        }
        .normalized();

        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.dedup_window_ms, DEFAULT_DEDUP_WINDOW_MS);
        assert_eq!(settings.send_retry_delay_ms, DEFAULT_SEND_RETRY_DELAY_MS);
        assert_eq!(settings.reconnect.attempts, DEFAULT_RECONNECT_ATTEMPTS);
        assert_eq!(settings.reconnect.max_delay_ms, 3_000);
        assert_eq!(settings.reconnect.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn update_persists_normalized_settings() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("nested").join("settings.json");
            let store = SettingsStore::new(path.clone());

            store
                .update(ChatSettings {
                    participant_id: " 65f0 ".to_string(),
                    ..ChatSettings::default()
                })
                .unwrap();

            assert_eq!(store.settings().participant_id, "65f0");
            assert!(!path.with_extension("json.tmp").exists());

            let reloaded = SettingsStore::new(path);
            assert_eq!(reloaded.settings().participant_id, "65f0");
            Ok(())
        });
    }

    #[test]
    fn converts_to_transport_config() {
        let settings = ChatSettings {
            endpoint: "https://chat.example.com".to_string(),
            ..ChatSettings::default()
        };

        let config = settings.to_transport_config().unwrap();
        assert_eq!(
            config.socket_url().as_str(),
            "wss://chat.example.com/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.connect_timeout, Duration::from_secs(20));

        let broken = ChatSettings {
            endpoint: "ftp://nowhere".to_string(),
            ..ChatSettings::default()
        };
        assert!(broken.to_transport_config().is_err());
    }
}
