use crate::bindings::{is_supported_trigger, EventBinding, TriggerFilter};
use crate::connection::ConnectionSettings;
use crate::model::{secs_to_duration, StateEvent};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const APP_DIR: &str = "veadotube-bridge";
const ENV_PREFIX: &str = "VEADO_BRIDGE_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub veadotube: VeadotubeConfig,
    pub bindings: Vec<EventBinding>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VeadotubeConfig {
    pub socket_server: String,
    pub default_duration_secs: f64,
    pub reconnect: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay_secs: f64,
}

impl Default for VeadotubeConfig {
    fn default() -> Self {
        Self {
            socket_server: "ws://127.0.0.1:63640?n=veadotube-bridge".to_string(),
            default_duration_secs: 30.0,
            reconnect: true,
            reconnect_attempts: 0,
            reconnect_delay_secs: 30.0,
        }
    }
}

impl VeadotubeConfig {
    pub fn connection_settings(&self) -> Result<ConnectionSettings, Box<dyn std::error::Error>> {
        Ok(ConnectionSettings {
            uri: self.socket_server.clone(),
            default_duration: duration_field("default_duration_secs", self.default_duration_secs)?,
            reconnect: self.reconnect,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: duration_field("reconnect_delay_secs", self.reconnect_delay_secs)?,
        })
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        match fs::read_to_string(&config_path) {
            Ok(raw) => {
                config = toml::from_str::<Config>(&raw)?;
                tracing::info!(path = %config_path.display(), "loaded config");
            }
            Err(_) => {
                tracing::info!(path = %config_path.display(), "no config file, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}SOCKET_SERVER", ENV_PREFIX)) {
            self.veadotube.socket_server = val;
        }
        if let Ok(val) = env::var(format!("{}DEFAULT_DURATION", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.veadotube.default_duration_secs = secs;
            }
        }
        if let Ok(val) = env::var(format!("{}RECONNECT", ENV_PREFIX)) {
            self.veadotube.reconnect = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}RECONNECT_ATTEMPTS", ENV_PREFIX)) {
            if let Ok(attempts) = val.parse() {
                self.veadotube.reconnect_attempts = attempts;
            }
        }
        if let Ok(val) = env::var(format!("{}RECONNECT_DELAY", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.veadotube.reconnect_delay_secs = secs;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let uri = self.veadotube.socket_server.trim();
        if !(uri.starts_with("ws://") || uri.starts_with("wss://")) {
            return Err("veadotube.socket_server must be a ws:// or wss:// URI".into());
        }
        if !is_valid_secs(self.veadotube.default_duration_secs) {
            return Err("veadotube.default_duration_secs must be a non-negative number of seconds".into());
        }
        if !is_valid_secs(self.veadotube.reconnect_delay_secs) {
            return Err("veadotube.reconnect_delay_secs must be a non-negative number of seconds".into());
        }
        for (idx, binding) in self.bindings.iter().enumerate() {
            if !is_supported_trigger(&binding.trigger.event) {
                return Err(format!(
                    "bindings[{idx}].trigger.event '{}' is not a supported trigger",
                    binding.trigger.event
                )
                .into());
            }
            if binding.state.state.trim().is_empty() {
                return Err(format!("bindings[{idx}].state.state must be set").into());
            }
            if !binding.state.has_valid_duration() {
                return Err(format!(
                    "bindings[{idx}].state.duration must be a non-negative number of seconds"
                )
                .into());
            }
        }
        Ok(())
    }

    /// Default settings plus a few example bindings.
    pub fn example() -> Self {
        let bind = |event: &str, name: Option<&str>, state: StateEvent| EventBinding {
            trigger: TriggerFilter {
                event: event.to_string(),
                source: None,
                name: name.map(str::to_string),
            },
            state,
        };
        Self {
            veadotube: VeadotubeConfig::default(),
            bindings: vec![
                bind("follow", None, StateEvent::revert("confused").with_duration(15.0)),
                bind("sub", None, StateEvent::set("laugh").with_duration(10.0)),
                bind("raid_in", None, StateEvent::set("sad").with_duration(10.0)),
                bind("channel_point_redeem", Some("Be shy"), StateEvent::revert("shy")),
            ],
        }
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::example())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn is_valid_secs(secs: f64) -> bool {
    secs_to_duration(secs).is_some()
}

fn duration_field(field: &str, secs: f64) -> Result<Duration, String> {
    secs_to_duration(secs)
        .ok_or_else(|| format!("veadotube.{field} must be a non-negative number of seconds, got {secs}"))
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("APPDATA")
        .or_else(|_| env::var("XDG_CONFIG_HOME"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&base).join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
