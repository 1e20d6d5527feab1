// src/config.rs
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity;
use crate::sync::SyncConfig;
use crate::timing::Viewport;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MACHINE_ID_PATH: &str = "/etc/machine-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthModeSetting {
    Signed,
    ApiKey,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub api_base_url: Option<String>,
    pub store_path: PathBuf,
    pub display_output: String,
    pub machine_id: Option<String>,
    pub machine_id_path: PathBuf,
    pub display_slug: Option<String>,
    pub auth_mode: AuthModeSetting,
    pub device_id: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub http_timeout: Duration,
    pub stream_retry_min: Duration,
    pub stream_retry_max: Duration,
    pub viewport: Viewport,
}

impl RuntimeConfig {
    /// Reads `DISPLAY_*` variables; call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> RuntimeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> RuntimeResult<Self> {
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str, default: u64| {
            Duration::from_secs(non_empty(key).and_then(|s| s.parse().ok()).unwrap_or(default))
        };
        let millis = |key: &str, default: u64| {
            Duration::from_millis(non_empty(key).and_then(|s| s.parse().ok()).unwrap_or(default))
        };
        let pixels = |key: &str, default: u32| non_empty(key).and_then(|s| s.parse().ok()).unwrap_or(default);

        let auth_mode = match non_empty("DISPLAY_AUTH_MODE").as_deref() {
            None | Some("signed") => AuthModeSetting::Signed,
            Some("api-key") | Some("api_key") => AuthModeSetting::ApiKey,
            Some(other) => {
                return Err(RuntimeError::Config(format!(
                    "DISPLAY_AUTH_MODE must be signed or api-key, got {other}"
                )))
            }
        };

        let poll_interval = secs("DISPLAY_POLL_INTERVAL_SECS", 60);
        let heartbeat_interval = secs("DISPLAY_HEARTBEAT_INTERVAL_SECS", 30);
        if poll_interval.is_zero() || heartbeat_interval.is_zero() {
            return Err(RuntimeError::Config("poll and heartbeat intervals must be non-zero".into()));
        }

        Ok(Self {
            api_base_url: non_empty("DISPLAY_API_BASE_URL"),
            store_path: non_empty("DISPLAY_STORE_PATH")
                .unwrap_or_else(|| "display-runtime.db".into())
                .into(),
            display_output: non_empty("DISPLAY_OUTPUT").unwrap_or_else(|| "HDMI-0".into()),
            machine_id: non_empty("DISPLAY_MACHINE_ID"),
            machine_id_path: non_empty("DISPLAY_MACHINE_ID_PATH")
                .unwrap_or_else(|| DEFAULT_MACHINE_ID_PATH.into())
                .into(),
            display_slug: non_empty("DISPLAY_SLUG"),
            auth_mode,
            device_id: non_empty("DISPLAY_DEVICE_ID"),
            api_key: non_empty("DISPLAY_API_KEY"),
            poll_interval,
            heartbeat_interval,
            http_timeout: millis("DISPLAY_HTTP_TIMEOUT_MS", 10_000),
            stream_retry_min: millis("DISPLAY_STREAM_RETRY_MIN_MS", 1_000),
            stream_retry_max: millis("DISPLAY_STREAM_RETRY_MAX_MS", 30_000),
            viewport: Viewport::new(
                pixels("DISPLAY_VIEWPORT_WIDTH", 1920),
                pixels("DISPLAY_VIEWPORT_HEIGHT", 1080),
            ),
        })
    }

    pub fn api_base_url(&self) -> RuntimeResult<&str> {
        self.api_base_url
            .as_deref()
            .ok_or_else(|| RuntimeError::Config("DISPLAY_API_BASE_URL is not set".into()))
    }

    /// `DISPLAY_MACHINE_ID` if set, otherwise the machine id file.
    pub fn machine_id(&self) -> RuntimeResult<String> {
        match &self.machine_id {
            Some(id) => Ok(id.clone()),
            None => identity::read_machine_id(&self.machine_id_path),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            stream_retry_min: self.stream_retry_min,
            stream_retry_max: self.stream_retry_max,
        }
    }
}
