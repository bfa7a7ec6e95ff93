//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parvati_core::widget::{EmbedPolicy, DEFAULT_WIDGET_URL};
use parvati_core::{Device, SessionConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// `"stub"` (synthetic devices) or `"host"` (real microphone via cpal).
    pub media_backend: String,
    pub preferred_input_device: Option<String>,
    pub frame_interval_ms: u64,
    pub max_consecutive_failures: u32,
    pub widget_url: String,
    /// Devices the stub backend refuses, e.g. `["audio"]`.
    pub stub_denied_devices: Vec<String>,
    /// Simulated permission-prompt delay for the stub backend.
    pub stub_latency_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            media_backend: "stub".into(),
            preferred_input_device: None,
            frame_interval_ms: 16,
            max_consecutive_failures: 60,
            widget_url: DEFAULT_WIDGET_URL.into(),
            stub_denied_devices: Vec::new(),
            stub_latency_ms: 0,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.media_backend = normalize_media_backend(&self.media_backend);
        self.frame_interval_ms = self.frame_interval_ms.clamp(5, 1000);
        self.max_consecutive_failures = self.max_consecutive_failures.min(10_000);
        self.widget_url = normalize_widget_url(&self.widget_url);
        self.stub_denied_devices = normalize_device_list(&self.stub_denied_devices);
        self.stub_latency_ms = self.stub_latency_ms.min(10_000);
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    pub fn embed_policy(&self) -> EmbedPolicy {
        EmbedPolicy::with_src(self.widget_url.clone())
    }

    pub fn stub_denials(&self) -> Vec<Device> {
        self.stub_denied_devices
            .iter()
            .filter_map(|d| parse_device(d))
            .collect()
    }
}

pub fn normalize_media_backend(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "host" | "cpal" | "system" => "host".into(),
        _ => "stub".into(),
    }
}

pub fn normalize_widget_url(raw: &str) -> String {
    let url = raw.trim();
    if url.starts_with("https://") || url.starts_with("http://") {
        url.to_string()
    } else {
        DEFAULT_WIDGET_URL.into()
    }
}

pub fn parse_device(raw: &str) -> Option<Device> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "audio" | "mic" | "microphone" => Some(Device::Audio),
        "video" | "camera" | "cam" => Some(Device::Video),
        _ => None,
    }
}

/// Canonical device names, unknown entries dropped, duplicates removed.
pub fn normalize_device_list(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for device in raw.iter().filter_map(|d| parse_device(d)) {
        let name = device.as_str().to_string();
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("PARVATI")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("parvati")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_and_canonicalises() {
        let mut settings = AppSettings {
            media_backend: " CPAL ".into(),
            frame_interval_ms: 1,
            widget_url: "not a url".into(),
            stub_denied_devices: vec!["Camera".into(), "video".into(), "speaker".into()],
            preferred_input_device: Some("   ".into()),
            ..AppSettings::default()
        };
        settings.normalize();

        assert_eq!(settings.media_backend, "host");
        assert_eq!(settings.frame_interval_ms, 5);
        assert_eq!(settings.widget_url, DEFAULT_WIDGET_URL);
        assert_eq!(settings.stub_denied_devices, vec!["video".to_string()]);
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.stub_denials(), vec![Device::Video]);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"frameIntervalMs": 33}"#).expect("parse partial settings");
        assert_eq!(settings.frame_interval_ms, 33);
        assert_eq!(settings.media_backend, "stub");
        assert_eq!(settings.max_consecutive_failures, 60);
    }

    #[test]
    fn stale_threshold_key_is_ignored() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"confidenceThreshold": 0.9, "stubLatencyMs": 7}"#)
                .expect("parse settings with a retired key");
        assert_eq!(settings.stub_latency_ms, 7);
        let json = serde_json::to_string(&settings).expect("serialize");
        assert!(!json.contains("confidenceThreshold"));
    }

    #[test]
    fn session_config_follows_settings() {
        let settings = AppSettings {
            frame_interval_ms: 40,
            max_consecutive_failures: 0,
            ..AppSettings::default()
        };
        let config = settings.session_config();
        assert_eq!(config.frame_interval, Duration::from_millis(40));
        assert_eq!(config.max_consecutive_failures, 0);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = std::env::temp_dir().join(format!("parvati-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            stub_latency_ms: 25,
            stub_denied_devices: vec!["audio".into()],
            ..AppSettings::default()
        };

        save_settings(&path, &settings).expect("save settings");
        let loaded = load_settings(&path);
        assert_eq!(loaded.stub_latency_ms, 25);
        assert_eq!(loaded.stub_denials(), vec![Device::Audio]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("parvati-settings-does-not-exist.json");
        let settings = load_settings(&path);
        assert_eq!(settings.media_backend, "stub");
    }
}
