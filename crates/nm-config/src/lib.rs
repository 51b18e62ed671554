//! Runtime configuration: `runtime_config.json`, user overrides from
//! `runtime_user.json`, and the pack directory's `packs_index.json`.
//!
//! The schema is deserialization-tolerant: unknown fields are ignored and
//! missing fields take defaults, so configs survive forward evolution. User
//! overrides merge onto the base configuration in the runtime domain only —
//! window, audio, text, `localization.currentLocale`, and input bindings;
//! everything else (game identity, pack layout, save policy, logging) is
//! developer-controlled and ignored if present in the user file.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GameInfo {
    pub name: String,
    pub version: String,
    pub build_number: u32,
    pub start_scene: String,
}

impl Default for GameInfo {
    fn default() -> Self {
        Self {
            name: "NovelMind Game".into(),
            version: "1.0.0".into(),
            build_number: 1,
            start_scene: "main".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct WindowSettings {
    pub width: i32,
    pub height: i32,
    pub fullscreen: bool,
    pub vsync: bool,
    pub resizable: bool,
    pub borderless: bool,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fullscreen: false,
            vsync: true,
            resizable: false,
            borderless: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioSettings {
    pub master: f32,
    pub music: f32,
    pub voice: f32,
    pub sfx: f32,
    pub ambient: f32,
    pub ui: f32,
    pub muted: bool,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            master: 1.0,
            music: 0.8,
            voice: 1.0,
            sfx: 0.8,
            ambient: 0.7,
            ui: 0.6,
            muted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TextSettings {
    /// Characters per second.
    pub speed: i32,
    pub auto_advance_ms: i32,
    pub typewriter: bool,
    pub auto_advance: bool,
    pub skip_unread: bool,
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            speed: 40,
            auto_advance_ms: 1500,
            typewriter: true,
            auto_advance: false,
            skip_unread: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalizationSettings {
    pub default_locale: String,
    pub available_locales: Vec<String>,
    pub current_locale: String,
}

impl Default for LocalizationSettings {
    fn default() -> Self {
        Self {
            default_locale: "en".into(),
            available_locales: vec!["en".into()],
            current_locale: "en".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PackSettings {
    pub directory: String,
    pub index_file: String,
    pub encrypted: bool,
}

impl Default for PackSettings {
    fn default() -> Self {
        Self {
            directory: "packs".into(),
            index_file: "packs_index.json".into(),
            encrypted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveSettings {
    pub directory: String,
    pub enable_compression: bool,
    pub enable_encryption: bool,
    pub max_slots: i32,
    pub auto_save_enabled: bool,
    pub auto_save_interval_ms: i32,
}

impl Default for SaveSettings {
    fn default() -> Self {
        Self {
            directory: "saves".into(),
            enable_compression: true,
            enable_encryption: false,
            max_slots: 100,
            auto_save_enabled: true,
            auto_save_interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub enable_logging: bool,
    /// trace, debug, info, warn, error.
    pub log_level: String,
    pub log_directory: String,
    pub log_to_file: bool,
    pub log_to_console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enable_logging: true,
            log_level: "info".into(),
            log_directory: "logs".into(),
            log_to_file: true,
            log_to_console: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugSettings {
    pub enable_debug_console: bool,
    pub show_fps: bool,
    pub show_debug_overlay: bool,
    pub enable_hot_reload: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct InputBinding {
    pub keys: Vec<String>,
    pub mouse_buttons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct InputSettings {
    pub bindings: BTreeMap<String, InputBinding>,
}

impl Default for InputSettings {
    fn default() -> Self {
        let binding = |keys: &[&str], buttons: &[&str]| InputBinding {
            keys: keys.iter().map(|s| s.to_string()).collect(),
            mouse_buttons: buttons.iter().map(|s| s.to_string()).collect(),
        };
        let mut bindings = BTreeMap::new();
        bindings.insert("next".into(), binding(&["Space", "Enter"], &["Left"]));
        bindings.insert("backlog".into(), binding(&["PageUp"], &[]));
        bindings.insert("skip".into(), binding(&["LCtrl", "RCtrl"], &[]));
        bindings.insert("auto".into(), binding(&["A"], &[]));
        bindings.insert("quick_save".into(), binding(&["S"], &[]));
        bindings.insert("quick_load".into(), binding(&["L"], &[]));
        bindings.insert("menu".into(), binding(&["Escape"], &[]));
        bindings.insert("fullscreen".into(), binding(&["F11"], &[]));
        bindings.insert("screenshot".into(), binding(&["F12"], &[]));
        bindings.insert("hide_ui".into(), binding(&["H"], &[]));
        Self { bindings }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub game: GameInfo,
    pub window: WindowSettings,
    pub audio: AudioSettings,
    pub text: TextSettings,
    pub localization: LocalizationSettings,
    pub packs: PackSettings,
    pub saves: SaveSettings,
    pub logging: LoggingSettings,
    pub debug: DebugSettings,
    pub input: InputSettings,
}

/// Paths (relative to the config root) the user file may override.
const USER_MERGE_SECTIONS: [&str; 3] = ["window", "audio", "text"];

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let value = read_json(path.as_ref())?;
        from_value(value, path.as_ref())
    }

    /// Load the base config and, when present, merge the user file on top.
    /// A missing user file is normal; a malformed one is ignored with a
    /// warning rather than blocking launch.
    pub fn load_with_user(
        base_path: impl AsRef<Path>,
        user_path: impl AsRef<Path>,
    ) -> Result<Self, ConfigError> {
        let mut base = read_json(base_path.as_ref())?;
        match read_json(user_path.as_ref()) {
            Ok(user) => merge_user_overrides(&mut base, &user),
            Err(ConfigError::Io { .. }) => {}
            Err(err) => {
                tracing::warn!(target: "config", %err, "ignoring malformed user config");
            }
        }
        from_value(base, base_path.as_ref())
    }
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn from_value(value: Value, path: &Path) -> Result<RuntimeConfig, ConfigError> {
    serde_json::from_value(value).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Apply the user file onto the base JSON, restricted to the runtime
/// domain. Objects merge field-by-field so a user file carrying only
/// `{"window": {"fullscreen": true}}` leaves the rest of the window
/// section intact.
pub fn merge_user_overrides(base: &mut Value, user: &Value) {
    for section in USER_MERGE_SECTIONS {
        if let Some(overrides) = user.get(section) {
            deep_merge(&mut base[section], overrides);
        }
    }
    if let Some(locale) = user
        .pointer("/localization/currentLocale")
        .and_then(Value::as_str)
    {
        base["localization"]["currentLocale"] = Value::String(locale.to_string());
    }
    if let Some(bindings) = user.pointer("/input/bindings") {
        deep_merge(&mut base["input"]["bindings"], bindings);
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

// --- packs index -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackIndexEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub pack_type: String,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacksIndex {
    #[serde(default)]
    pub packs: Vec<PackIndexEntry>,
}

impl PacksIndex {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let value = read_json(path.as_ref())?;
        serde_json::from_value(value).map_err(|source| ConfigError::Parse {
            path: path.as_ref().display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_expectations() {
        let config = RuntimeConfig::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.audio.music, 0.8);
        assert_eq!(config.text.speed, 40);
        assert_eq!(config.localization.current_locale, "en");
        assert_eq!(config.packs.index_file, "packs_index.json");
        assert!(config.input.bindings.contains_key("next"));
    }

    #[test]
    fn loads_partial_config_with_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        std::fs::write(
            &path,
            r#"{
                "game": { "name": "Demo", "futureField": 1 },
                "window": { "width": 1920 },
                "unknownSection": {}
            }"#,
        )
        .unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.game.name, "Demo");
        assert_eq!(config.window.width, 1920);
        assert_eq!(config.window.height, 720); // default
    }

    #[test]
    fn user_overrides_apply_to_runtime_domain_only() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("runtime_config.json");
        let user = dir.path().join("runtime_user.json");
        std::fs::write(
            &base,
            r#"{
                "game": { "name": "Shipped Name" },
                "window": { "width": 1280, "fullscreen": false },
                "audio": { "music": 0.8 },
                "localization": { "currentLocale": "en", "availableLocales": ["en", "de"] }
            }"#,
        )
        .unwrap();
        std::fs::write(
            &user,
            r#"{
                "game": { "name": "Hacked Name" },
                "window": { "fullscreen": true },
                "audio": { "music": 0.25 },
                "localization": { "currentLocale": "de", "defaultLocale": "de" },
                "packs": { "directory": "../elsewhere" },
                "input": { "bindings": { "next": { "keys": ["Return"] } } }
            }"#,
        )
        .unwrap();

        let config = RuntimeConfig::load_with_user(&base, &user).unwrap();
        // Runtime domain merged.
        assert!(config.window.fullscreen);
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.audio.music, 0.25);
        assert_eq!(config.localization.current_locale, "de");
        assert_eq!(config.input.bindings["next"].keys, vec!["Return"]);
        // Everything else untouched.
        assert_eq!(config.game.name, "Shipped Name");
        assert_eq!(config.localization.default_locale, "en");
        assert_eq!(config.packs.directory, "packs");
    }

    #[test]
    fn missing_user_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("runtime_config.json");
        std::fs::write(&base, "{}").unwrap();
        let config =
            RuntimeConfig::load_with_user(&base, dir.path().join("runtime_user.json")).unwrap();
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn packs_index_parses_all_pack_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("packs_index.json");
        std::fs::write(
            &path,
            r#"{ "packs": [
                { "path": "base.nmpack", "type": "base", "priority": 0 },
                { "path": "patch-1.nmpack", "type": "patch", "priority": 1 },
                { "path": "german.nmpack", "type": "language", "priority": 5 },
                { "path": "fanart.nmpack", "type": "mod", "priority": 10 }
            ] }"#,
        )
        .unwrap();
        let index = PacksIndex::load(&path).unwrap();
        assert_eq!(index.packs.len(), 4);
        assert_eq!(index.packs[3].pack_type, "mod");
        assert_eq!(index.packs[3].priority, 10);
    }
}
