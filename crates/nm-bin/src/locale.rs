//! Minimal localization: flat string tables served from the VFS.
//!
//! Each locale lives at `locales/<locale>.json` as a flat `key -> text`
//! object. Lookup falls back from the current locale to the default locale,
//! then to the key itself, so missing translations render visibly instead of
//! crashing.

use std::collections::HashMap;

use nm_vfs::MultiPackVfs;

pub struct LocalizationManager {
    tables: HashMap<String, HashMap<String, String>>,
    current: String,
    default: String,
}

impl LocalizationManager {
    /// Load every available locale table that exists in the VFS. Missing
    /// tables are tolerated (a game may ship partial localization).
    pub fn load(
        vfs: &MultiPackVfs,
        available: &[String],
        current: &str,
        default: &str,
    ) -> Self {
        let mut tables = HashMap::new();
        for locale in available {
            let path = format!("locales/{locale}.json");
            match vfs.read_all(&path) {
                Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                    Ok(table) => {
                        tracing::info!(target: "locale", locale = %locale, entries = table.len(),
                            "locale table loaded");
                        tables.insert(locale.clone(), table);
                    }
                    Err(err) => {
                        tracing::warn!(target: "locale", locale = %locale, %err,
                            "locale table is not a flat string map");
                    }
                },
                Err(err) => {
                    tracing::warn!(target: "locale", locale = %locale, %err, "locale table missing");
                }
            }
        }
        Self {
            tables,
            current: current.to_string(),
            default: default.to_string(),
        }
    }

    pub fn set_locale(&mut self, locale: &str) {
        self.current = locale.to_string();
    }

    pub fn current_locale(&self) -> &str {
        &self.current
    }

    /// Translate a key, falling back current -> default -> key.
    pub fn tr<'a>(&'a self, key: &'a str) -> &'a str {
        self.tables
            .get(&self.current)
            .and_then(|t| t.get(key))
            .or_else(|| self.tables.get(&self.default).and_then(|t| t.get(key)))
            .map(String::as_str)
            .unwrap_or(key)
    }
}
