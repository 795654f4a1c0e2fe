//! Persisted webcam preferences
//!
//! A flat key-value store of booleans, saved as a JSON object. Key names
//! match the ones the browser client keeps in local storage so a settings
//! export can be shared between them.

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A boolean webcam setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Preference {
    /// Mark our camera explicit
    #[serde(rename = "videoExplicit")]
    Explicit,
    #[serde(rename = "videoMutual")]
    Mutual,
    #[serde(rename = "videoMutualOpen")]
    MutualOpen,
    #[serde(rename = "videoNonExplicit")]
    NonExplicit,
    #[serde(rename = "videoVipOnly")]
    VipOnly,
    #[serde(rename = "rememberExpresslyClosed")]
    RememberExpresslyClosed,
    /// Start every opened camera with its audio muted
    #[serde(rename = "videoAutoMute")]
    AutoMute,
}

impl Preference {
    pub const ALL: [Preference; 7] = [
        Preference::Explicit,
        Preference::Mutual,
        Preference::MutualOpen,
        Preference::NonExplicit,
        Preference::VipOnly,
        Preference::RememberExpresslyClosed,
        Preference::AutoMute,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Preference::Explicit => "videoExplicit",
            Preference::Mutual => "videoMutual",
            Preference::MutualOpen => "videoMutualOpen",
            Preference::NonExplicit => "videoNonExplicit",
            Preference::VipOnly => "videoVipOnly",
            Preference::RememberExpresslyClosed => "rememberExpresslyClosed",
            Preference::AutoMute => "videoAutoMute",
        }
    }

    /// Accepts the storage key or a short alias (`explicit`, `mutual-open`, ...)
    pub fn parse(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase().replace(['-', '_'], "");
        Preference::ALL.into_iter().find(|p| {
            let key = p.key().to_ascii_lowercase();
            key == lowered || key.strip_prefix("video") == Some(lowered.as_str())
        })
    }
}

/// Storage backend for preferences
pub trait PreferenceStore: Send + Sync {
    fn get(&self, pref: Preference) -> Option<bool>;

    fn set(&self, pref: Preference, value: bool) -> Result<(), Box<dyn std::error::Error>>;

    /// Every preference that has a stored value
    fn stored(&self) -> Vec<(Preference, bool)> {
        Preference::ALL
            .into_iter()
            .filter_map(|p| self.get(p).map(|v| (p, v)))
            .collect()
    }
}

/// In-memory store, lost on exit
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<Preference, bool>>,
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, pref: Preference) -> Option<bool> {
        self.values.lock().get(&pref).copied()
    }

    fn set(&self, pref: Preference, value: bool) -> Result<(), Box<dyn std::error::Error>> {
        self.values.lock().insert(pref, value);
        Ok(())
    }
}

/// JSON file store; every write rewrites the file
#[derive(Debug)]
pub struct JsonPreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, bool>>,
}

impl JsonPreferences {
    /// Open the store, starting empty when the file is missing or unreadable.
    pub fn open(path: PathBuf) -> Self {
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!("Ignoring malformed preferences file {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(_) => {
                debug!("No preferences file at {:?}", path);
                BTreeMap::new()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }
}

impl PreferenceStore for JsonPreferences {
    fn get(&self, pref: Preference) -> Option<bool> {
        self.values.lock().get(pref.key()).copied()
    }

    fn set(&self, pref: Preference, value: bool) -> Result<(), Box<dyn std::error::Error>> {
        let json = {
            let mut values = self.values.lock();
            values.insert(pref.key().to_string(), value);
            serde_json::to_string_pretty(&*values)?
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_keys_and_aliases() {
        assert_eq!(Preference::parse("videoMutualOpen"), Some(Preference::MutualOpen));
        assert_eq!(Preference::parse("mutual-open"), Some(Preference::MutualOpen));
        assert_eq!(Preference::parse("explicit"), Some(Preference::Explicit));
        assert_eq!(Preference::parse("non_explicit"), Some(Preference::NonExplicit));
        assert_eq!(Preference::parse("rememberExpresslyClosed"), Some(Preference::RememberExpresslyClosed));
        assert_eq!(Preference::parse("fontSize"), None);
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryPreferences::default();
        assert_eq!(store.get(Preference::VipOnly), None);
        store.set(Preference::VipOnly, true).unwrap();
        assert_eq!(store.stored(), vec![(Preference::VipOnly, true)]);
    }

    #[test]
    fn json_store_persists_with_browser_keys() {
        let path = std::env::temp_dir().join(format!("peercam-prefs-{}.json", uuid::Uuid::new_v4()));
        let store = JsonPreferences::open(path.clone());
        store.set(Preference::Mutual, true).unwrap();
        store.set(Preference::AutoMute, false).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"videoMutual\": true"));

        let reopened = JsonPreferences::open(path.clone());
        assert_eq!(reopened.get(Preference::Mutual), Some(true));
        assert_eq!(reopened.get(Preference::AutoMute), Some(false));
        assert_eq!(reopened.get(Preference::Explicit), None);
        let _ = std::fs::remove_file(path);
    }
}
