use std::cell::RefCell;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::acquire::{AcquireOptions, DEFAULT_MAX_DIMENSION_PX, DEFAULT_QUALITY};
use crate::error::SettingsError;
use crate::matcher::{AvatarUrlMatcher, DEFAULT_HOSTS};
use crate::store::SettingsStore;

pub const SETTINGS_ENV: &str = "AVATAR_OVERRIDE_SETTINGS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Serialized overrides table.
    pub overrides_json: String,
    /// Max width/height of a stored replacement image.
    pub max_size_px: u32,
    /// JPEG quality, 0.1 - 1.
    pub jpeg_quality: f32,
    pub known_hosts: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            overrides_json: "{}".to_owned(),
            max_size_px: DEFAULT_MAX_DIMENSION_PX,
            jpeg_quality: DEFAULT_QUALITY,
            known_hosts: DEFAULT_HOSTS.iter().map(|host| host.to_string()).collect(),
        }
    }
}

impl Settings {
    /// Reads settings from `path`; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        ensure_parent_dir(path)?;
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn acquire_options(&self) -> AcquireOptions {
        AcquireOptions {
            max_dimension_px: self.max_size_px.max(1),
            quality: self.jpeg_quality,
        }
    }

    pub fn matcher(&self) -> Result<AvatarUrlMatcher, regex::Error> {
        AvatarUrlMatcher::with_hosts(self.known_hosts.as_slice())
    }
}

/// Resolves the settings file: explicit path, then env, then the local default.
pub fn settings_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| {
            env::var(SETTINGS_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(".avatar-override").join("settings.json"))
}

/// `SettingsStore` that rewrites the whole settings file on every save.
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    settings: RefCell<Settings>,
}

impl FileSettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = Settings::load(&path)?;
        Ok(Self {
            path,
            settings: RefCell::new(settings),
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    fn load_overrides_text(&self) -> String {
        self.settings.borrow().overrides_json.clone()
    }

    fn save_overrides_text(&self, text: &str) -> Result<(), SettingsError> {
        let mut settings = self.settings.borrow_mut();
        settings.overrides_json = text.to_string();
        settings.save(&self.path)
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{OverrideEntry, OverrideStore};
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.overrides_json, "{}");
        assert_eq!(settings.max_size_px, 256);
        assert_eq!(settings.known_hosts.len(), 2);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"maxSizePx": 128, "knownHosts": ["cdn.example"]}"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.max_size_px, 128);
        assert_eq!(settings.jpeg_quality, DEFAULT_QUALITY);
        assert!(settings
            .matcher()
            .unwrap()
            .parse("https://cdn.example/avatars/1/a.png")
            .is_some());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(SettingsError::Json(_))
        ));
    }

    #[test]
    fn explicit_settings_path_wins() {
        let explicit = Path::new("/tmp/explicit.json");
        assert_eq!(settings_path(Some(explicit)), explicit.to_path_buf());
    }

    #[test]
    fn file_store_round_trips_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = OverrideStore::new(FileSettingsStore::open(&path).unwrap());
        let mut next = (*store.get()).clone();
        next.insert(
            "42".into(),
            OverrideEntry::new(Some("abc".into()), "data:image/jpeg;base64,QUJD"),
        );
        store.set(next.clone()).unwrap();
        assert!(path.exists());

        let reopened = OverrideStore::new(FileSettingsStore::open(&path).unwrap());
        assert_eq!(*reopened.get(), next);
        assert_eq!(reopened.settings().settings().max_size_px, 256);
    }

    #[test]
    fn acquire_options_follow_settings() {
        let settings = Settings {
            max_size_px: 0,
            jpeg_quality: 0.5,
            ..Settings::default()
        };
        let options = settings.acquire_options();
        assert_eq!(options.max_dimension_px, 1);
        assert_eq!(options.quality, 0.5);
    }
}
