use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SettingsError;

const PAYLOAD_PREFIX: &str = "data:image/";

/// One persisted override. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideEntry {
    /// Avatar hash observed when the override was created, if it was known.
    #[serde(rename = "avatarHash")]
    pub expected_hash: Option<String>,
    /// Self-contained `data:image/...` URL shown instead of the real avatar.
    #[serde(rename = "dataUrl")]
    pub payload: String,
}

impl OverrideEntry {
    pub fn new(expected_hash: Option<String>, payload: impl Into<String>) -> Self {
        Self {
            expected_hash,
            payload: payload.into(),
        }
    }

    /// The hash this entry must keep matching, or `None` when it never expires.
    pub fn pinned_hash(&self) -> Option<&str> {
        self.expected_hash.as_deref().filter(|hash| !hash.is_empty())
    }
}

pub type OverridesMap = BTreeMap<String, OverrideEntry>;

/// The host's persisted string field holding the serialized overrides.
pub trait SettingsStore {
    fn load_overrides_text(&self) -> String;
    fn save_overrides_text(&self, text: &str) -> Result<(), SettingsError>;
}

impl<S: SettingsStore + ?Sized> SettingsStore for Rc<S> {
    fn load_overrides_text(&self) -> String {
        (**self).load_overrides_text()
    }

    fn save_overrides_text(&self, text: &str) -> Result<(), SettingsError> {
        (**self).save_overrides_text(text)
    }
}

/// Settings store that only lives in memory.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    text: RefCell<String>,
}

impl MemorySettingsStore {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: RefCell::new(text.into()),
        }
    }

    pub fn text(&self) -> String {
        self.text.borrow().clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load_overrides_text(&self) -> String {
        self.text.borrow().clone()
    }

    fn save_overrides_text(&self, text: &str) -> Result<(), SettingsError> {
        *self.text.borrow_mut() = text.to_string();
        Ok(())
    }
}

/// Parses persisted overrides, skipping anything that is not a valid entry.
///
/// Never fails: text that is not a JSON object yields an empty map, and a
/// single corrupt entry only drops that entry.
pub fn parse_overrides(raw: &str) -> OverridesMap {
    let obj = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(obj)) => obj,
        Ok(_) => {
            debug!("persisted overrides are not a JSON object, starting empty");
            return OverridesMap::new();
        }
        Err(err) => {
            debug!(error = %err, "persisted overrides are not valid JSON, starting empty");
            return OverridesMap::new();
        }
    };

    let mut out = OverridesMap::new();
    for (subject_id, value) in obj {
        if subject_id.is_empty() {
            continue;
        }
        let entry = match value.as_object() {
            Some(entry) => entry,
            None => continue,
        };
        let payload = match entry.get("dataUrl") {
            Some(Value::String(payload)) if payload.starts_with(PAYLOAD_PREFIX) => payload,
            _ => {
                debug!(subject = %subject_id, "skipping override without an embeddable image");
                continue;
            }
        };
        let expected_hash = match entry.get("avatarHash") {
            Some(Value::String(hash)) => Some(hash.clone()),
            _ => None,
        };
        out.insert(subject_id, OverrideEntry::new(expected_hash, payload.clone()));
    }
    out
}

pub fn serialize_overrides(map: &OverridesMap) -> Result<String, SettingsError> {
    Ok(serde_json::to_string(map)?)
}

/// In-memory snapshot of the overrides, written through to the host settings.
///
/// Readers get an `Rc` to an immutable map; `set` swaps the whole snapshot.
pub struct OverrideStore<S> {
    settings: S,
    snapshot: RefCell<Rc<OverridesMap>>,
}

impl<S: SettingsStore> OverrideStore<S> {
    /// Builds the store and loads the current persisted text.
    pub fn new(settings: S) -> Self {
        let snapshot = parse_overrides(&settings.load_overrides_text());
        Self {
            settings,
            snapshot: RefCell::new(Rc::new(snapshot)),
        }
    }

    /// Parses `raw` and installs it as the snapshot without persisting.
    pub fn load(&self, raw: &str) -> Rc<OverridesMap> {
        let map = Rc::new(parse_overrides(raw));
        *self.snapshot.borrow_mut() = Rc::clone(&map);
        map
    }

    /// Re-reads the persisted text, picking up writes made behind our back.
    pub fn reload(&self) -> Rc<OverridesMap> {
        let raw = self.settings.load_overrides_text();
        self.load(&raw)
    }

    pub fn get(&self) -> Rc<OverridesMap> {
        Rc::clone(&self.snapshot.borrow())
    }

    /// Replaces the snapshot and persists it.
    ///
    /// The snapshot is replaced even when persisting fails.
    pub fn set(&self, next: OverridesMap) -> Result<(), SettingsError> {
        let text = serialize_overrides(&next)?;
        *self.snapshot.borrow_mut() = Rc::new(next);
        self.settings.save_overrides_text(&text).inspect_err(|err| {
            warn!(error = %err, "failed to persist avatar overrides");
        })
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }
}
