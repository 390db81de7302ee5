use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const DEFAULT_MICROPHONE_MAX: i64 = 1000;

/// Device state mirrored to and from the cloud shadow
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceState {
    pub is_on: bool,
    pub mode: i64,
    pub pattern: i64,
    pub colors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_image: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_audio: Option<i64>,
    pub microphone_max: i64,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            is_on: false,
            mode: 0,
            pattern: 0,
            colors: Vec::new(),
            upload_image: None,
            upload_audio: None,
            microphone_max: DEFAULT_MICROPHONE_MAX,
        }
    }
}

/// Asset refreshes requested by the keys present in a merged document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssetTriggers {
    pub image: bool,
    pub audio: bool,
}

impl AssetTriggers {
    pub fn any(&self) -> bool {
        self.image || self.audio
    }
}

impl DeviceState {
    /// Merge a delta (or reported) section into this state, field by field.
    ///
    /// Unknown keys are ignored. A known key whose value has the wrong type is
    /// logged and skipped, leaving the current value untouched.
    pub fn merge(&mut self, fields: &Map<String, Value>) -> AssetTriggers {
        let mut triggers = AssetTriggers::default();

        for (key, value) in fields {
            let applied = match key.as_str() {
                "is_on" => value.as_bool().map(|v| self.is_on = v).is_some(),
                "mode" => as_int(value).map(|v| self.mode = v).is_some(),
                "pattern" => as_int(value).map(|v| self.pattern = v).is_some(),
                "colors" => as_colors(value).map(|v| self.colors = v).is_some(),
                "upload_image" => {
                    triggers.image = true;
                    self.upload_image = as_int(value);
                    true
                }
                "upload_audio" => {
                    triggers.audio = true;
                    self.upload_audio = as_int(value);
                    true
                }
                "microphone_max" => as_int(value).map(|v| self.microphone_max = v).is_some(),
                _ => true,
            };

            if !applied {
                warn!("Ignoring shadow field {} with unexpected value {}", key, value);
            }
        }

        triggers
    }

    /// Build a state from a full reported section, defaults for missing keys
    pub fn from_reported(fields: &Map<String, Value>) -> (Self, AssetTriggers) {
        let mut state = DeviceState::default();
        let triggers = state.merge(fields);
        (state, triggers)
    }

    /// Mode that should actually render: Null whenever the device is off
    pub fn effective_mode(&self) -> i64 {
        if self.is_on {
            self.mode
        } else {
            0
        }
    }
}

fn as_int(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
}

fn as_colors(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;

    // Non-string entries keep their slot so indices stay stable; they render black
    Some(
        items
            .iter()
            .map(|c| c.as_str().unwrap_or_default().to_string())
            .collect(),
    )
}

/// The one `DeviceState` shared between the render loop and the shadow client
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<DeviceState>>,
}

impl SharedState {
    pub fn new(state: DeviceState) -> Self {
        SharedState {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicked writer leaves plain data behind, still safe to read
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current state; the lock is released before returning
    pub fn snapshot(&self) -> DeviceState {
        self.lock().clone()
    }

    pub fn replace(&self, state: DeviceState) {
        *self.lock() = state;
    }

    pub fn merge(&self, fields: &Map<String, Value>) -> AssetTriggers {
        self.lock().merge(fields)
    }

    /// Run `f` with exclusive access; keep it short, no I/O inside
    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let delta = object(json!({
            "is_on": true,
            "mode": 1,
            "colors": ["FF0000", "00FF00"],
            "upload_image": 1700000000
        }));

        let mut once = DeviceState::default();
        once.merge(&delta);

        let mut twice = DeviceState::default();
        twice.merge(&delta);
        twice.merge(&delta);

        assert_eq!(once, twice);
        assert!(once.is_on);
        assert_eq!(once.colors, vec!["FF0000", "00FF00"]);
        assert_eq!(once.upload_image, Some(1700000000));
    }

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let mut state = DeviceState {
            pattern: 4,
            ..DeviceState::default()
        };
        state.merge(&object(json!({ "mode": 2 })));

        assert_eq!(state.mode, 2);
        assert_eq!(state.pattern, 4);
    }

    #[test]
    fn test_merge_skips_mistyped_fields() {
        let mut state = DeviceState::default();
        state.merge(&object(json!({ "is_on": "yes", "mode": "three", "pattern": 2 })));

        assert!(!state.is_on);
        assert_eq!(state.mode, 0);
        assert_eq!(state.pattern, 2);
    }

    #[test]
    fn test_upload_keys_trigger_by_presence() {
        let mut state = DeviceState::default();
        let triggers = state.merge(&object(json!({ "upload_audio": null })));
        assert!(triggers.audio);
        assert!(!triggers.image);

        let triggers = state.merge(&object(json!({ "is_on": true })));
        assert!(!triggers.any());
    }

    #[test]
    fn test_effective_mode_off_is_null() {
        let state = DeviceState {
            mode: 3,
            ..DeviceState::default()
        };
        assert_eq!(state.effective_mode(), 0);
    }

    #[test]
    fn test_reported_roundtrip_omits_missing_uploads() {
        let state = DeviceState::default();
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("upload_image").is_none());
        assert_eq!(value["microphone_max"], json!(DEFAULT_MICROPHONE_MAX));
    }
}
