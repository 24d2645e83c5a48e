// Flat JSON settings file shared by the node binary and the settings protocol
use crate::errors::SettingsError;
use rf_protocol::Value;
use serde_json::Map;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Something to do locally once a settings session completes.
pub trait LocalEffect: Send {
    fn apply(&mut self, items: &[(String, Value)]) -> Result<(), SettingsError>;
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    defaults: Map<String, Value>,
}

impl SettingsStore {
    /// `defaults` names every accepted key with a value of its type.
    pub fn new(path: impl Into<PathBuf>, defaults: Map<String, Value>) -> Self {
        Self { path: path.into(), defaults }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Contents of the file. A missing file reads as empty.
    pub fn load(&self) -> Result<Map<String, Value>, SettingsError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => Ok(map),
            _ => Err(SettingsError::NotAnObject),
        }
    }

    /// Defaults overlaid with the file.
    pub fn current(&self) -> Result<Map<String, Value>, SettingsError> {
        let mut current = self.defaults.clone();
        current.extend(self.load()?);
        Ok(current)
    }

    /// Replaces the file with `settings`, pretty printed with sorted keys.
    pub fn save(&self, settings: &Map<String, Value>) -> Result<(), SettingsError> {
        let sorted: BTreeMap<&String, &Value> = settings.iter().collect();
        let mut text = serde_json::to_string_pretty(&sorted)?;
        text.push('\n');

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        info!(path = %self.path.display(), keys = settings.len(), "settings written");
        Ok(())
    }

    /// Merges `items` into the file.
    pub fn merge(&self, items: &[(String, Value)]) -> Result<(), SettingsError> {
        let mut settings = self.load()?;
        for (key, value) in items {
            settings.insert(key.clone(), value.clone());
        }
        self.save(&settings)
    }
}

impl LocalEffect for SettingsStore {
    fn apply(&mut self, items: &[(String, Value)]) -> Result<(), SettingsError> {
        self.merge(items)
    }
}

/// Whether `new` may replace `old` without changing the kind of setting.
pub fn same_kind(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Null, _) => true,
        (Value::Bool(_), Value::Bool(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Array(_), Value::Array(_))
        | (Value::Object(_), Value::Object(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_protocol::json;

    fn temp_store(name: &str) -> SettingsStore {
        let path = std::env::temp_dir().join(format!("rf_settings_{name}_{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        SettingsStore::new(path, Map::new())
    }

    #[test]
    fn missing_file_reads_empty() {
        let store = temp_store("missing");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn output_is_sorted_pretty_json() {
        let store = temp_store("sorted");
        let mut settings = Map::new();
        settings.insert("synchronize".into(), json!(true));
        settings.insert("home_location".into(), json!([1, 2]));
        settings.insert("closeness".into(), json!(0.0));
        store.save(&settings).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        let expected = "{\n  \"closeness\": 0.0,\n  \"home_location\": [\n    1,\n    2\n  ],\n  \"synchronize\": true\n}\n";
        assert_eq!(text, expected);
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn merge_keeps_other_keys() {
        let mut store = temp_store("merge");
        let mut settings = Map::new();
        settings.insert("slot_duration".into(), json!(0.1));
        settings.insert("number_of_sensors".into(), json!(2));
        store.save(&settings).unwrap();

        store.apply(&[("slot_duration".into(), json!(0.25))]).unwrap();
        let back = store.load().unwrap();
        assert_eq!(back["slot_duration"], json!(0.25));
        assert_eq!(back["number_of_sensors"], json!(2));
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn kinds() {
        assert!(same_kind(&json!(1), &json!(2.5)));
        assert!(same_kind(&Value::Null, &json!("x")));
        assert!(!same_kind(&json!("a"), &json!(1)));
        assert!(!same_kind(&json!([1]), &json!(true)));
    }
}
