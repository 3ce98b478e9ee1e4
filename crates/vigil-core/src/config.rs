//! Per-root configuration.
//!
//! Configuration is a flat JSON object; typed accessors apply defaults at
//! the call site so every knob has exactly one place that knows its default.

use std::time::Duration;

use serde_json::{Map, Value};

#[derive(Clone, Debug, Default)]
pub struct Config {
    values: Map<String, Value>,
}

impl Config {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(values) => Some(Self { values }),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.values.get(key).and_then(Value::as_array)
    }

    /// How long the root must be quiet before subscriptions and triggers
    /// are dispatched.
    pub fn trigger_settle(&self) -> Duration {
        Duration::from_millis(self.get_int("trigger_settle", 20).max(1) as u64)
    }

    /// Interval between age-out passes. Zero disables garbage collection.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.get_int("gc_interval", 86_400).max(0) as u64)
    }

    /// How long a deleted node lingers before an age-out pass reclaims it.
    pub fn gc_age(&self) -> Duration {
        Duration::from_secs(self.get_int("gc_age", 259_200).max(0) as u64)
    }

    /// Cancel the watch when the root has been idle this long. Zero
    /// disables reaping.
    pub fn idle_reap_age(&self) -> Duration {
        Duration::from_secs(self.get_int("idle_reap_age", 0).max(0) as u64)
    }

    pub fn hint_num_files_per_dir(&self) -> usize {
        self.get_int("hint_num_files_per_dir", 64).max(0) as usize
    }

    pub fn watch_symlinks(&self) -> bool {
        self.get_bool("watch_symlinks", false)
    }

    pub fn subscription_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.get_int("subscription_lock_timeout_ms", 100).max(1) as u64)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde_json::json;

    use super::Config;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.trigger_settle(), Duration::from_millis(20));
        assert_eq!(config.gc_interval(), Duration::from_secs(86_400));
        assert_eq!(config.idle_reap_age(), Duration::from_secs(0));
        assert!(!config.watch_symlinks());
        assert_eq!(config.hint_num_files_per_dir(), 64);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_value(json!({
            "trigger_settle": 5,
            "gc_interval": 0,
            "watch_symlinks": true,
            "ignore_vcs": [".git"],
        }))
        .unwrap();
        assert_eq!(config.trigger_settle(), Duration::from_millis(5));
        assert_eq!(config.gc_interval(), Duration::from_secs(0));
        assert!(config.watch_symlinks());
        assert_eq!(config.get_array("ignore_vcs").unwrap().len(), 1);
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Config::from_value(json!([1, 2])).is_none());
    }
}
