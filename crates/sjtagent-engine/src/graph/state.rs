use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Data threaded through every step of one run.
///
/// Fields hold JSON values in ordered maps, so two equal states serialize to
/// the same bytes. Only the engine mutates a state; steps read `&State` and
/// answer with a [`StateUpdate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    fields: BTreeMap<String, serde_json::Value>,
    /// Monotonic counters, e.g. revision-loop iterations.
    #[serde(default)]
    counters: BTreeMap<String, u64>,
    /// Number of updates merged so far.
    #[serde(default)]
    version: u64,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from initial data.
    pub fn from_map(data: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            fields: data,
            ..Self::default()
        }
    }

    /// Seed a field before the run starts.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    /// Deserialize a field into a typed value.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fields
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.fields
    }

    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    /// Merge an update: overwrite the keys it names, bump its counters.
    pub(crate) fn apply(&mut self, update: StateUpdate) {
        for (k, v) in update.fields {
            self.fields.insert(k, v);
        }
        for key in update.increments {
            *self.counters.entry(key).or_insert(0) += 1;
        }
        self.version += 1;
    }
}

/// The fields one step wants changed, plus its routing label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub(crate) fields: BTreeMap<String, serde_json::Value>,
    pub(crate) increments: Vec<String>,
    pub(crate) label: Option<String>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn set_str(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, serde_json::Value::String(value.into()))
    }

    /// Serialize `value` into `key`.
    pub fn set_json<T: Serialize>(
        self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.set(key, value))
    }

    /// Bump the counter `key` by one when merged.
    pub fn increment(mut self, key: impl Into<String>) -> Self {
        self.increments.push(key.into());
        self
    }

    /// The label this step emits for its outgoing conditional edge.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Every field and counter this update touches.
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .map(String::as_str)
            .chain(self.increments.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let state = State::new()
            .with("trait_name", json!("Conscientiousness"))
            .with("count", json!(42));

        assert_eq!(state.get_str("trait_name"), Some("Conscientiousness"));
        assert_eq!(state.get("count"), Some(&json!(42)));
        assert_eq!(state.get("missing"), None);
        assert_eq!(state.version(), 0);
    }

    #[test]
    fn test_apply_overwrites_only_named_keys() {
        let mut state = State::new().with("a", json!("1")).with("b", json!("2"));

        state.apply(StateUpdate::new().set_str("b", "overwritten").set_str("c", "3"));

        assert_eq!(state.get_str("a"), Some("1"));
        assert_eq!(state.get_str("b"), Some("overwritten"));
        assert_eq!(state.get_str("c"), Some("3"));
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn test_counters_are_monotonic() {
        let mut state = State::new();
        state.apply(StateUpdate::new().increment("iter"));
        state.apply(StateUpdate::new());
        state.apply(StateUpdate::new().increment("iter"));

        assert_eq!(state.counter("iter"), 2);
        assert_eq!(state.counter("other"), 0);
        assert_eq!(state.version(), 3);
    }

    #[test]
    fn test_get_as_typed() {
        #[derive(Deserialize, Serialize, PartialEq, Debug)]
        struct Outline {
            cues: Vec<String>,
        }

        let update = StateUpdate::new()
            .set_json("outline", &Outline { cues: vec!["deadline".into()] })
            .unwrap();
        let mut state = State::new();
        state.apply(update);

        let outline: Outline = state.get_as("outline").unwrap();
        assert_eq!(outline.cues, vec!["deadline"]);
        assert!(state.get_as::<Outline>("missing").is_none());
    }

    #[test]
    fn test_touched_lists_fields_and_counters() {
        let update = StateUpdate::new().set_str("options", "x").increment("iter");
        let touched: Vec<_> = update.touched().collect();
        assert_eq!(touched, vec!["options", "iter"]);
    }

    #[test]
    fn test_serialization_is_stable() {
        let a = State::new().with("z", json!(1)).with("a", json!(2));
        let b = State::new().with("a", json!(2)).with("z", json!(1));
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
