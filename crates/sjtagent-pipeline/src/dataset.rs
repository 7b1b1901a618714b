use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use sjtagent_core::error::{Result, SjtError};
use sjtagent_core::traits::DataSource;

use crate::evaluation::SjtItem;

/// Item banks on disk, one JSON file per method shaped `{trait: {index: item}}`.
#[derive(Debug, Clone, Default)]
pub struct FileDataSource {
    files: BTreeMap<String, PathBuf>,
}

impl FileDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the file holding `method`'s items. Method names become item
    /// id prefixes, so they may not contain `_`.
    pub fn with_method(mut self, method: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let method = method.into();
        if method.is_empty() || method.contains('_') {
            return Err(SjtError::Data(format!(
                "invalid method name '{}': must be non-empty and contain no '_'",
                method
            )));
        }
        self.files.insert(method, path.into());
        Ok(self)
    }

    /// Parse `method=path` pairs as given on the command line.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        specs.iter().try_fold(Self::new(), |source, spec| {
            let spec = spec.as_ref();
            let (method, path) = spec
                .split_once('=')
                .ok_or_else(|| SjtError::Data(format!("expected method=path, got '{}'", spec)))?;
            source.with_method(method.trim(), Path::new(path.trim()))
        })
    }

    pub fn methods(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    /// Items of every requested trait, keyed `<method>_<index>`.
    ///
    /// A trait absent from a method's file contributes no items for that
    /// method.
    pub fn load_items<S: AsRef<str>>(
        &self,
        traits: &[S],
        methods: &[S],
    ) -> Result<BTreeMap<String, BTreeMap<String, SjtItem>>> {
        let mut datasets: BTreeMap<String, BTreeMap<String, SjtItem>> = traits
            .iter()
            .map(|t| (t.as_ref().to_string(), BTreeMap::new()))
            .collect();

        for method in methods {
            let method = method.as_ref();
            let bank = self.load(method)?;
            for trait_name in traits {
                let trait_name = trait_name.as_ref();
                let Some(entries) = bank.get(trait_name) else {
                    warn!(method, trait_name, "Trait missing from item bank");
                    continue;
                };
                let entries = entries.as_object().ok_or_else(|| {
                    SjtError::Data(format!("{}: '{}' is not an object", method, trait_name))
                })?;
                let items = datasets.entry(trait_name.to_string()).or_default();
                for (index, raw) in entries {
                    let item: SjtItem = serde_json::from_value(raw.clone()).map_err(|e| {
                        SjtError::Data(format!("{}: {}[{}]: {}", method, trait_name, index, e))
                    })?;
                    items.insert(format!("{}_{}", method, index), item);
                }
                debug!(method, trait_name, count = entries.len(), "Loaded items");
            }
        }
        Ok(datasets)
    }
}

impl DataSource for FileDataSource {
    fn load(&self, key: &str) -> Result<Value> {
        let path = self
            .files
            .get(key)
            .ok_or_else(|| SjtError::RecordNotFound(key.to_string()))?;
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        if !value.is_object() {
            return Err(SjtError::Data(format!(
                "{}: expected a JSON object keyed by trait",
                path.display()
            )));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_bank(dir: &Path, name: &str, value: Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn test_load_items_flattens_methods() {
        let dir = tempfile::tempdir().unwrap();
        let ours = write_bank(
            dir.path(),
            "ours.json",
            json!({
                "Openness": {
                    "0": {"situation": "s0", "options": {"A": "x"}},
                    "1": {"scenario_text": "s1", "options": {"A": "y"}}
                },
                "Neuroticism": {"0": {"situation": "n0"}}
            }),
        );
        let base = write_bank(
            dir.path(),
            "base.json",
            json!({"Openness": {"0": {"situation": "b0", "options": []}}}),
        );
        let source = FileDataSource::new()
            .with_method("ours", ours)
            .unwrap()
            .with_method("base", base)
            .unwrap();

        let data = source
            .load_items(&["Openness", "Neuroticism"], &["ours", "base"])
            .unwrap();

        let openness: Vec<&str> = data["Openness"].keys().map(String::as_str).collect();
        assert_eq!(openness, vec!["base_0", "ours_0", "ours_1"]);
        assert_eq!(data["Openness"]["ours_1"].situation, "s1");
        assert_eq!(data["Neuroticism"].len(), 1);
        assert_eq!(data["Neuroticism"]["ours_0"].options, Value::Null);
    }

    #[test]
    fn test_unknown_method() {
        let err = FileDataSource::new().load("ghost").unwrap_err();
        assert!(matches!(err, SjtError::RecordNotFound(ref m) if m == "ghost"));
    }

    #[test]
    fn test_item_without_situation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bank(dir.path(), "bad.json", json!({"Openness": {"0": {"options": {}}}}));
        let source = FileDataSource::new().with_method("bad", path).unwrap();
        let err = source.load_items(&["Openness"], &["bad"]).unwrap_err();
        assert!(matches!(err, SjtError::Data(ref m) if m.contains("bad: Openness[0]")));
    }

    #[test]
    fn test_non_object_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bank(dir.path(), "list.json", json!([1, 2]));
        let source = FileDataSource::new().with_method("list", path).unwrap();
        assert!(matches!(source.load("list"), Err(SjtError::Data(_))));
    }

    #[test]
    fn test_from_specs() {
        let source = FileDataSource::from_specs(&["ours=a.json", "krumm = b.json"]).unwrap();
        assert_eq!(source.methods(), vec!["krumm".to_string(), "ours".to_string()]);

        assert!(FileDataSource::from_specs(&["no-separator"]).is_err());
        assert!(FileDataSource::from_specs(&["two_parts=x.json"]).is_err());
    }
}
