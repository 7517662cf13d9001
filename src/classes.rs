use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

pub const DEFAULT_SIGNS: [&str; 6] = ["bye", "hello", "yes", "no", "thank_you", "perfect"];

/// Index → sign name table shipped next to the classifier as `class_mapping.json`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassMapping {
    names: Vec<String>,
}

impl Default for ClassMapping {
    fn default() -> Self {
        Self::from_names(DEFAULT_SIGNS.iter().map(|s| s.to_string()).collect())
    }
}

impl ClassMapping {
    pub fn from_names(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Parses `{"0": "bye", "1": "hello", ...}`. Keys must cover `0..n` without gaps.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> =
            serde_json::from_str(text).context("class mapping is not a string map")?;
        let mut indexed = BTreeMap::new();
        for (key, name) in raw {
            let idx: usize = key
                .trim()
                .parse()
                .with_context(|| format!("class mapping key {key:?} is not an index"))?;
            indexed.insert(idx, name);
        }
        for (expected, idx) in indexed.keys().enumerate() {
            if *idx != expected {
                bail!("class mapping is missing index {expected}");
            }
        }
        if indexed.is_empty() {
            bail!("class mapping is empty");
        }
        Ok(Self::from_names(indexed.into_values().collect()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read class mapping {path:?}"))?;
        Self::from_json(&text).with_context(|| format!("invalid class mapping {path:?}"))
    }

    /// First readable mapping among `paths`, or the built-in sign list.
    pub fn load_first(paths: &[impl AsRef<Path>]) -> Self {
        for path in paths {
            let path = path.as_ref();
            if !path.is_file() {
                continue;
            }
            match Self::load(path) {
                Ok(mapping) => {
                    log::info!("loaded class mapping from {path:?}: {:?}", mapping.names);
                    return mapping;
                }
                Err(err) => log::warn!("skipping class mapping {path:?}: {err:?}"),
            }
        }
        log::warn!("no class mapping found, using built-in sign list");
        Self::default()
    }

    pub fn to_json(&self) -> Result<String> {
        let map: BTreeMap<String, &str> = self
            .names
            .iter()
            .enumerate()
            .map(|(idx, name)| (idx.to_string(), name.as_str()))
            .collect();
        Ok(serde_json::to_string_pretty(&map)?)
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_keys_in_numeric_order() {
        let mapping = ClassMapping::from_json(
            r#"{"10": "k", "0": "a", "1": "b", "2": "c", "3": "d", "4": "e", "5": "f",
                "6": "g", "7": "h", "8": "i", "9": "j"}"#,
        )
        .unwrap();
        assert_eq!(mapping.len(), 11);
        assert_eq!(mapping.name(2), Some("c"));
        assert_eq!(mapping.name(10), Some("k"));
    }

    #[test]
    fn rejects_gaps() {
        assert!(ClassMapping::from_json(r#"{"0": "a", "2": "c"}"#).is_err());
        assert!(ClassMapping::from_json(r#"{"zero": "a"}"#).is_err());
    }

    #[test]
    fn falls_back_to_default_signs() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("class_mapping.json");
        let broken = dir.path().join("broken.json");
        fs::write(&broken, "not json").unwrap();
        let mapping = ClassMapping::load_first(&[missing, broken]);
        assert_eq!(mapping, ClassMapping::default());
        assert_eq!(mapping.index_of("thank_you"), Some(4));
    }

    #[test]
    fn json_output_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("class_mapping.json");
        fs::write(&path, ClassMapping::default().to_json().unwrap()).unwrap();
        assert_eq!(ClassMapping::load(&path).unwrap(), ClassMapping::default());
    }
}
