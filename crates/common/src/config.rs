//! Hierarchical YAML configuration addressed by dotted paths.
//!
//! A [`Config`] is a single YAML document. Values are looked up with paths
//! such as `retrain.min_scale` or `model.layers.0.units` (numeric segments
//! index sequences). Command-line overrides use the same paths:
//! `system.summary.save=true`.
//!
//! Typed views over sub-trees live in [`crate::sections`]; they are
//! deserialised on demand with [`Config::section`].

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::error::{ConfigError, Result};

/// Dotted-path view over a YAML document.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    root: Value,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Empty configuration (a YAML mapping with no keys).
    pub fn new() -> Self {
        Self {
            root: Value::Mapping(Mapping::new()),
        }
    }

    /// Parse a YAML document. An empty document yields an empty config.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(yaml)?;
        let root = if root.is_null() {
            Value::Mapping(Mapping::new())
        } else {
            root
        };
        Ok(Self { root })
    }

    /// Load a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Resolve a dotted path; `None` when any segment is absent.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for key in path.split('.') {
            node = match node {
                Value::Mapping(map) => map.get(key)?,
                Value::Sequence(seq) => seq.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Whether a dotted path resolves to a value.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Typed lookup: `Ok(None)` when absent, an error when present but the
    /// wrong type.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.get(path)
            .map(|value| {
                serde_yaml::from_value(value.clone()).map_err(|e| ConfigError::InvalidValue {
                    key: path.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Deserialise the sub-tree at `path`. A missing sub-tree is treated as
    /// an empty mapping so that `#[serde(default)]` fields apply.
    pub fn section<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self
            .get(path)
            .cloned()
            .unwrap_or_else(|| Value::Mapping(Mapping::new()));
        serde_yaml::from_value(value).map_err(|e| ConfigError::InvalidValue {
            key: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Check that every key needed by `action` is present. All missing keys
    /// are reported at once.
    pub fn validate(&self, keys: &[&str], action: &str) -> Result<()> {
        let missing: Vec<String> = keys
            .iter()
            .filter(|k| !self.contains(k))
            .map(|k| k.to_string())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(ConfigError::MissingKeys {
            action: action.to_string(),
            keys: missing,
        })
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Set the value at a dotted path, creating intermediate mappings.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let mut node = &mut self.root;
        let mut keys = path.split('.').peekable();
        while let Some(key) = keys.next() {
            if node.is_null() {
                *node = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(map) = node else {
                return Err(ConfigError::NotAddressable {
                    path: path.to_string(),
                    key: key.to_string(),
                });
            };
            if keys.peek().is_none() {
                map.insert(Value::String(key.to_string()), value);
                return Ok(());
            }
            node = map
                .entry(Value::String(key.to_string()))
                .or_insert(Value::Null);
        }
        Ok(())
    }

    /// Apply a command-line override of the form `dotted.path=<yaml>`.
    pub fn override_update(&mut self, assignment: &str) -> Result<()> {
        let (path, raw) = assignment
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidValue {
                key: assignment.to_string(),
                message: "expected <dotted.path>=<yaml value>".to_string(),
            })?;
        let value: Value = serde_yaml::from_str(raw)?;
        self.set(path.trim(), value)
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.root)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
