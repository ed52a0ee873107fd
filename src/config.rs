//! Immutable configuration snapshots.
//!
//! A [`ConfigScope`] is loaded once from a TOML file and then only ever read.
//! Tasks that need a different window derive their own scope through
//! [`ConfigScope::with_overrides`]; the source scope and any sibling scopes are
//! unaffected because every derived scope owns its own copy of the values.

use std::{collections::BTreeMap, fs, path::Path, sync::LazyLock};

use regex::Regex;

use crate::error::{Error, Result};

const MAX_INTERPOLATION_DEPTH: usize = 10;

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(?:([A-Za-z_][A-Za-z0-9_]*):)?([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

type Section = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigScope {
    sections: BTreeMap<String, Section>,
}

impl ConfigScope {
    pub fn load(config_path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(config_path).map_err(|e| {
            Error::Config(format!("Error reading {}: {}", config_path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(contents)?;
        let mut sections = BTreeMap::new();

        for (name, value) in table {
            let toml::Value::Table(entries) = value else {
                return Err(Error::Config(format!(
                    "Top-level key '{}' must be a section",
                    name
                )));
            };

            let mut section = Section::new();
            for (key, value) in entries {
                section.insert(key.clone(), flatten_value(&name, &key, value)?);
            }
            sections.insert(name, section);
        }

        Ok(Self { sections })
    }

    /// Serialises the snapshot so it can be written out and reloaded.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(&self.sections)?)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn has_option(&self, section: &str, key: &str) -> bool {
        self.raw(section, key).is_some()
    }

    pub fn keys(&self, section: &str) -> Vec<String> {
        self.sections
            .get(section)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, section: &str, key: &str) -> Result<String> {
        self.get_opt(section, key)?.ok_or_else(|| {
            Error::Config(format!("Missing option '{}' in section [{}]", key, section))
        })
    }

    pub fn get_opt(&self, section: &str, key: &str) -> Result<Option<String>> {
        match self.raw(section, key) {
            Some(value) => self.interpolate(section, value, 0).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_or(&self, section: &str, key: &str, default: &str) -> Result<String> {
        Ok(self
            .get_opt(section, key)?
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn get_int(&self, section: &str, key: &str) -> Result<i32> {
        let value = self.get(section, key)?;
        value.trim().parse().map_err(|_| {
            Error::Config(format!(
                "Option '{}' in section [{}] is not an integer: '{}'",
                key, section, value
            ))
        })
    }

    pub fn get_int_opt(&self, section: &str, key: &str) -> Result<Option<i32>> {
        if self.has_option(section, key) {
            self.get_int(section, key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reads either a TOML array or a comma-separated string.
    pub fn get_list(&self, section: &str, key: &str) -> Result<Vec<String>> {
        let value = self.get(section, key)?;
        let trimmed = value.trim();

        if trimmed.starts_with('[') {
            let items: Vec<serde_json::Value> = serde_json::from_str(trimmed)?;
            return Ok(items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect());
        }

        Ok(trimmed
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn with_overrides(&self) -> ScopeOverrides<'_> {
        ScopeOverrides {
            base: self,
            changes: Vec::new(),
        }
    }

    fn raw(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    fn interpolate(&self, section: &str, text: &str, depth: usize) -> Result<String> {
        if !text.contains("${") {
            return Ok(text.to_string());
        }

        if depth >= MAX_INTERPOLATION_DEPTH {
            return Err(Error::Config(format!(
                "Interpolation too deep while expanding '{}' in section [{}]",
                text, section
            )));
        }

        let mut result = String::with_capacity(text.len());
        let mut last = 0;

        for caps in REFERENCE.captures_iter(text) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let target_section = caps.get(1).map_or(section, |m| m.as_str());
            let target_key = &caps[2];

            let raw = self.raw(target_section, target_key).ok_or_else(|| {
                Error::Config(format!(
                    "Bad interpolation in section [{}]: no option '{}' in section [{}]",
                    section, target_key, target_section
                ))
            })?;

            result.push_str(&text[last..whole.start]);
            result.push_str(&self.interpolate(target_section, raw, depth + 1)?);
            last = whole.end;
        }

        result.push_str(&text[last..]);
        Ok(result)
    }
}

/// Builder returned by [`ConfigScope::with_overrides`].
pub struct ScopeOverrides<'a> {
    base: &'a ConfigScope,
    changes: Vec<(String, String, String)>,
}

impl ScopeOverrides<'_> {
    pub fn set(mut self, section: &str, key: &str, value: impl Into<String>) -> Self {
        self.changes
            .push((section.to_string(), key.to_string(), value.into()));
        self
    }

    pub fn build(self) -> ConfigScope {
        let mut scope = self.base.clone();
        for (section, key, value) in self.changes {
            scope.sections.entry(section).or_default().insert(key, value);
        }
        scope
    }
}

fn flatten_value(section: &str, key: &str, value: toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(d) => Ok(d.to_string()),
        toml::Value::Array(items) => {
            let items = items
                .into_iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(serde_json::Value::String(s)),
                    toml::Value::Integer(i) => Ok(serde_json::Value::from(i)),
                    toml::Value::Float(f) => Ok(serde_json::Value::from(f)),
                    toml::Value::Boolean(b) => Ok(serde_json::Value::from(b)),
                    _ => Err(Error::Config(format!(
                        "Option '{}' in section [{}] may only hold scalar list items",
                        key, section
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(serde_json::Value::Array(items).to_string())
        }
        toml::Value::Table(_) => Err(Error::Config(format!(
            "Option '{}' in section [{}] cannot be a nested table",
            key, section
        ))),
    }
}
