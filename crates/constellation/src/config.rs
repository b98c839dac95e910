// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hierarchical configuration value object.
//!
//! Keys are case-folded to lower case; values are scalars (bool, int,
//! float, string, UTC timestamp), homogeneous arrays of scalars, or nested
//! sections. The object tracks which keys have been read so that unread
//! keys can be reported back to the user after initialization. String
//! values may reference environment variables as `${VAR}` or
//! `${VAR:-default}`, resolved when the value is read.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::ConfigError;
use crate::protocol::value::{Map, Value};

/// Which configuration keys to include when rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigGroup {
    /// All key-value pairs, both user and internal.
    All,
    /// Key-value pairs intended for framework users.
    User,
    /// Key-value pairs intended for internal framework usage (`_` prefix).
    Internal,
}

/// A validated configuration dictionary with used-key tracking.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    values: Map,
    used: BTreeSet<String>,
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration::default()
    }

    /// Build from a raw map, validating and case-folding keys.
    pub fn try_from_map(map: Map) -> Result<Configuration, ConfigError> {
        let values = validate_and_fold(map, "")?;
        Ok(Configuration {
            values,
            used: BTreeSet::new(),
        })
    }

    /// Whether the key exists (dotted paths address nested sections).
    pub fn has(&self, key: &str) -> bool {
        lookup(&self.values, &key.to_lowercase()).is_some()
    }

    /// Number of top-level entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The underlying map of all values.
    pub fn as_map(&self) -> &Map {
        &self.values
    }

    /// Insert a default value unless the key is already defined.
    pub fn set_default(&mut self, key: &str, value: Value) {
        let key = key.to_lowercase();
        self.values.entry(key).or_insert(value);
    }

    /// Rename an existing key to a new name.
    pub fn set_alias(&mut self, new_key: &str, old_key: &str) {
        let old_key = old_key.to_lowercase();
        if let Some(value) = self.values.remove(&old_key) {
            self.values.insert(new_key.to_lowercase(), value);
        }
    }

    /// Read a value, marking the key (and the sections leading to it) used.
    pub fn get(&mut self, key: &str) -> Result<Value, ConfigError> {
        let key = key.to_lowercase();
        let value = lookup(&self.values, &key)
            .cloned()
            .ok_or_else(|| ConfigError::MissingKey(key.clone()))?;
        if matches!(value, Value::Map(_)) {
            return Err(ConfigError::InvalidType {
                key,
                target: "scalar or array (value is a section)",
            });
        }
        self.mark_used(&key);
        resolve_env(&key, value)
    }

    pub fn get_bool(&mut self, key: &str) -> Result<bool, ConfigError> {
        let value = self.get(key)?;
        value.as_bool().ok_or_else(|| ConfigError::InvalidType {
            key: key.to_lowercase(),
            target: "bool",
        })
    }

    pub fn get_int(&mut self, key: &str) -> Result<i64, ConfigError> {
        let value = self.get(key)?;
        value.as_int().ok_or_else(|| ConfigError::InvalidType {
            key: key.to_lowercase(),
            target: "int",
        })
    }

    /// Read an integer, installing `default` if the key is undefined.
    pub fn get_int_or(&mut self, key: &str, default: i64) -> Result<i64, ConfigError> {
        self.set_default(key, Value::Int(default));
        self.get_int(key)
    }

    pub fn get_float(&mut self, key: &str) -> Result<f64, ConfigError> {
        let value = self.get(key)?;
        value.as_float().ok_or_else(|| ConfigError::InvalidType {
            key: key.to_lowercase(),
            target: "float",
        })
    }

    pub fn get_str(&mut self, key: &str) -> Result<String, ConfigError> {
        let value = self.get(key)?;
        match value {
            Value::Str(s) => Ok(s),
            _ => Err(ConfigError::InvalidType {
                key: key.to_lowercase(),
                target: "string",
            }),
        }
    }

    /// Read a string, installing `default` if the key is undefined.
    pub fn get_str_or(&mut self, key: &str, default: &str) -> Result<String, ConfigError> {
        self.set_default(key, Value::Str(default.to_owned()));
        self.get_str(key)
    }

    /// Read an array value.
    pub fn get_array(&mut self, key: &str) -> Result<Vec<Value>, ConfigError> {
        let value = self.get(key)?;
        match value {
            Value::Array(items) => Ok(items),
            _ => Err(ConfigError::InvalidType {
                key: key.to_lowercase(),
                target: "array",
            }),
        }
    }

    /// Read an array of strings as a set.
    pub fn get_str_set(&mut self, key: &str) -> Result<BTreeSet<String>, ConfigError> {
        let value = self.get(key)?;
        let items = value.as_array().ok_or_else(|| ConfigError::InvalidType {
            key: key.to_lowercase(),
            target: "array",
        })?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| ConfigError::InvalidType {
                        key: key.to_lowercase(),
                        target: "array of strings",
                    })
            })
            .collect()
    }

    /// Remove entries never read and return their dotted keys.
    ///
    /// A section never entered is reported as a single key. The remaining
    /// dictionary is the applied configuration.
    pub fn take_unused(&mut self) -> Vec<String> {
        let mut unused = Vec::new();
        let values = std::mem::take(&mut self.values);
        self.values = sweep_unused(values, "", &self.used, &mut unused);
        unused
    }

    /// Update values in place from a partial configuration (reconfigure).
    ///
    /// Every key of `partial` must already exist with the same value type.
    pub fn update(&mut self, partial: &Configuration) -> Result<(), ConfigError> {
        validate_update(&self.values, &partial.values, "")?;
        apply_update(&mut self.values, &partial.values);
        Ok(())
    }

    /// Render the configuration as an indented listing.
    pub fn to_string_group(&self, group: ConfigGroup) -> String {
        let mut out = String::new();
        for (key, value) in &self.values {
            let internal = key.starts_with('_');
            match group {
                ConfigGroup::User if internal => continue,
                ConfigGroup::Internal if !internal => continue,
                _ => {}
            }
            format_entry(&mut out, key, value, 2);
        }
        out.trim_end().to_owned()
    }

    fn mark_used(&mut self, key: &str) {
        // Mark the key and every section on the path to it.
        let mut path = String::new();
        for part in key.split('.') {
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(part);
            self.used.insert(path.clone());
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_group(ConfigGroup::All))
    }
}

fn lookup<'a>(values: &'a Map, key: &str) -> Option<&'a Value> {
    match key.split_once('.') {
        None => values.get(key),
        Some((head, rest)) => match values.get(head) {
            Some(Value::Map(section)) => lookup(section, rest),
            _ => None,
        },
    }
}

fn validate_and_fold(map: Map, prefix: &str) -> Result<Map, ConfigError> {
    let mut folded = Map::new();
    for (key, value) in map {
        let key_lc = key.to_lowercase();
        let full = format!("{prefix}{key_lc}");
        if folded.contains_key(&key_lc) {
            return Err(ConfigError::InvalidDictionary(format!(
                "key `{full}` already present"
            )));
        }
        let value = match value {
            Value::Map(section) => Value::Map(validate_and_fold(section, &format!("{full}."))?),
            Value::Array(items) => {
                validate_array(&items, &full)?;
                Value::Array(items)
            }
            scalar => {
                validate_scalar(&scalar, &full)?;
                scalar
            }
        };
        folded.insert(key_lc, value);
    }
    Ok(folded)
}

fn validate_scalar(value: &Value, key: &str) -> Result<(), ConfigError> {
    match value {
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Time(_) => Ok(()),
        other => Err(ConfigError::InvalidDictionary(format!(
            "value of key `{key}` not scalar ({other:?})"
        ))),
    }
}

fn validate_array(items: &[Value], key: &str) -> Result<(), ConfigError> {
    let Some(first) = items.first() else {
        return Ok(());
    };
    validate_scalar(first, key)?;
    let homogeneous = items
        .iter()
        .all(|item| std::mem::discriminant(item) == std::mem::discriminant(first));
    if !homogeneous {
        return Err(ConfigError::InvalidDictionary(format!(
            "array value of key `{key}` not homogeneous"
        )));
    }
    Ok(())
}

fn sweep_unused(values: Map, prefix: &str, used: &BTreeSet<String>, unused: &mut Vec<String>) -> Map {
    let mut kept = Map::new();
    for (key, value) in values {
        let full = format!("{prefix}{key}");
        match value {
            Value::Map(section) => {
                if used.contains(&full) {
                    let sub = sweep_unused(section, &format!("{full}."), used, unused);
                    kept.insert(key, Value::Map(sub));
                } else {
                    unused.push(full);
                }
            }
            value => {
                if used.contains(&full) {
                    kept.insert(key, value);
                } else {
                    unused.push(full);
                }
            }
        }
    }
    kept
}

fn validate_update(base: &Map, partial: &Map, prefix: &str) -> Result<(), ConfigError> {
    for (key, new_value) in partial {
        let full = format!("{prefix}{key}");
        let Some(value) = base.get(key) else {
            return Err(ConfigError::InvalidUpdate {
                key: full,
                reason: "key does not exist in current configuration".into(),
            });
        };
        if std::mem::discriminant(value) != std::mem::discriminant(new_value) {
            return Err(ConfigError::InvalidUpdate {
                key: full,
                reason: "cannot change value type".into(),
            });
        }
        if let (Value::Map(base_section), Value::Map(new_section)) = (value, new_value) {
            validate_update(base_section, new_section, &format!("{full}."))?;
        }
        if let (Value::Array(base_items), Value::Array(new_items)) = (value, new_value) {
            if let (Some(a), Some(b)) = (base_items.first(), new_items.first()) {
                if std::mem::discriminant(a) != std::mem::discriminant(b) {
                    return Err(ConfigError::InvalidUpdate {
                        key: full,
                        reason: "cannot change array element type".into(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn apply_update(base: &mut Map, partial: &Map) {
    for (key, new_value) in partial {
        match (base.get_mut(key), new_value) {
            (Some(Value::Map(base_section)), Value::Map(new_section)) => {
                apply_update(base_section, new_section);
            }
            (Some(slot), _) => *slot = new_value.clone(),
            (None, _) => {}
        }
    }
}

fn format_entry(out: &mut String, key: &str, value: &Value, indent: usize) {
    let pad = " ".repeat(indent);
    match value {
        Value::Map(section) => {
            out.push_str(&format!("{pad}{key}:\n"));
            for (sub_key, sub_value) in section {
                format_entry(out, sub_key, sub_value, indent + 2);
            }
        }
        Value::Str(s) => out.push_str(&format!("{pad}{key}: {s}\n")),
        Value::Bool(b) => out.push_str(&format!("{pad}{key}: {b}\n")),
        Value::Int(i) => out.push_str(&format!("{pad}{key}: {i}\n")),
        Value::Float(f) => out.push_str(&format!("{pad}{key}: {f}\n")),
        Value::Time(t) => out.push_str(&format!("{pad}{key}: {}\n", t.to_rfc3339())),
        other => out.push_str(&format!("{pad}{key}: {other:?}\n")),
    }
}

/// Resolve `${VAR}` / `${VAR:-default}` references in string values.
fn resolve_env(key: &str, value: Value) -> Result<Value, ConfigError> {
    match value {
        Value::Str(s) => Ok(Value::Str(resolve_env_str(key, &s)?)),
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| resolve_env(key, item))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        other => Ok(other),
    }
}

fn resolve_env_str(key: &str, input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if c == '\\' && matches!(chars.peek(), Some((_, '$'))) {
            // escaped dollar sign
            chars.next();
            out.push('$');
            continue;
        }
        if c == '$' && matches!(chars.peek(), Some((_, '{'))) {
            let rest = &input[idx..];
            let Some(close) = rest.find('}') else {
                return Err(ConfigError::InvalidValue {
                    key: key.to_owned(),
                    reason: "unterminated environment reference".into(),
                });
            };
            let reference = &rest[2..close];
            let (var, default) = match reference.split_once(":-") {
                Some((var, default)) => (var, Some(default)),
                None => (reference, None),
            };
            match std::env::var(var) {
                Ok(value) => out.push_str(&value),
                Err(_) => match default {
                    Some(default) => out.push_str(default),
                    None => return Err(ConfigError::MissingEnvVariable(var.to_owned())),
                },
            }
            // Skip to the closing brace.
            while let Some((i, _)) = chars.peek() {
                if *i > idx + close {
                    break;
                }
                chars.next();
            }
            continue;
        }
        out.push(c);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configuration {
        let mut section = Map::new();
        section.insert("Gain".into(), Value::Int(4));
        let mut map = Map::new();
        map.insert("Voltage".into(), Value::Int(1000));
        map.insert("label".into(), Value::Str("front".into()));
        map.insert("amp".into(), Value::Map(section));
        Configuration::try_from_map(map).unwrap()
    }

    #[test]
    fn keys_are_case_folded() {
        let mut config = sample();
        assert!(config.has("voltage"));
        assert!(config.has("VOLTAGE"));
        assert_eq!(config.get_int("Voltage").unwrap(), 1000);
        assert_eq!(config.get_int("amp.gain").unwrap(), 4);
    }

    #[test]
    fn duplicate_keys_after_fold_are_rejected() {
        let mut map = Map::new();
        map.insert("Voltage".into(), Value::Int(1));
        map.insert("voltage".into(), Value::Int(2));
        assert!(Configuration::try_from_map(map).is_err());
    }

    #[test]
    fn arrays_must_be_homogeneous() {
        let mut map = Map::new();
        map.insert(
            "mixed".into(),
            Value::Array(vec![Value::Int(1), Value::Str("two".into())]),
        );
        assert!(Configuration::try_from_map(map).is_err());

        let mut map = Map::new();
        map.insert(
            "ints".into(),
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        );
        assert!(Configuration::try_from_map(map).is_ok());
    }

    #[test]
    fn unused_keys_are_reported_and_removed() {
        let mut config = sample();
        let _ = config.get_int("voltage").unwrap();
        let unused = config.take_unused();
        assert_eq!(unused, vec!["amp".to_owned(), "label".to_owned()]);
        assert!(!config.has("label"));
        assert!(config.has("voltage"));
    }

    #[test]
    fn reading_a_section_key_keeps_the_section() {
        let mut config = sample();
        let _ = config.get_int("amp.gain").unwrap();
        let unused = config.take_unused();
        assert_eq!(unused, vec!["label".to_owned(), "voltage".to_owned()]);
        assert!(config.has("amp.gain"));
    }

    #[test]
    fn defaults_and_aliases() {
        let mut config = sample();
        assert_eq!(config.get_int_or("_eor_timeout", 10).unwrap(), 10);
        config.set_alias("volts", "voltage");
        assert!(!config.has("voltage"));
        assert_eq!(config.get_int("volts").unwrap(), 1000);
    }

    #[test]
    fn update_validates_types() {
        let mut config = sample();
        let mut partial = Map::new();
        partial.insert("voltage".into(), Value::Int(1500));
        let partial = Configuration::try_from_map(partial).unwrap();
        config.update(&partial).unwrap();
        assert_eq!(config.get_int("voltage").unwrap(), 1500);

        let mut bad = Map::new();
        bad.insert("voltage".into(), Value::Str("high".into()));
        let bad = Configuration::try_from_map(bad).unwrap();
        assert!(config.update(&bad).is_err());

        let mut missing = Map::new();
        missing.insert("current".into(), Value::Int(1));
        let missing = Configuration::try_from_map(missing).unwrap();
        assert!(config.update(&missing).is_err());
    }

    #[test]
    fn env_references_resolve() {
        std::env::set_var("CONSTELLATION_TEST_VAR", "resolved");
        let mut map = Map::new();
        map.insert(
            "path".into(),
            Value::Str("pre/${CONSTELLATION_TEST_VAR}/post".into()),
        );
        map.insert("fallback".into(), Value::Str("${NOPE_UNSET:-dflt}".into()));
        map.insert("missing".into(), Value::Str("${NOPE_UNSET}".into()));
        map.insert("escaped".into(), Value::Str(r"\${literal}".into()));
        let mut config = Configuration::try_from_map(map).unwrap();

        assert_eq!(config.get_str("path").unwrap(), "pre/resolved/post");
        assert_eq!(config.get_str("fallback").unwrap(), "dflt");
        assert!(matches!(
            config.get_str("missing"),
            Err(ConfigError::MissingEnvVariable(_))
        ));
        assert_eq!(config.get_str("escaped").unwrap(), "${literal}");
    }

    #[test]
    fn rendering_filters_internal_keys() {
        let mut map = Map::new();
        map.insert("_eor_timeout".into(), Value::Int(10));
        map.insert("voltage".into(), Value::Int(1000));
        let config = Configuration::try_from_map(map).unwrap();

        let user = config.to_string_group(ConfigGroup::User);
        assert!(user.contains("voltage"));
        assert!(!user.contains("_eor_timeout"));
        let internal = config.to_string_group(ConfigGroup::Internal);
        assert!(internal.contains("_eor_timeout"));
        assert!(!internal.contains("voltage"));
    }
}
