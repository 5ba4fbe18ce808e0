//! Hierarchical option sets.
//!
//! A [`ParameterList`] is a named JSON object. Options are scalars, arrays,
//! or nested objects (sublists). Getters either require an option or fall
//! back to a default; a present option of the wrong type is always an error.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// A named, hierarchical option set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterList {
    name: String,
    values: Map<String, Value>,
}

impl ParameterList {
    /// An empty list.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Map::new(),
        }
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(name: impl Into<String>, value: Value) -> Result<Self, ConfigError> {
        let name = name.into();
        match value {
            Value::Object(values) => Ok(Self { name, values }),
            _ => Err(ConfigError::Parse {
                reason: format!("parameter list '{name}' must be a JSON object"),
            }),
        }
    }

    /// Parse JSON text.
    pub fn from_json(name: impl Into<String>, text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        Self::from_value(name, value)
    }

    /// The list's name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the list.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Option names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    /// Whether `name` exists and is not a sublist.
    pub fn is_parameter(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(v) if !v.is_object())
    }

    /// Whether `name` exists and is a sublist.
    pub fn is_sublist(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(Value::Object(_)))
    }

    /// Set an option, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Insert a sublist.
    pub fn set_sublist(&mut self, name: impl Into<String>, list: ParameterList) -> &mut Self {
        self.values.insert(name.into(), Value::Object(list.values));
        self
    }

    fn missing(&self, name: &str) -> ConfigError {
        ConfigError::MissingParameter {
            list: self.name.clone(),
            name: name.to_string(),
        }
    }

    fn wrong_type(&self, name: &str, expected: &'static str) -> ConfigError {
        ConfigError::WrongType {
            list: self.name.clone(),
            name: name.to_string(),
            expected,
        }
    }

    /// Build an [`InvalidValue`](ConfigError::InvalidValue) error for `name`.
    pub fn invalid(&self, name: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            list: self.name.clone(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Required string option.
    pub fn get_str(&self, name: &str) -> Result<&str, ConfigError> {
        match self.values.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(self.wrong_type(name, "string")),
            None => Err(self.missing(name)),
        }
    }

    /// String option with a default.
    pub fn get_string_or(&self, name: &str, default: &str) -> Result<String, ConfigError> {
        match self.values.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(self.wrong_type(name, "string")),
            None => Ok(default.to_string()),
        }
    }

    /// Required boolean option.
    pub fn get_bool(&self, name: &str) -> Result<bool, ConfigError> {
        match self.values.get(name) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(self.wrong_type(name, "bool")),
            None => Err(self.missing(name)),
        }
    }

    /// Boolean option with a default.
    pub fn get_bool_or(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.values.get(name) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(self.wrong_type(name, "bool")),
            None => Ok(default),
        }
    }

    /// Required floating-point option. Integers are accepted.
    pub fn get_f64(&self, name: &str) -> Result<f64, ConfigError> {
        match self.values.get(name) {
            Some(v) => v.as_f64().ok_or_else(|| self.wrong_type(name, "number")),
            None => Err(self.missing(name)),
        }
    }

    /// Floating-point option with a default.
    pub fn get_f64_or(&self, name: &str, default: f64) -> Result<f64, ConfigError> {
        match self.values.get(name) {
            Some(v) => v.as_f64().ok_or_else(|| self.wrong_type(name, "number")),
            None => Ok(default),
        }
    }

    /// Optional floating-point option.
    pub fn get_f64_opt(&self, name: &str) -> Result<Option<f64>, ConfigError> {
        match self.values.get(name) {
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.wrong_type(name, "number")),
            None => Ok(None),
        }
    }

    /// Integer option with a default.
    pub fn get_i64_or(&self, name: &str, default: i64) -> Result<i64, ConfigError> {
        match self.values.get(name) {
            Some(v) => v.as_i64().ok_or_else(|| self.wrong_type(name, "integer")),
            None => Ok(default),
        }
    }

    /// Required array of numbers.
    pub fn get_f64_array(&self, name: &str) -> Result<Vec<f64>, ConfigError> {
        match self.values.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_f64().ok_or_else(|| self.wrong_type(name, "array of numbers")))
                .collect(),
            Some(_) => Err(self.wrong_type(name, "array of numbers")),
            None => Err(self.missing(name)),
        }
    }

    /// Required array of non-negative integers.
    pub fn get_index_array(&self, name: &str) -> Result<Vec<usize>, ConfigError> {
        match self.values.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_u64()
                        .map(|i| i as usize)
                        .ok_or_else(|| self.wrong_type(name, "array of indices"))
                })
                .collect(),
            Some(_) => Err(self.wrong_type(name, "array of indices")),
            None => Err(self.missing(name)),
        }
    }

    /// Array of strings with a default.
    pub fn get_string_array_or(
        &self,
        name: &str,
        default: &[&str],
    ) -> Result<Vec<String>, ConfigError> {
        match self.values.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| self.wrong_type(name, "array of strings"))
                })
                .collect(),
            Some(_) => Err(self.wrong_type(name, "array of strings")),
            None => Ok(default.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Required sublist. The child is named `"<parent>->name"`.
    pub fn sublist(&self, name: &str) -> Result<ParameterList, ConfigError> {
        match self.values.get(name) {
            Some(Value::Object(values)) => Ok(ParameterList {
                name: format!("{}->{name}", self.name),
                values: values.clone(),
            }),
            Some(_) => Err(self.wrong_type(name, "sublist")),
            None => Err(self.missing(name)),
        }
    }

    /// Sublist, or an empty list with the same name if absent.
    pub fn sublist_or_empty(&self, name: &str) -> Result<ParameterList, ConfigError> {
        if self.values.contains_key(name) {
            self.sublist(name)
        } else {
            Ok(ParameterList::new(format!("{}->{name}", self.name)))
        }
    }

    /// Iterate over all sublists as `(name, list)` pairs.
    pub fn sublists(&self) -> impl Iterator<Item = Result<(String, ParameterList), ConfigError>> + '_ {
        self.values
            .iter()
            .filter(|(_, v)| v.is_object())
            .map(|(k, _)| self.sublist(k).map(|l| (k.clone(), l)))
    }

    /// Deserialize the whole list into a serde type.
    ///
    /// Used for flat numeric blocks whose fields carry
    /// `#[serde(rename = "...")]` option names.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(Value::Object(self.values.clone())).map_err(|e| {
            ConfigError::Parse {
                reason: format!("{}: {e}", self.name),
            }
        })
    }

    /// The underlying JSON object.
    pub fn as_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn list() -> ParameterList {
        ParameterList::from_value(
            "eos",
            json!({
                "EOS basis": "both",
                "molar mass": 0.018,
                "cells": [0, 2],
                "flag": true,
                "EOS parameters": { "EOS type": "constant" }
            }),
        )
        .unwrap()
    }

    #[test]
    fn typed_getters() {
        let p = list();
        assert_eq!(p.get_str("EOS basis").unwrap(), "both");
        assert_eq!(p.get_f64("molar mass").unwrap(), 0.018);
        assert!(p.get_bool_or("flag", false).unwrap());
        assert_eq!(p.get_index_array("cells").unwrap(), vec![0, 2]);
        assert_eq!(p.get_f64_or("absent", 1.5).unwrap(), 1.5);
    }

    #[test]
    fn missing_required_is_error() {
        match list().get_str("molar density key") {
            Err(ConfigError::MissingParameter { list, name }) => {
                assert_eq!(list, "eos");
                assert_eq!(name, "molar density key");
            }
            other => panic!("expected MissingParameter, got {other:?}"),
        }
    }

    #[test]
    fn wrong_type_is_error_even_with_default() {
        match list().get_bool_or("EOS basis", false) {
            Err(ConfigError::WrongType { expected, .. }) => assert_eq!(expected, "bool"),
            other => panic!("expected WrongType, got {other:?}"),
        }
    }

    #[test]
    fn sublist_name_is_nested() {
        let sub = list().sublist("EOS parameters").unwrap();
        assert_eq!(sub.name(), "eos->EOS parameters");
        assert!(list().is_sublist("EOS parameters"));
        assert!(!list().is_parameter("EOS parameters"));
    }

    #[test]
    fn deserialize_with_renamed_fields() {
        #[derive(Deserialize)]
        struct Block {
            #[serde(rename = "molar mass")]
            molar_mass: f64,
        }
        let b: Block = list().deserialize().unwrap();
        assert_eq!(b.molar_mass, 0.018);
    }

    #[test]
    fn non_object_json_rejected() {
        assert!(ParameterList::from_json("x", "[1, 2]").is_err());
    }
}
