//! Typed option schemas for behaviors and protocols.
//!
//! Every behavior and protocol declares its options as a static slice of
//! [`OptionSpec`]. Raw values coming from the config file, the command line or
//! the control API are validated against that schema exactly once, producing a
//! [`Settings`] value whose entries are guaranteed to have the declared type.
//! Unknown option names, values of the wrong type and out-of-range values are
//! rejected; there is no string coercion.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Type of an option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Int,
    Float,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OptionKind::Bool => "bool",
            OptionKind::Int => "int",
            OptionKind::Float => "float",
        })
    }
}

/// A validated option value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Float(_) => OptionKind::Float,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{v}"),
            OptionValue::Int(v) => write!(f, "{v}"),
            OptionValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Declaration of one option: name, help text, default and optional lower bound.
///
/// The option type is the type of its default.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub default: OptionValue,
    pub min: Option<f64>,
}

impl OptionSpec {
    pub const fn new(name: &'static str, help: &'static str, default: OptionValue) -> Self {
        Self {
            name,
            help,
            default,
            min: None,
        }
    }

    /// Reject numeric values below `min`.
    pub const fn at_least(self, min: f64) -> Self {
        Self {
            min: Some(min),
            ..self
        }
    }

    pub fn kind(&self) -> OptionKind {
        self.default.kind()
    }

    fn coerce(&self, owner: &str, raw: &RawValue) -> Result<OptionValue, OptionError> {
        let value = match (self.default, raw) {
            (OptionValue::Bool(_), RawValue::Bool(v)) => OptionValue::Bool(*v),
            (OptionValue::Int(_), RawValue::Int(v)) => OptionValue::Int(*v),
            (OptionValue::Float(_), RawValue::Float(v)) if v.is_finite() => OptionValue::Float(*v),
            (OptionValue::Float(_), RawValue::Int(v)) => OptionValue::Float(*v as f64),
            _ => {
                return Err(OptionError::Type {
                    owner: owner.to_string(),
                    option: self.name.to_string(),
                    expected: self.kind(),
                    found: raw.type_name(),
                })
            }
        };

        if let Some(min) = self.min {
            let number = match value {
                OptionValue::Int(v) => v as f64,
                OptionValue::Float(v) => v,
                OptionValue::Bool(_) => min,
            };
            if number < min {
                return Err(OptionError::Range {
                    owner: owner.to_string(),
                    option: self.name.to_string(),
                    min,
                    value: number,
                });
            }
        }

        Ok(value)
    }
}

/// An unvalidated option value as it arrived from config, CLI or the control API.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Anything else (arrays, tables, null); only the type name is kept.
    Other(&'static str),
}

impl RawValue {
    fn type_name(&self) -> &'static str {
        match self {
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::Float(v) if !v.is_finite() => "non-finite float",
            RawValue::Float(_) => "float",
            RawValue::Text(_) => "string",
            RawValue::Other(name) => *name,
        }
    }
}

impl From<&toml::Value> for RawValue {
    fn from(value: &toml::Value) -> Self {
        match value {
            toml::Value::Boolean(v) => RawValue::Bool(*v),
            toml::Value::Integer(v) => RawValue::Int(*v),
            toml::Value::Float(v) => RawValue::Float(*v),
            toml::Value::String(v) => RawValue::Text(v.clone()),
            toml::Value::Datetime(_) => RawValue::Other("datetime"),
            toml::Value::Array(_) => RawValue::Other("array"),
            toml::Value::Table(_) => RawValue::Other("table"),
        }
    }
}

impl From<&serde_json::Value> for RawValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(v) => RawValue::Bool(*v),
            serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(v), _) => RawValue::Int(v),
                (None, Some(v)) => RawValue::Float(v),
                (None, None) => RawValue::Other("number"),
            },
            serde_json::Value::String(v) => RawValue::Text(v.clone()),
            serde_json::Value::Null => RawValue::Other("null"),
            serde_json::Value::Array(_) => RawValue::Other("array"),
            serde_json::Value::Object(_) => RawValue::Other("object"),
        }
    }
}

/// Option overrides keyed by option name.
pub type RawOptions = BTreeMap<String, RawValue>;

/// Option validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptionError {
    #[error("{owner} has no option {option:?}; known options: {known}")]
    Unknown {
        owner: String,
        option: String,
        known: String,
    },

    #[error("{owner} option {option:?} expects a {expected}, got a {found}")]
    Type {
        owner: String,
        option: String,
        expected: OptionKind,
        found: &'static str,
    },

    #[error("{owner} option {option:?} must be at least {min}, got {value}")]
    Range {
        owner: String,
        option: String,
        min: f64,
        value: f64,
    },
}

impl OptionError {
    /// Name of the offending option.
    pub fn option(&self) -> &str {
        match self {
            OptionError::Unknown { option, .. }
            | OptionError::Type { option, .. }
            | OptionError::Range { option, .. } => option,
        }
    }
}

/// Validated option values for one behavior or protocol.
///
/// Built from a schema, so every declared option is present with its declared
/// type. Overlays produce a new value and never mutate the original.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    values: BTreeMap<&'static str, OptionValue>,
}

impl Settings {
    /// Settings holding every default of `schema`.
    pub fn defaults(schema: &[OptionSpec]) -> Self {
        Self {
            values: schema.iter().map(|spec| (spec.name, spec.default)).collect(),
        }
    }

    /// Validate `raw` against `schema` and return these settings with it applied.
    pub fn overlay(
        &self,
        owner: &str,
        schema: &[OptionSpec],
        raw: &RawOptions,
    ) -> Result<Self, OptionError> {
        let mut next = self.clone();
        for (name, value) in raw {
            let spec = schema
                .iter()
                .find(|spec| spec.name == name)
                .ok_or_else(|| OptionError::Unknown {
                    owner: owner.to_string(),
                    option: name.clone(),
                    known: known_options(schema),
                })?;
            next.values.insert(spec.name, spec.coerce(owner, value)?);
        }
        Ok(next)
    }

    pub fn get(&self, name: &str) -> Option<OptionValue> {
        self.values.get(name).copied()
    }

    pub fn bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(OptionValue::Bool(true)))
    }

    pub fn int(&self, name: &str) -> i64 {
        match self.values.get(name) {
            Some(OptionValue::Int(v)) => *v,
            _ => 0,
        }
    }

    pub fn float(&self, name: &str) -> f64 {
        match self.values.get(name) {
            Some(OptionValue::Float(v)) => *v,
            Some(OptionValue::Int(v)) => *v as f64,
            _ => 0.0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, OptionValue)> + '_ {
        self.values.iter().map(|(name, value)| (*name, *value))
    }
}

fn known_options(schema: &[OptionSpec]) -> String {
    if schema.is_empty() {
        return "none".to_string();
    }
    schema
        .iter()
        .map(|spec| spec.name)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &[OptionSpec] = &[
        OptionSpec::new("sleep", "Delay in seconds", OptionValue::Float(1.0)).at_least(0.0),
        OptionSpec::new("before", "Delay before forwarding", OptionValue::Bool(true)),
        OptionSpec::new("warmup", "Calls before acting", OptionValue::Int(0)).at_least(0.0),
    ];

    fn raw(entries: &[(&str, RawValue)]) -> RawOptions {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_defaults_cover_schema() {
        let settings = Settings::defaults(SCHEMA);
        assert_eq!(settings.float("sleep"), 1.0);
        assert!(settings.bool("before"));
        assert_eq!(settings.int("warmup"), 0);
        assert_eq!(settings.iter().count(), 3);
    }

    #[test]
    fn test_overlay_does_not_mutate_base() {
        let base = Settings::defaults(SCHEMA);
        let next = base
            .overlay("delay", SCHEMA, &raw(&[("before", RawValue::Bool(false))]))
            .unwrap();

        assert!(base.bool("before"));
        assert!(!next.bool("before"));
    }

    #[test]
    fn test_int_widens_to_float() {
        let settings = Settings::defaults(SCHEMA)
            .overlay("delay", SCHEMA, &raw(&[("sleep", RawValue::Int(3))]))
            .unwrap();
        assert_eq!(settings.get("sleep"), Some(OptionValue::Float(3.0)));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = Settings::defaults(SCHEMA)
            .overlay("delay", SCHEMA, &raw(&[("nap", RawValue::Int(3))]))
            .unwrap_err();
        assert_eq!(err.option(), "nap");
        assert!(err.to_string().contains("sleep, before, warmup"));
    }

    #[test]
    fn test_truthy_strings_rejected() {
        let err = Settings::defaults(SCHEMA)
            .overlay(
                "delay",
                SCHEMA,
                &raw(&[("before", RawValue::Text("yes".to_string()))]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            OptionError::Type {
                expected: OptionKind::Bool,
                found: "string",
                ..
            }
        ));
    }

    #[test]
    fn test_float_not_narrowed_to_int() {
        let err = Settings::defaults(SCHEMA)
            .overlay("error", SCHEMA, &raw(&[("warmup", RawValue::Float(1.5))]))
            .unwrap_err();
        assert!(matches!(err, OptionError::Type { .. }));
    }

    #[test]
    fn test_range_checked() {
        let err = Settings::defaults(SCHEMA)
            .overlay("delay", SCHEMA, &raw(&[("sleep", RawValue::Float(-0.5))]))
            .unwrap_err();
        assert!(matches!(err, OptionError::Range { .. }));

        let err = Settings::defaults(SCHEMA)
            .overlay("delay", SCHEMA, &raw(&[("sleep", RawValue::Float(f64::NAN))]))
            .unwrap_err();
        assert!(matches!(
            err,
            OptionError::Type {
                found: "non-finite float",
                ..
            }
        ));
    }

    #[test]
    fn test_json_numbers() {
        assert_eq!(RawValue::from(&serde_json::json!(2)), RawValue::Int(2));
        assert_eq!(RawValue::from(&serde_json::json!(0.25)), RawValue::Float(0.25));
        assert_eq!(
            RawValue::from(&serde_json::json!(null)),
            RawValue::Other("null")
        );
    }
}
