//! Typed, revision-counted filter parameters.

use crate::error::FilterError;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    Path(PathBuf),
    FloatList(Vec<f64>),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Float(_) => "float",
            ParameterValue::Int(_) => "integer",
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Text(_) => "text",
            ParameterValue::Path(_) => "path",
            ParameterValue::FloatList(_) => "float list",
        }
    }

    fn same_type(&self, other: &ParameterValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Parse `text` as a value of the same type as `self`.
    fn parse_like(&self, text: &str) -> Result<ParameterValue, String> {
        let text = text.trim();
        Ok(match self {
            ParameterValue::Float(_) => ParameterValue::Float(parse_float(text)?),
            ParameterValue::Int(_) => {
                ParameterValue::Int(text.parse().map_err(|e| format!("'{}': {}", text, e))?)
            }
            ParameterValue::Bool(_) => match text.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => ParameterValue::Bool(true),
                "false" | "no" | "off" | "0" => ParameterValue::Bool(false),
                _ => return Err(format!("'{}' is not a boolean", text)),
            },
            ParameterValue::Text(_) => ParameterValue::Text(text.to_string()),
            ParameterValue::Path(_) => ParameterValue::Path(PathBuf::from(text)),
            ParameterValue::FloatList(_) => ParameterValue::FloatList(
                text.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(parse_float)
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Text(v) => write!(f, "{}", v),
            ParameterValue::Path(v) => write!(f, "{}", v.display()),
            ParameterValue::FloatList(v) => {
                let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

/// Accepts plain numbers and SI-prefixed ones such as `2.5M` or `10k`.
fn parse_float(text: &str) -> Result<f64, String> {
    let text = text.trim();
    let (number, scale) = match text.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() && c != 'e' && c != 'E' => {
            let scale = match c {
                'f' => 1e-15,
                'p' => 1e-12,
                'n' => 1e-9,
                'u' => 1e-6,
                'm' => 1e-3,
                'k' => 1e3,
                'M' => 1e6,
                'G' => 1e9,
                'T' => 1e12,
                _ => return Err(format!("unknown suffix '{}' in '{}'", c, text)),
            };
            (&text[..i], scale)
        }
        _ => (text, 1.0),
    };
    number
        .trim()
        .parse::<f64>()
        .map(|v| v * scale)
        .map_err(|e| format!("'{}': {}", text, e))
}

/// One named parameter with its unit and change counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    value: ParameterValue,
    unit: &'static str,
    revision: u64,
}

impl Parameter {
    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn unit(&self) -> &'static str {
        self.unit
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// A filter's parameters, keyed by name.
///
/// The set-level revision changes whenever any parameter takes a new value;
/// the executor compares it against the value seen at the last run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    params: BTreeMap<String, Parameter>,
    revision: u64,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter with its default value. Used by filter constructors.
    pub fn declare(mut self, name: &str, value: ParameterValue, unit: &'static str) -> Self {
        self.params.insert(
            name.to_string(),
            Parameter {
                value,
                unit,
                revision: 0,
            },
        );
        self
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Assign a new value. The type must match the declared one. Setting the
    /// current value again does not count as a change.
    pub fn set(&mut self, name: &str, value: ParameterValue) -> Result<(), FilterError> {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| FilterError::UnknownParameter(name.to_string()))?;
        if !param.value.same_type(&value) {
            return Err(FilterError::BadParameter {
                name: name.to_string(),
                reason: format!(
                    "expected {}, got {}",
                    param.value.type_name(),
                    value.type_name()
                ),
            });
        }
        if param.value != value {
            param.value = value;
            param.revision += 1;
            self.revision += 1;
        }
        Ok(())
    }

    /// Parse `text` according to the parameter's declared type and assign it.
    pub fn parse_and_set(&mut self, name: &str, text: &str) -> Result<(), FilterError> {
        let current = self
            .params
            .get(name)
            .ok_or_else(|| FilterError::UnknownParameter(name.to_string()))?;
        let value = current
            .value
            .parse_like(text)
            .map_err(|reason| FilterError::BadParameter {
                name: name.to_string(),
                reason,
            })?;
        self.set(name, value)
    }

    fn lookup(&self, name: &str) -> Result<&ParameterValue, FilterError> {
        self.params
            .get(name)
            .map(|p| &p.value)
            .ok_or_else(|| FilterError::UnknownParameter(name.to_string()))
    }

    fn mismatch(name: &str, expected: &str, got: &ParameterValue) -> FilterError {
        FilterError::BadParameter {
            name: name.to_string(),
            reason: format!("expected {}, got {}", expected, got.type_name()),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, FilterError> {
        match self.lookup(name)? {
            ParameterValue::Float(v) => Ok(*v),
            ParameterValue::Int(v) => Ok(*v as f64),
            other => Err(Self::mismatch(name, "float", other)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, FilterError> {
        match self.lookup(name)? {
            ParameterValue::Int(v) => Ok(*v),
            other => Err(Self::mismatch(name, "integer", other)),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool, FilterError> {
        match self.lookup(name)? {
            ParameterValue::Bool(v) => Ok(*v),
            other => Err(Self::mismatch(name, "bool", other)),
        }
    }

    pub fn text(&self, name: &str) -> Result<&str, FilterError> {
        match self.lookup(name)? {
            ParameterValue::Text(v) => Ok(v),
            other => Err(Self::mismatch(name, "text", other)),
        }
    }

    pub fn path(&self, name: &str) -> Result<&Path, FilterError> {
        match self.lookup(name)? {
            ParameterValue::Path(v) => Ok(v),
            other => Err(Self::mismatch(name, "path", other)),
        }
    }

    pub fn float_list(&self, name: &str) -> Result<&[f64], FilterError> {
        match self.lookup(name)? {
            ParameterValue::FloatList(v) => Ok(v),
            other => Err(Self::mismatch(name, "float list", other)),
        }
    }
}
