//! Typed command parameters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParamError;

/// The declared type of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// One whitespace-delimited word.
    Str,
    /// A signed integer.
    Int,
    /// A floating point number.
    Float,
    /// `true`/`false`, `yes`/`no`, `on`/`off`, `1`/`0`.
    Bool,
    /// Everything that remains, joined by single spaces.
    Greedy,
}

impl ParamKind {
    fn name(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Greedy => "greedy str",
        }
    }

    fn convert(self, name: &str, raw: &str) -> Result<ParamValue, ParamError> {
        let mismatch = || ParamError::TypeMismatch {
            name: name.to_string(),
            expected: self.name(),
            value: raw.to_string(),
        };
        match self {
            Self::Str | Self::Greedy => Ok(ParamValue::Str(raw.to_string())),
            Self::Int => raw.parse().map(ParamValue::Int).map_err(|_| mismatch()),
            Self::Float => raw.parse().map(ParamValue::Float).map_err(|_| mismatch()),
            Self::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(ParamValue::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(ParamValue::Bool(false)),
                _ => Err(mismatch()),
            },
        }
    }
}

/// A converted parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Text.
    Str(String),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Boolean.
    Bool(bool),
}

impl ParamValue {
    /// Returns the text, for string values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer, for integer values.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name, used in error messages.
    pub name: String,
    /// Declared type.
    pub kind: ParamKind,
    /// Value used when the argument is omitted; `None` makes it required.
    #[serde(default)]
    pub default: Option<ParamValue>,
}

impl ParamSpec {
    /// Declares a required parameter.
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    /// Declares an optional parameter.
    pub fn optional(name: impl Into<String>, kind: ParamKind, default: ParamValue) -> Self {
        Self {
            name: name.into(),
            kind,
            default: Some(default),
        }
    }
}

/// The ordered parameter list of a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSchema(Vec<ParamSpec>);

impl ParamSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter.
    pub fn push(&mut self, spec: ParamSpec) {
        self.0.push(spec);
    }

    /// Returns the declared parameters.
    pub fn specs(&self) -> &[ParamSpec] {
        &self.0
    }

    /// Splits `args` on whitespace and converts each token to its declared type.
    ///
    /// Fails on a missing required argument or a token that does not convert.
    /// Tokens past the last declared parameter are ignored.
    pub fn parse(&self, args: &str) -> Result<Vec<ParamValue>, ParamError> {
        let tokens: Vec<&str> = args.split_whitespace().collect();
        let mut values = Vec::with_capacity(self.0.len());

        for (i, spec) in self.0.iter().enumerate() {
            if spec.kind == ParamKind::Greedy {
                let rest = tokens.get(i..).map(|t| t.join(" ")).unwrap_or_default();
                if rest.is_empty() {
                    values.push(Self::fallback(spec)?);
                } else {
                    values.push(ParamValue::Str(rest));
                }
                return Ok(values);
            }
            match tokens.get(i) {
                Some(raw) => values.push(spec.kind.convert(&spec.name, raw)?),
                None => values.push(Self::fallback(spec)?),
            }
        }
        Ok(values)
    }

    /// Like [`parse`](Self::parse), but surplus tokens are an error.
    pub fn parse_strict(&self, args: &str) -> Result<Vec<ParamValue>, ParamError> {
        let values = self.parse(args)?;
        let greedy = self.0.last().is_some_and(|s| s.kind == ParamKind::Greedy);
        let got = args.split_whitespace().count();
        if !greedy && got > self.0.len() {
            return Err(ParamError::TooMany {
                expected: self.0.len(),
                got,
            });
        }
        Ok(values)
    }

    fn fallback(spec: &ParamSpec) -> Result<ParamValue, ParamError> {
        spec.default.clone().ok_or_else(|| ParamError::Missing {
            name: spec.name.clone(),
        })
    }
}

impl FromIterator<ParamSpec> for ParamSchema {
    fn from_iter<I: IntoIterator<Item = ParamSpec>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ParamSchema {
        [
            ParamSpec::required("user", ParamKind::Int),
            ParamSpec::optional("days", ParamKind::Float, ParamValue::Float(1.0)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_parse_and_defaults() {
        let values = schema().parse("123").unwrap();
        assert_eq!(values, vec![ParamValue::Int(123), ParamValue::Float(1.0)]);

        let values = schema().parse("  123   2.5 ").unwrap();
        assert_eq!(values, vec![ParamValue::Int(123), ParamValue::Float(2.5)]);
    }

    #[test]
    fn test_fails_closed() {
        assert!(matches!(
            schema().parse(""),
            Err(ParamError::Missing { ref name }) if name == "user"
        ));
        assert!(matches!(
            schema().parse("abc"),
            Err(ParamError::TypeMismatch { expected: "int", .. })
        ));
        assert!(ParamSchema::new().parse("   ").unwrap().is_empty());
    }

    #[test]
    fn test_surplus_tokens() {
        let values = schema().parse("1 2 3").unwrap();
        assert_eq!(values, vec![ParamValue::Int(1), ParamValue::Float(2.0)]);
        assert!(ParamSchema::new().parse("extra words").unwrap().is_empty());

        assert!(matches!(
            schema().parse_strict("1 2 3"),
            Err(ParamError::TooMany { expected: 2, got: 3 })
        ));
        assert!(ParamSchema::new().parse_strict("extra").is_err());
        assert!(schema().parse_strict("1 2").is_ok());
    }

    #[test]
    fn test_greedy_takes_rest() {
        let schema: ParamSchema = [
            ParamSpec::required("city", ParamKind::Str),
            ParamSpec::required("note", ParamKind::Greedy),
        ]
        .into_iter()
        .collect();
        let values = schema.parse("paris bring   an umbrella").unwrap();
        assert_eq!(values[1], ParamValue::Str("bring an umbrella".into()));
        assert!(schema.parse("paris").is_err());
    }

    #[test]
    fn test_bool_spellings() {
        let schema: ParamSchema = [ParamSpec::required("on", ParamKind::Bool)].into_iter().collect();
        assert_eq!(schema.parse("YES").unwrap(), vec![ParamValue::Bool(true)]);
        assert_eq!(schema.parse("0").unwrap(), vec![ParamValue::Bool(false)]);
        assert!(schema.parse("maybe").is_err());
    }
}
