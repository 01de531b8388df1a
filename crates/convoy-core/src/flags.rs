//! Inclusion flags and the predicates declarations gate on.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A boolean or enumerated toggle supplied from outside the graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

impl FlagValue {
    /// `true`/`false` become booleans, anything else stays text.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Text(s) => !s.is_empty() && s != "false",
        }
    }

    /// Compares by rendered value so `true` matches `"true"`.
    pub fn matches(&self, other: &FlagValue) -> bool {
        self.to_string() == other.to_string()
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(BTreeMap<String, FlagValue>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: FlagValue) {
        self.0.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: FlagValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FlagValue> {
        self.0.get(name)
    }

    /// Parse a `name=value` assignment as given on the command line.
    pub fn parse_assignment(raw: &str) -> Result<(String, FlagValue)> {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| Error::InvalidFlag(format!("expected name=value, got '{}'", raw)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidFlag(format!("empty flag name in '{}'", raw)));
        }
        Ok((name.to_string(), FlagValue::parse(value)))
    }

    /// Overlay `other` on top of `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: &Flags) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FlagValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Inclusion predicate attached to a declaration's `when` field.
///
/// ```yaml
/// when: { flag: enterprise }
/// when: { flag: ingressClass, equals: public }
/// when: { all: [ { flag: enterprise }, { not: { flag: airgapped } } ] }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    Flag {
        flag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        equals: Option<FlagValue>,
    },
    Not {
        not: Box<Predicate>,
    },
    All {
        all: Vec<Predicate>,
    },
    Any {
        any: Vec<Predicate>,
    },
}

impl Predicate {
    pub fn flag(name: impl Into<String>) -> Self {
        Self::Flag {
            flag: name.into(),
            equals: None,
        }
    }

    pub fn equals(name: impl Into<String>, value: FlagValue) -> Self {
        Self::Flag {
            flag: name.into(),
            equals: Some(value),
        }
    }

    /// Unset flags are falsy and equal nothing.
    pub fn evaluate(&self, flags: &Flags) -> bool {
        match self {
            Self::Flag { flag, equals: None } => {
                flags.get(flag).map(FlagValue::is_truthy).unwrap_or(false)
            }
            Self::Flag {
                flag,
                equals: Some(expected),
            } => flags.get(flag).map(|v| v.matches(expected)).unwrap_or(false),
            Self::Not { not } => !not.evaluate(flags),
            Self::All { all } => all.iter().all(|p| p.evaluate(flags)),
            Self::Any { any } => any.iter().any(|p| p.evaluate(flags)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag { flag, equals: None } => write!(f, "{}", flag),
            Self::Flag {
                flag,
                equals: Some(v),
            } => write!(f, "{}=={}", flag, v),
            Self::Not { not } => write!(f, "!({})", not),
            Self::All { all } => {
                let parts: Vec<String> = all.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(" && "))
            }
            Self::Any { any } => {
                let parts: Vec<String> = any.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(" || "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> Flags {
        Flags::new()
            .with("enterprise", FlagValue::Bool(true))
            .with("ingressClass", FlagValue::Text("public".into()))
            .with("airgapped", FlagValue::Bool(false))
    }

    #[test]
    fn flag_truthiness() {
        let f = flags();
        assert!(Predicate::flag("enterprise").evaluate(&f));
        assert!(!Predicate::flag("airgapped").evaluate(&f));
        assert!(!Predicate::flag("missing").evaluate(&f));
    }

    #[test]
    fn equality_compares_rendered_values() {
        let f = flags();
        assert!(Predicate::equals("ingressClass", FlagValue::Text("public".into())).evaluate(&f));
        assert!(Predicate::equals("enterprise", FlagValue::Text("true".into())).evaluate(&f));
        assert!(!Predicate::equals("ingressClass", FlagValue::Text("default".into())).evaluate(&f));
        assert!(!Predicate::equals("missing", FlagValue::Bool(false)).evaluate(&f));
    }

    #[test]
    fn combinators() {
        let f = flags();
        let p = Predicate::All {
            all: vec![
                Predicate::flag("enterprise"),
                Predicate::Not {
                    not: Box::new(Predicate::flag("airgapped")),
                },
            ],
        };
        assert!(p.evaluate(&f));
        let q = Predicate::Any {
            any: vec![Predicate::flag("missing"), Predicate::flag("airgapped")],
        };
        assert!(!q.evaluate(&f));
    }

    #[test]
    fn predicate_yaml_forms() {
        let p: Predicate = serde_yaml::from_str("{ flag: enterprise }").unwrap();
        assert_eq!(p, Predicate::flag("enterprise"));
        let p: Predicate = serde_yaml::from_str("{ flag: ingressClass, equals: public }").unwrap();
        assert_eq!(
            p,
            Predicate::equals("ingressClass", FlagValue::Text("public".into()))
        );
        let p: Predicate = serde_yaml::from_str("{ not: { flag: airgapped } }").unwrap();
        assert!(p.evaluate(&flags()));
    }

    #[test]
    fn parse_assignment() {
        let (k, v) = Flags::parse_assignment("enableR2=false").unwrap();
        assert_eq!(k, "enableR2");
        assert_eq!(v, FlagValue::Bool(false));
        let (_, v) = Flags::parse_assignment("class=public").unwrap();
        assert_eq!(v, FlagValue::Text("public".into()));
        assert!(Flags::parse_assignment("novalue").is_err());
        assert!(Flags::parse_assignment("=x").is_err());
    }
}
