//! Label and field selectors.
//!
//! A selector is a conjunction of `key=value` / `key==value` / `key!=value`
//! terms separated by commas.  The empty selector matches everything.  The
//! same grammar is used for label selectors (matched against an object's
//! labels) and field selectors (matched against [`Object::fields`]).
//!
//! [`Object::fields`]: crate::api::Object::fields

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while parsing a selector string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("invalid selector term {0:?}: expected key=value, key==value or key!=value")]
    InvalidTerm(String),

    #[error("selector term {0:?} has an empty key")]
    EmptyKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    key: String,
    op: Operator,
    value: String,
}

impl Requirement {
    fn matches(&self, set: &BTreeMap<String, String>) -> bool {
        let actual = set.get(&self.key).map(String::as_str);
        match self.op {
            Operator::Equals => actual == Some(self.value.as_str()),
            // An absent key satisfies `!=`.
            Operator::NotEquals => actual != Some(self.value.as_str()),
        }
    }
}

/// A conjunctive predicate over a string-keyed set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// The selector that matches every set.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parse a selector string.  Whitespace around terms is ignored.
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for term in input.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let (key, op, value) = if let Some((k, v)) = term.split_once("!=") {
                (k, Operator::NotEquals, v)
            } else if let Some((k, v)) = term.split_once("==") {
                (k, Operator::Equals, v)
            } else if let Some((k, v)) = term.split_once('=') {
                (k, Operator::Equals, v)
            } else {
                return Err(SelectorError::InvalidTerm(term.to_string()));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(SelectorError::EmptyKey(term.to_string()));
            }
            requirements.push(Requirement {
                key: key.to_string(),
                op,
                value: value.trim().to_string(),
            });
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// True when every requirement holds for `set`.
    pub fn matches(&self, set: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(set))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Selector::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            let op = match r.op {
                Operator::Equals => "=",
                Operator::NotEquals => "!=",
            };
            write!(f, "{}{}{}", r.key, op, r.value)?;
        }
        Ok(())
    }
}
