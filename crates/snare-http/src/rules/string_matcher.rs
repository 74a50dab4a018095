//! String matching operators used by header, query and body matchers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// String matching operator.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum StringMatcher {
    /// Exact string equality
    Equals(String),

    /// String contains substring
    Contains(String),

    /// String starts with prefix
    StartsWith(String),

    /// String ends with suffix
    EndsWith(String),

    /// Regex pattern match
    Matches(String),

    /// Field existence check (value is whether field should exist)
    Exists(bool),
}

impl StringMatcher {
    /// Short human-readable form, used in rule explanations.
    pub fn explain(&self) -> String {
        match self {
            StringMatcher::Equals(v) => format!("= {v:?}"),
            StringMatcher::Contains(v) => format!("containing {v:?}"),
            StringMatcher::StartsWith(v) => format!("starting with {v:?}"),
            StringMatcher::EndsWith(v) => format!("ending with {v:?}"),
            StringMatcher::Matches(v) => format!("matching /{v}/"),
            StringMatcher::Exists(true) => "present".to_string(),
            StringMatcher::Exists(false) => "absent".to_string(),
        }
    }
}

/// Compiled string matcher for runtime evaluation.
#[derive(Debug, Clone)]
pub enum CompiledStringMatcher {
    Equals(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Matches(Arc<Regex>),
    Exists(bool),
}

impl CompiledStringMatcher {
    /// Compile a StringMatcher, building any regex up front.
    pub fn compile(matcher: &StringMatcher) -> Result<Self, regex::Error> {
        Ok(match matcher {
            StringMatcher::Equals(v) => CompiledStringMatcher::Equals(v.clone()),
            StringMatcher::Contains(v) => CompiledStringMatcher::Contains(v.clone()),
            StringMatcher::StartsWith(v) => CompiledStringMatcher::StartsWith(v.clone()),
            StringMatcher::EndsWith(v) => CompiledStringMatcher::EndsWith(v.clone()),
            StringMatcher::Matches(pattern) => {
                CompiledStringMatcher::Matches(Arc::new(Regex::new(pattern)?))
            }
            StringMatcher::Exists(exists) => CompiledStringMatcher::Exists(*exists),
        })
    }

    /// Check if a value matches. Comparison is case-sensitive; a regex may
    /// opt out with `(?i)`.
    ///
    /// `value` is `None` when the field doesn't exist; only `Exists(false)`
    /// accepts that.
    pub fn matches(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (CompiledStringMatcher::Exists(should_exist), v) => *should_exist == v.is_some(),
            (_, None) => false,
            (CompiledStringMatcher::Equals(expected), Some(v)) => v == expected,
            (CompiledStringMatcher::Contains(needle), Some(v)) => v.contains(needle.as_str()),
            (CompiledStringMatcher::StartsWith(prefix), Some(v)) => v.starts_with(prefix.as_str()),
            (CompiledStringMatcher::EndsWith(suffix), Some(v)) => v.ends_with(suffix.as_str()),
            (CompiledStringMatcher::Matches(regex), Some(v)) => regex.is_match(v),
        }
    }
}
