//! Authorization scopes: `Kind:Value` segments joined by `/`, e.g.
//! `Office:Cleveland` or `Office:Cleveland/Floor:3`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("scope is empty")]
    Empty,
    #[error("malformed scope segment `{0}` (expected Kind:Value)")]
    MalformedSegment(String),
}

/// A parsed scope in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    canonical: String,
    segments: Vec<(String, String)>,
}

impl Scope {
    pub fn parse(source: &str) -> Result<Self, ScopeError> {
        if source.trim().is_empty() {
            return Err(ScopeError::Empty);
        }
        let segments = source
            .split('/')
            .map(parse_segment)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_segments(segments))
    }

    pub fn new(kind: &str, value: &str) -> Result<Self, ScopeError> {
        Self::parse(&format!("{}:{}", kind, value))
    }

    /// A narrower scope nested under this one.
    pub fn child(&self, kind: &str, value: &str) -> Result<Self, ScopeError> {
        let mut segments = self.segments.clone();
        segments.push(parse_segment(&format!("{}:{}", kind, value))?);
        Ok(Self::from_segments(segments))
    }

    fn from_segments(segments: Vec<(String, String)>) -> Self {
        let canonical = segments
            .iter()
            .map(|(kind, value)| format!("{}:{}", kind, value))
            .collect::<Vec<_>>()
            .join("/");
        Scope {
            canonical,
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn segments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.segments.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether a grant on this scope covers a request for `requested`.
    pub fn covers(&self, requested: &Scope, matching: ScopeMatching) -> bool {
        match matching {
            ScopeMatching::Exact => self == requested,
            ScopeMatching::Hierarchical => {
                self.segments.len() <= requested.segments.len()
                    && self
                        .segments
                        .iter()
                        .zip(&requested.segments)
                        .all(|(granted, asked)| granted == asked)
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

fn parse_segment(segment: &str) -> Result<(String, String), ScopeError> {
    let malformed = || ScopeError::MalformedSegment(segment.to_string());
    let (kind, value) = segment.split_once(':').ok_or_else(malformed)?;
    let kind_ok = kind.chars().next().map_or(false, |c| c.is_ascii_alphabetic())
        && kind.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    let value_ok = !value.is_empty()
        && value.trim() == value
        && !value.contains(':')
        && !value.chars().any(char::is_control);
    if kind_ok && value_ok {
        Ok((kind.to_string(), value.to_string()))
    } else {
        Err(malformed())
    }
}

/// How an assignment's scope is matched against a requested scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMatching {
    /// The assignment scope must equal the requested scope.
    #[default]
    Exact,
    /// The assignment scope also covers every scope nested under it.
    Hierarchical,
}

/// Request context supplied by the calling gate.
///
/// The scope stays a raw string here so a malformed value reaches the
/// evaluator and is denied there. `now` is required by assignments that
/// expire; the evaluator never reads a clock itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeContext {
    scope: Option<String>,
    now: Option<DateTime<Utc>>,
}

impl ScopeContext {
    /// A request not tied to any scope. Only unscoped grants cover it.
    pub fn global() -> Self {
        Self::default()
    }

    pub fn scoped(scope: impl Into<String>) -> Self {
        ScopeContext {
            scope: Some(scope.into()),
            now: None,
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.now
    }
}

impl From<&Scope> for ScopeContext {
    fn from(scope: &Scope) -> Self {
        ScopeContext::scoped(scope.as_str())
    }
}
