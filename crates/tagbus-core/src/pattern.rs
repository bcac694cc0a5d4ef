//! Tag id matching for subscriptions and queries.
//!
//! Tag ids are dot-separated strings like "pump1.status". A subscription
//! names either one exact tag id or a pattern:
//!
//! - Exact: "pump1.status"
//! - Suffix wildcard: "pump1.*"
//! - Mid-path wildcard: "pump.*.status"
//! - Full wildcard: "*"
//! - Regular expression, written between slashes: "/^press[0-9]+$/"

use regex::Regex;

/// A segment in a wildcard pattern.
#[derive(Debug, Clone, PartialEq)]
enum PatternSegment {
    /// Exact literal match for this segment
    Literal(String),
    /// Matches exactly one segment when mid-path, or any suffix when at the end
    Wildcard,
}

/// Segment based glob over dotted tag ids.
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    raw: String,
    segments: Vec<PatternSegment>,
    /// True if the pattern ends with a wildcard (matches any suffix)
    trailing_wildcard: bool,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::EmptyPattern);
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(PatternError::EmptySegment(pattern.to_string()));
        }

        let segments: Vec<PatternSegment> = parts
            .iter()
            .map(|&s| {
                if s == "*" {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(s.to_string())
                }
            })
            .collect();

        Ok(Self {
            raw: pattern.to_string(),
            trailing_wildcard: segments.last() == Some(&PatternSegment::Wildcard),
            segments,
        })
    }

    pub fn matches(&self, id: &str) -> bool {
        let parts: Vec<&str> = id.split('.').collect();

        if self.segments.len() == 1 && self.trailing_wildcard {
            return true;
        }

        // A trailing wildcard needs at least one segment to stand for.
        if self.trailing_wildcard {
            if parts.len() < self.segments.len() {
                return false;
            }
        } else if parts.len() != self.segments.len() {
            return false;
        }

        self.segments
            .iter()
            .zip(parts.iter())
            .all(|(segment, part)| match segment {
                PatternSegment::Literal(lit) => lit == part,
                PatternSegment::Wildcard => !part.is_empty(),
            })
    }

    /// Literal segments before the first wildcard, joined with '.'.
    pub fn literal_prefix(&self) -> String {
        self.segments
            .iter()
            .map_while(|s| match s {
                PatternSegment::Literal(lit) => Some(lit.as_str()),
                PatternSegment::Wildcard => None,
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// What a subscription or query selects.
#[derive(Debug, Clone)]
pub enum TagMatcher {
    Exact(String),
    Wildcard(WildcardPattern),
    Regex(Regex),
}

impl TagMatcher {
    /// Parse a matcher string. See the module docs for the syntax.
    pub fn parse(s: &str) -> Result<Self, PatternError> {
        if s.is_empty() {
            return Err(PatternError::EmptyPattern);
        }
        if s.len() >= 2 && s.starts_with('/') && s.ends_with('/') {
            let body = &s[1..s.len() - 1];
            return Regex::new(body)
                .map(TagMatcher::Regex)
                .map_err(|e| PatternError::InvalidRegex(e.to_string()));
        }
        if s.split('.').any(|seg| seg == "*") {
            return WildcardPattern::new(s).map(TagMatcher::Wildcard);
        }
        Ok(TagMatcher::Exact(s.to_string()))
    }

    pub fn exact(id: impl Into<String>) -> Self {
        TagMatcher::Exact(id.into())
    }

    pub fn matches(&self, id: &str) -> bool {
        match self {
            TagMatcher::Exact(exact) => exact == id,
            TagMatcher::Wildcard(pattern) => pattern.matches(id),
            TagMatcher::Regex(re) => re.is_match(id),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, TagMatcher::Exact(_))
    }

    /// The matcher as it was written, regexes including their slashes.
    pub fn to_source(&self) -> String {
        match self {
            TagMatcher::Exact(id) => id.clone(),
            TagMatcher::Wildcard(pattern) => pattern.as_str().to_string(),
            TagMatcher::Regex(re) => format!("/{}/", re.as_str()),
        }
    }
}

/// Every dotted prefix of a tag id, shortest first, starting with "".
///
/// "a.b.c" yields "", "a", "a.b", "a.b.c".
pub fn id_prefixes(id: &str) -> impl Iterator<Item = &str> {
    std::iter::once("")
        .chain(id.match_indices('.').map(move |(i, _)| &id[..i]))
        .chain(std::iter::once(id))
}

/// Errors that can occur when parsing a matcher.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatternError {
    #[error("Empty pattern")]
    EmptyPattern,

    #[error("Empty segment in pattern '{0}'")]
    EmptySegment(String),

    #[error("Invalid regular expression: {0}")]
    InvalidRegex(String),
}
