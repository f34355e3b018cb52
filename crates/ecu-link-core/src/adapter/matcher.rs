//! Response matching
//!
//! A [`ResponseMatcher`] decides whether a response line is the one a command
//! expects and optionally extracts a value from it.

use regex::Regex;

use crate::protocol::ProtocolError;

/// Match a response line and extract a value from it
pub trait ResponseMatcher: Send + Sync {
    /// `Some(value)` if the line matches; the value is the captured part when
    /// the matcher captures one, otherwise the matched text
    fn match_line(&self, line: &str) -> Option<String>;
}

impl<F> ResponseMatcher for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn match_line(&self, line: &str) -> Option<String> {
        self(line)
    }
}

/// Regular-expression matcher: returns capture group 1 if the pattern has one
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    regex: Regex,
}

impl RegexMatcher {
    /// Compile `pattern`
    pub fn new(pattern: &str) -> Result<Self, ProtocolError> {
        let regex = Regex::new(pattern)
            .map_err(|e| ProtocolError::ConfigError(format!("bad pattern {:?}: {}", pattern, e)))?;
        Ok(Self { regex })
    }

    /// Adapter identification banner, e.g. `ELM327 v1.5`
    pub fn elm_version() -> Self {
        Self::from(elm_version_regex())
    }

    /// Battery voltage report, capturing the number in front of `V`
    pub fn voltage() -> Self {
        Self::from(voltage_regex())
    }
}

impl From<Regex> for RegexMatcher {
    fn from(regex: Regex) -> Self {
        Self { regex }
    }
}

impl ResponseMatcher for RegexMatcher {
    fn match_line(&self, line: &str) -> Option<String> {
        let captures = self.regex.captures(line)?;
        let value = captures.get(1).or_else(|| captures.get(0))?;
        Some(value.as_str().to_string())
    }
}

fn elm_version_regex() -> Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"ELM327 v[0-9]+\.[0-9]+").expect("static pattern"))
        .clone()
}

fn voltage_regex() -> Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([0-9.]+)V").expect("static pattern"))
        .clone()
}

/// Matches lines containing a fixed text; yields that text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Literal(pub String);

impl Literal {
    /// Matcher for `text`
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The adapter's acknowledgement
    pub fn ok() -> Self {
        Self::new("OK")
    }
}

impl ResponseMatcher for Literal {
    fn match_line(&self, line: &str) -> Option<String> {
        line.contains(self.0.as_str()).then(|| self.0.clone())
    }
}

/// Matches lines starting with a prefix; yields the whole line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix(pub String);

impl Prefix {
    /// Matcher for lines starting with `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }
}

impl ResponseMatcher for Prefix {
    fn match_line(&self, line: &str) -> Option<String> {
        line.starts_with(self.0.as_str()).then(|| line.to_string())
    }
}
