// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Kubernetes label selector parsing, matching and composition
//!
//! Implements the textual label selector grammar accepted by the API server:
//!
//! - Equality: `env=prod`, `env==prod`, `env!=prod`
//! - Set based: `env in (prod,staging)`, `env notin (dev)`
//! - Existence: `env`, `!env`
//! - Numeric: `replicas>1`, `replicas<5`
//!
//! Requirements are joined with `,` and all of them must hold for an object to match.
//!
//! [`compose`] is the hook every cache group runs before issuing a list or watch:
//! it merges whatever selector the request already carries with the group's
//! mandatory requirements, so neither side can drop the other's constraints.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Maximum length of a label name and of a label value
const MAX_NAME_LENGTH: usize = 63;

/// Maximum length of the DNS subdomain prefix of a label key
const MAX_PREFIX_LENGTH: usize = 253;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").unwrap());

static DNS_SUBDOMAIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Errors produced while parsing or constructing label selectors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid label key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid label value {value:?} for key {key:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("operator '{operator}' on key {key:?} {reason}")]
    InvalidValueCount {
        key: String,
        operator: Operator,
        reason: &'static str,
    },

    #[error("unexpected {found} at position {position}, expected {expected}")]
    Syntax {
        position: usize,
        found: String,
        expected: &'static str,
    },
}

/// Relationship between a label key and a set of values
///
/// The declaration order is the canonical ordering used when two requirements
/// share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    /// `key=value` (`key==value` parses to this as well)
    Equals,
    /// `key!=value`
    NotEquals,
    /// `key in (a,b)`
    In,
    /// `key notin (a,b)`
    NotIn,
    /// `key`
    Exists,
    /// `!key`
    DoesNotExist,
    /// `key>N`
    GreaterThan,
    /// `key<N`
    LessThan,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Equals => "=",
            Self::NotEquals => "!=",
            Self::In => "in",
            Self::NotIn => "notin",
            Self::Exists => "exists",
            Self::DoesNotExist => "!",
            Self::GreaterThan => ">",
            Self::LessThan => "<",
        };
        f.write_str(symbol)
    }
}

/// One constraint an object's labels must satisfy
///
/// Immutable once built; every constructor validates the key, the values and
/// the number of values the operator takes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelRequirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl LabelRequirement {
    /// Build a requirement, validating it the same way the API server does
    pub fn new<I, S>(key: &str, operator: Operator, values: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_key(key)?;
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();

        let count_error = |reason| SelectorError::InvalidValueCount {
            key: key.to_string(),
            operator,
            reason,
        };

        match operator {
            Operator::Equals | Operator::NotEquals => {
                if values.len() != 1 {
                    return Err(count_error("requires exactly one value"));
                }
            }
            Operator::In | Operator::NotIn => {
                if values.is_empty() {
                    return Err(count_error("requires at least one value"));
                }
            }
            Operator::Exists | Operator::DoesNotExist => {
                if !values.is_empty() {
                    return Err(count_error("does not take values"));
                }
            }
            Operator::GreaterThan | Operator::LessThan => {
                if values.len() != 1 {
                    return Err(count_error("requires exactly one value"));
                }
                for value in &values {
                    if value.parse::<i64>().is_err() {
                        return Err(SelectorError::InvalidValue {
                            key: key.to_string(),
                            value: value.clone(),
                            reason: format!("operator '{}' requires an integer", operator),
                        });
                    }
                }
            }
        }

        if !matches!(operator, Operator::GreaterThan | Operator::LessThan) {
            for value in &values {
                validate_value(key, value)?;
            }
        }

        Ok(Self {
            key: key.to_string(),
            operator,
            values,
        })
    }

    pub fn equals(key: &str, value: &str) -> Result<Self, SelectorError> {
        Self::new(key, Operator::Equals, [value])
    }

    pub fn not_equals(key: &str, value: &str) -> Result<Self, SelectorError> {
        Self::new(key, Operator::NotEquals, [value])
    }

    pub fn in_set<I, S>(key: &str, values: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(key, Operator::In, values)
    }

    pub fn not_in_set<I, S>(key: &str, values: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(key, Operator::NotIn, values)
    }

    pub fn exists(key: &str) -> Result<Self, SelectorError> {
        Self::new(key, Operator::Exists, Vec::<String>::new())
    }

    pub fn does_not_exist(key: &str) -> Result<Self, SelectorError> {
        Self::new(key, Operator::DoesNotExist, Vec::<String>::new())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// Values in sorted order
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    /// Check whether a label set satisfies this requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => value.is_some_and(|v| self.values.contains(v)),
            Operator::NotEquals | Operator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
            Operator::GreaterThan | Operator::LessThan => {
                let (Some(actual), Some(bound)) = (
                    value.and_then(|v| v.parse::<i64>().ok()),
                    self.values.first().and_then(|v| v.parse::<i64>().ok()),
                ) else {
                    return false;
                };
                if self.operator == Operator::GreaterThan {
                    actual > bound
                } else {
                    actual < bound
                }
            }
        }
    }
}

impl fmt::Display for LabelRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, joined()),
            Operator::NotEquals => write!(f, "{}!={}", self.key, joined()),
            Operator::In => write!(f, "{} in ({})", self.key, joined()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, joined()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::GreaterThan => write!(f, "{}>{}", self.key, joined()),
            Operator::LessThan => write!(f, "{}<{}", self.key, joined()),
        }
    }
}

/// A conjunction of label requirements
///
/// Requirements are kept sorted and de-duplicated, so the textual form is
/// canonical: two selectors with the same requirements always render the same
/// string regardless of the order they were written in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: BTreeSet<LabelRequirement>,
}

impl LabelSelector {
    /// Selector that matches everything
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parse a textual selector; empty or whitespace-only text yields [`LabelSelector::everything`]
    pub fn parse(text: &str) -> Result<Self, SelectorError> {
        Ok(Self::from_requirements(parse_requirements(text)?))
    }

    pub fn from_requirements<I>(requirements: I) -> Self
    where
        I: IntoIterator<Item = LabelRequirement>,
    {
        Self {
            requirements: requirements.into_iter().collect(),
        }
    }

    /// Add requirements to this selector
    pub fn with<I>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = LabelRequirement>,
    {
        self.requirements.extend(requirements);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> impl Iterator<Item = &LabelRequirement> {
        self.requirements.iter()
    }

    /// Check whether a label set satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| req.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, req) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", req)?;
        }
        Ok(())
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Merge an outgoing request's selector with mandatory requirements
///
/// A selector that fails to parse is logged and dropped; the result then carries
/// only the mandatory requirements. The output is canonical, so applying the same
/// mandatory set repeatedly yields the same text.
pub fn compose(existing: &str, mandatory: &[LabelRequirement]) -> String {
    let base = match LabelSelector::parse(existing) {
        Ok(selector) => selector,
        Err(e) => {
            warn!(
                selector = %existing,
                error = %e,
                "Failed to parse label selector, using mandatory requirements only"
            );
            LabelSelector::everything()
        }
    };

    base.with(mandatory.iter().cloned()).to_string()
}

/// Parse a textual selector into its requirements
pub fn parse_requirements(text: &str) -> Result<Vec<LabelRequirement>, SelectorError> {
    let tokens = tokenize(text)?;
    Parser {
        tokens: &tokens,
        pos: 0,
        end: text.len(),
    }
    .parse()
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = |reason: String| SelectorError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() {
                return Err(invalid("prefix part must be non-empty".to_string()));
            }
            if prefix.len() > MAX_PREFIX_LENGTH {
                return Err(invalid(format!(
                    "prefix part must be no more than {} characters",
                    MAX_PREFIX_LENGTH
                )));
            }
            if !DNS_SUBDOMAIN_PATTERN.is_match(prefix) {
                return Err(invalid(
                    "prefix part must be a lowercase RFC 1123 subdomain".to_string(),
                ));
            }
            name
        }
        None => key,
    };

    if name.is_empty() {
        return Err(invalid("name part must be non-empty".to_string()));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(invalid(format!(
            "name part must be no more than {} characters",
            MAX_NAME_LENGTH
        )));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(invalid(
            "name part must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    let invalid = |reason: String| SelectorError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };

    // Empty values are legal
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(invalid(format!(
            "must be no more than {} characters",
            MAX_NAME_LENGTH
        )));
    }
    if !NAME_PATTERN.is_match(value) {
        return Err(invalid(
            "must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character"
                .to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Identifier(String),
    In,
    NotIn,
    Equals,
    DoubleEquals,
    NotEquals,
    Bang,
    GreaterThan,
    LessThan,
    OpenParen,
    CloseParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Identifier(s) => format!("identifier '{}'", s),
            Self::In => "'in'".to_string(),
            Self::NotIn => "'notin'".to_string(),
            Self::Equals => "'='".to_string(),
            Self::DoubleEquals => "'=='".to_string(),
            Self::NotEquals => "'!='".to_string(),
            Self::Bang => "'!'".to_string(),
            Self::GreaterThan => "'>'".to_string(),
            Self::LessThan => "'<'".to_string(),
            Self::OpenParen => "'('".to_string(),
            Self::CloseParen => "')'".to_string(),
            Self::Comma => "','".to_string(),
        }
    }

    /// Text of tokens that may stand in for a value after `=`, `!=` etc.
    fn as_value(&self) -> Option<&str> {
        match self {
            Self::Identifier(s) => Some(s),
            Self::In => Some("in"),
            Self::NotIn => Some("notin"),
            _ => None,
        }
    }
}

fn is_special(c: char) -> bool {
    matches!(c, '=' | '!' | '(' | ')' | ',' | '<' | '>')
}

/// Split selector text into (byte offset, token) pairs
fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, SelectorError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if is_special(c) {
            chars.next();
            let next_is_eq = matches!(chars.peek(), Some(&(_, '=')));
            let token = match c {
                '=' if next_is_eq => {
                    chars.next();
                    Token::DoubleEquals
                }
                '=' => Token::Equals,
                '!' if next_is_eq => {
                    chars.next();
                    Token::NotEquals
                }
                '!' => Token::Bang,
                '(' => Token::OpenParen,
                ')' => Token::CloseParen,
                ',' => Token::Comma,
                '<' => Token::LessThan,
                '>' => Token::GreaterThan,
                _ => {
                    return Err(SelectorError::Syntax {
                        position: pos,
                        found: format!("'{}'", c),
                        expected: "a selector token",
                    });
                }
            };
            tokens.push((pos, token));
            continue;
        }

        let mut word = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if c.is_whitespace() || is_special(c) {
                break;
            }
            word.push(c);
            chars.next();
        }
        let token = match word.as_str() {
            "in" => Token::In,
            "notin" => Token::NotIn,
            _ => Token::Identifier(word),
        };
        tokens.push((pos, token));
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [(usize, Token)],
    pos: usize,
    /// Byte length of the input, reported as the position of end-of-input errors
    end: usize,
}

impl Parser<'_> {
    fn parse(mut self) -> Result<Vec<LabelRequirement>, SelectorError> {
        let mut requirements = Vec::new();
        if self.tokens.is_empty() {
            return Ok(requirements);
        }

        loop {
            requirements.push(self.parse_requirement()?);
            match self.next() {
                None => return Ok(requirements),
                Some((_, Token::Comma)) => {}
                Some((position, token)) => {
                    return Err(SelectorError::Syntax {
                        position,
                        found: token.describe(),
                        expected: "',' or end of selector",
                    });
                }
            }
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn unexpected(&self, item: Option<(usize, Token)>, expected: &'static str) -> SelectorError {
        match item {
            Some((position, token)) => SelectorError::Syntax {
                position,
                found: token.describe(),
                expected,
            },
            None => SelectorError::Syntax {
                position: self.end,
                found: "end of selector".to_string(),
                expected,
            },
        }
    }

    fn expect_identifier(&mut self, expected: &'static str) -> Result<String, SelectorError> {
        match self.next() {
            Some((_, Token::Identifier(s))) => Ok(s),
            other => Err(self.unexpected(other, expected)),
        }
    }

    fn parse_requirement(&mut self) -> Result<LabelRequirement, SelectorError> {
        if self.peek() == Some(&Token::Bang) {
            self.next();
            let key = self.expect_identifier("label key after '!'")?;
            return LabelRequirement::does_not_exist(&key);
        }

        let key = self.expect_identifier("label key")?;

        let operator = match self.peek() {
            None | Some(Token::Comma) => return LabelRequirement::exists(&key),
            Some(Token::Equals | Token::DoubleEquals) => Operator::Equals,
            Some(Token::NotEquals) => Operator::NotEquals,
            Some(Token::GreaterThan) => Operator::GreaterThan,
            Some(Token::LessThan) => Operator::LessThan,
            Some(Token::In) => Operator::In,
            Some(Token::NotIn) => Operator::NotIn,
            Some(_) => {
                let item = self.next();
                return Err(self.unexpected(item, "operator"));
            }
        };
        self.next();

        match operator {
            Operator::In | Operator::NotIn => {
                let values = self.parse_value_set()?;
                LabelRequirement::new(&key, operator, values)
            }
            _ => {
                let value = self.parse_exact_value()?;
                LabelRequirement::new(&key, operator, [value])
            }
        }
    }

    /// Value after `=`, `==`, `!=`, `>` or `<`; may be empty
    fn parse_exact_value(&mut self) -> Result<String, SelectorError> {
        match self.peek() {
            None | Some(Token::Comma) => Ok(String::new()),
            Some(token) => match token.as_value() {
                Some(value) => {
                    let value = value.to_string();
                    self.next();
                    Ok(value)
                }
                None => {
                    let item = self.next();
                    Err(self.unexpected(item, "label value"))
                }
            },
        }
    }

    /// `(a,b,c)` after `in` / `notin`
    fn parse_value_set(&mut self) -> Result<Vec<String>, SelectorError> {
        match self.next() {
            Some((_, Token::OpenParen)) => {}
            other => return Err(self.unexpected(other, "'('")),
        }

        let mut values = Vec::new();
        if self.peek() == Some(&Token::CloseParen) {
            self.next();
            return Ok(values);
        }

        loop {
            let item = self.next();
            match item.as_ref().and_then(|(_, token)| token.as_value()) {
                Some(value) => values.push(value.to_string()),
                None => return Err(self.unexpected(item, "label value")),
            }
            match self.next() {
                Some((_, Token::Comma)) => {}
                Some((_, Token::CloseParen)) => return Ok(values),
                other => return Err(self.unexpected(other, "',' or ')'")),
            }
        }
    }
}
