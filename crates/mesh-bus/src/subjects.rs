//! # Subjects
//!
//! Dot-delimited routing names and the patterns that select them.
//!
//! ```text
//! workflows.wf-42.in        concrete subject
//! workflows.*.in            `*` matches exactly one token
//! workflows.>               `>` matches one or more trailing tokens
//! ```
//!
//! Both forms are parsed by an explicit tokenizer: every token is non-empty and
//! free of whitespace, wildcards only appear as whole tokens of a pattern, and
//! `>` only as the last one.

use std::fmt;

use crate::errors::SubjectError;
use crate::tenant::TenantId;

const SEPARATOR: char = '.';
const SINGLE: &str = "*";
const TAIL: &str = ">";

fn check_tokens(raw: &str, allow_wildcards: bool) -> Result<(), SubjectError> {
    if raw.is_empty() {
        return Err(SubjectError::Empty);
    }
    let count = raw.split(SEPARATOR).count();
    for (position, token) in raw.split(SEPARATOR).enumerate() {
        if token.is_empty() {
            return Err(SubjectError::EmptyToken {
                subject: raw.to_string(),
                position,
            });
        }
        if let Some(found) = token.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(SubjectError::InvalidCharacter {
                subject: raw.to_string(),
                found,
            });
        }
        let is_wildcard = token == SINGLE || token == TAIL;
        if is_wildcard {
            if !allow_wildcards {
                return Err(SubjectError::WildcardNotAllowed(raw.to_string()));
            }
            if token == TAIL && position + 1 != count {
                return Err(SubjectError::MisplacedTail(raw.to_string()));
            }
        } else if let Some(found) = token.chars().find(|c| *c == '*' || *c == '>') {
            return Err(SubjectError::InvalidCharacter {
                subject: raw.to_string(),
                found,
            });
        }
    }
    Ok(())
}

/// Check that an identifier can be embedded as a single subject token.
pub fn validate_token(token: &str) -> Result<(), SubjectError> {
    if token.contains(SEPARATOR) || token.is_empty() {
        return Err(SubjectError::InvalidToken(token.to_string()));
    }
    check_tokens(token, false).map_err(|_| SubjectError::InvalidToken(token.to_string()))
}

/// A concrete subject. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject(String);

impl Subject {
    pub fn parse(raw: impl Into<String>) -> Result<Self, SubjectError> {
        let raw = raw.into();
        check_tokens(&raw, false)?;
        Ok(Self(raw))
    }

    fn from_tokens(tokens: &[&str]) -> Result<Self, SubjectError> {
        for token in tokens {
            validate_token(token)?;
        }
        Ok(Self(tokens.join(".")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    pub fn token_count(&self) -> usize {
        self.tokens().count()
    }

    /// Whether the first token is shaped like a tenant identifier.
    pub fn is_tenant_scoped(&self) -> bool {
        self.tokens().next().is_some_and(TenantId::is_tenant_shaped)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Literal(&'a str),
    Single,
    Tail,
}

impl<'a> Token<'a> {
    fn classify(raw: &'a str) -> Self {
        match raw {
            SINGLE => Self::Single,
            TAIL => Self::Tail,
            literal => Self::Literal(literal),
        }
    }
}

/// A subject pattern that may contain `*` and a trailing `>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectPattern(String);

impl SubjectPattern {
    pub fn parse(raw: impl Into<String>) -> Result<Self, SubjectError> {
        let raw = raw.into();
        check_tokens(&raw, true)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn tokens(&self) -> impl Iterator<Item = Token<'_>> {
        self.0.split(SEPARATOR).map(Token::classify)
    }

    pub fn has_wildcards(&self) -> bool {
        self.tokens().any(|t| !matches!(t, Token::Literal(_)))
    }

    /// Whether the first token is shaped like a tenant identifier.
    pub fn is_tenant_scoped(&self) -> bool {
        matches!(self.tokens().next(), Some(Token::Literal(t)) if TenantId::is_tenant_shaped(t))
    }

    pub fn matches(&self, subject: &Subject) -> bool {
        let mut pattern = self.tokens();
        let mut tokens = subject.tokens();
        loop {
            match (pattern.next(), tokens.next()) {
                (Some(Token::Tail), Some(_)) => return true,
                (Some(Token::Single), Some(_)) => {}
                (Some(Token::Literal(expected)), Some(actual)) if expected == actual => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    /// Whether every subject matched by `other` is also matched by `self`.
    pub fn covers(&self, other: &SubjectPattern) -> bool {
        let mut outer = self.tokens();
        let mut inner = other.tokens();
        loop {
            match (outer.next(), inner.next()) {
                (Some(Token::Tail), Some(_)) => return true,
                (Some(Token::Single), Some(Token::Single | Token::Literal(_))) => {}
                (Some(Token::Literal(a)), Some(Token::Literal(b))) if a == b => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Subject> for SubjectPattern {
    fn from(subject: Subject) -> Self {
        Self(subject.0)
    }
}

/// Message direction relative to the addressed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject categories.
pub mod category {
    pub const WORKFLOWS: &str = "workflows";
    pub const AGENTS: &str = "agents";
    pub const TOOLS: &str = "tools";
    pub const SYSTEM: &str = "system";
}

/// Builders for the untenanted subject hierarchy.
///
/// Identifiers must be single tokens; anything containing `.`, whitespace
/// or a wildcard character is rejected rather than silently re-routed.
pub struct SubjectBuilder;

impl SubjectBuilder {
    pub fn workflow(id: &str, direction: Direction) -> Result<Subject, SubjectError> {
        Subject::from_tokens(&[category::WORKFLOWS, id, direction.as_str()])
    }

    pub fn workflow_in(id: &str) -> Result<Subject, SubjectError> {
        Self::workflow(id, Direction::In)
    }

    pub fn workflow_out(id: &str) -> Result<Subject, SubjectError> {
        Self::workflow(id, Direction::Out)
    }

    pub fn agent(id: &str, direction: Direction) -> Result<Subject, SubjectError> {
        Subject::from_tokens(&[category::AGENTS, id, direction.as_str()])
    }

    pub fn agent_in(id: &str) -> Result<Subject, SubjectError> {
        Self::agent(id, Direction::In)
    }

    pub fn agent_out(id: &str) -> Result<Subject, SubjectError> {
        Self::agent(id, Direction::Out)
    }

    pub fn tool_calls() -> Subject {
        Subject(format!("{}.calls", category::TOOLS))
    }

    pub fn tool_audit() -> Subject {
        Subject(format!("{}.audit", category::TOOLS))
    }

    pub fn system_control() -> Subject {
        Subject(format!("{}.control", category::SYSTEM))
    }

    pub fn system_health() -> Subject {
        Subject(format!("{}.health", category::SYSTEM))
    }

    /// Dead-letter subject for records that exhausted their deliveries.
    pub fn dead_letter() -> Subject {
        Subject(format!("{}.dlq", category::SYSTEM))
    }

    /// Every subject of one workflow: `workflows.<id>.*`.
    pub fn workflow_all(id: &str) -> Result<SubjectPattern, SubjectError> {
        validate_token(id)?;
        Ok(SubjectPattern(format!("{}.{id}.*", category::WORKFLOWS)))
    }
}
