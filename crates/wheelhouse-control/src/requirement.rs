//! Requirement string parsing.
//!
//! Requirements are stored as literal strings such as `pandas==2.1.0` or
//! `requests>=2`. This module only splits them into a bare package name and
//! an optional constraint; it performs no version resolution.

use std::fmt;

use crate::error::{ControlError, ControlResult};

/// Version constraint operators, in recognition order.
///
/// Two-character operators come first so `>=` is never read as `>`.
const OPERATORS: [&str; 7] = ["==", ">=", "<=", "~=", "!=", ">", "<"];

/// A parsed requirement line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    raw: String,
    name_end: usize,
    operator: Option<&'static str>,
}

impl Requirement {
    /// Parse a requirement, rejecting malformed input.
    pub fn parse(raw: &str) -> ControlResult<Self> {
        validate(raw)?;

        let mut found: Option<(usize, &'static str)> = None;
        for op in OPERATORS {
            if let Some(pos) = raw.find(op) {
                if found.map_or(true, |(best, _)| pos < best) {
                    found = Some((pos, op));
                }
            }
        }

        let (name_end, operator) = match found {
            Some((pos, op)) => (pos, Some(op)),
            None => (raw.len(), None),
        };

        if name_end == 0 {
            return Err(ControlError::invalid_input("Invalid package name"));
        }

        Ok(Self {
            raw: raw.to_owned(),
            name_end,
            operator,
        })
    }

    /// The full literal requirement string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Package name without any version constraint.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.raw[..self.name_end]
    }

    /// Constraint operator, if any.
    #[must_use]
    pub const fn operator(&self) -> Option<&'static str> {
        self.operator
    }

    /// Version following the constraint operator, if any.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.operator
            .map(|op| &self.raw[self.name_end + op.len()..])
    }

    /// Whether two requirements name the same package.
    ///
    /// Bare names are compared literally; `Foo_Bar` and `foo-bar` differ.
    #[must_use]
    pub fn same_package(&self, other: &Self) -> bool {
        self.name() == other.name()
    }

    /// Whether a stored manifest line names this package.
    #[must_use]
    pub fn names_entry(&self, entry: &str) -> bool {
        package_name(entry) == self.name()
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Check that a package string is syntactically acceptable.
///
/// The string must be non-empty and contain no whitespace; a stray newline
/// would otherwise split one manifest entry into two.
pub fn validate(package: &str) -> ControlResult<()> {
    if package.is_empty() || package.chars().any(char::is_whitespace) {
        return Err(ControlError::invalid_input("Invalid package name"));
    }
    Ok(())
}

/// Extract the bare package name from a requirement string.
///
/// Returns the input unchanged when it carries no constraint.
#[must_use]
pub fn package_name(package: &str) -> &str {
    OPERATORS
        .iter()
        .filter_map(|op| package.find(op))
        .min()
        .map_or(package, |pos| &package[..pos])
        .trim()
}
