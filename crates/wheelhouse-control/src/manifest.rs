//! In-memory view of the requirements manifest.
//!
//! The manifest itself lives in a cluster config object. The coordinator
//! reads a snapshot, applies one [`ManifestEdit`], and writes the whole
//! document back.

use crate::error::{ControlError, ControlResult};
use crate::requirement::Requirement;

/// Ordered list of requirement strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyManifest {
    entries: Vec<String>,
}

/// A single change to apply to the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEdit {
    /// Append a requirement.
    Add(Requirement),
    /// Remove the first occurrence of a requirement.
    Remove(Requirement),
    /// Replace `old` with `new` in place.
    Update {
        /// Requirement currently in the manifest.
        old: Requirement,
        /// Replacement requirement.
        new: Requirement,
    },
}

impl DependencyManifest {
    /// Create a manifest from a list of entries.
    #[must_use]
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    /// Parse manifest text, one requirement per line.
    ///
    /// Lines are trimmed and blank lines are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        Self { entries }
    }

    /// Render the manifest back to text.
    #[must_use]
    pub fn render(&self) -> String {
        self.entries.join("\n")
    }

    /// Current entries in order.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Consume the manifest and return its entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }

    /// Whether the literal requirement string is present.
    #[must_use]
    pub fn contains(&self, package: &str) -> bool {
        self.entries.iter().any(|e| e == package)
    }

    /// Append a requirement.
    ///
    /// Fails if the literal string is present, or if another constraint on
    /// the same package is already recorded.
    pub fn add(&mut self, requirement: &Requirement) -> ControlResult<()> {
        if self.contains(requirement.as_str()) || self.has_package(requirement) {
            return Err(ControlError::Conflict(requirement.to_string()));
        }
        self.entries.push(requirement.to_string());
        Ok(())
    }

    /// Remove the first occurrence of a requirement.
    pub fn remove(&mut self, requirement: &Requirement) -> ControlResult<()> {
        let index = self
            .position(requirement.as_str())
            .ok_or_else(|| ControlError::PackageNotFound(requirement.to_string()))?;
        self.entries.remove(index);
        Ok(())
    }

    /// Replace the first occurrence of `old` with `new`, keeping its position.
    pub fn update(&mut self, old: &Requirement, new: &Requirement) -> ControlResult<()> {
        if !old.same_package(new) {
            return Err(ControlError::invalid_input(
                "Cannot change package name during update",
            ));
        }
        let index = self
            .position(old.as_str())
            .ok_or_else(|| ControlError::PackageNotFound(old.to_string()))?;
        new.as_str().clone_into(&mut self.entries[index]);
        Ok(())
    }

    /// Apply an edit.
    pub fn apply(&mut self, edit: &ManifestEdit) -> ControlResult<()> {
        match edit {
            ManifestEdit::Add(req) => self.add(req),
            ManifestEdit::Remove(req) => self.remove(req),
            ManifestEdit::Update { old, new } => self.update(old, new),
        }
    }

    fn position(&self, package: &str) -> Option<usize> {
        self.entries.iter().position(|e| e == package)
    }

    fn has_package(&self, requirement: &Requirement) -> bool {
        self.entries.iter().any(|e| requirement.names_entry(e))
    }
}
