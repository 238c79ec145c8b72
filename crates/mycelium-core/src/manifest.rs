//! Task manifest schema and validation.
//!
//! Every task directory carries a `manifest.json` (this schema) and a
//! `spec.md` (free-form prose for the worker). The schema is strict: unknown
//! keys are rejected so a typo'd field fails loudly at catalog load instead
//! of silently changing scheduling behavior.

use crate::types::TddMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("task name must not be empty")]
    EmptyName,
    #[error("verify.doctor must not be empty")]
    EmptyDoctor,
    #[error("tdd_mode=strict requires verify.fast")]
    StrictTddWithoutFast,
    #[error("task depends on itself: {0}")]
    SelfDependency(String),
    #[error("unknown resource in locks.{section}: {resource}")]
    UnknownResource { section: String, resource: String },
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Symbolic resource locks declared by a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockDecls {
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

/// File globs a task declares it will read and write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDecls {
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

/// Verification commands for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCommands {
    /// Full health check. Gates attempt success inside the worker and the
    /// integration branch after merge.
    pub doctor: String,
    /// Quick check used between worker turns (required for strict TDD).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint: Option<String>,
}

/// Parsed `manifest.json` for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub locks: LockDecls,
    #[serde(default)]
    pub files: FileDecls,
    /// Task ids this task depends on. Internal deps must complete in the
    /// same run; external deps are satisfied through the ledger.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub test_paths: Vec<String>,
    #[serde(default)]
    pub tdd_mode: TddMode,
    pub verify: VerifyCommands,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
}

impl TaskManifest {
    /// Parse a manifest document, schema errors included.
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Filename-friendly form of the task name.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// Structural validation beyond the serde schema.
    ///
    /// When `known_resources` is provided, every declared lock resource must
    /// be a member; an unknown resource is a hard error. Returns all
    /// violations so callers can choose to collect or fail fast.
    pub fn validate(
        &self,
        task_id: &str,
        known_resources: Option<&BTreeSet<String>>,
    ) -> Vec<ManifestError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ManifestError::EmptyName);
        }
        if self.verify.doctor.trim().is_empty() {
            errors.push(ManifestError::EmptyDoctor);
        }
        if self.tdd_mode == TddMode::Strict && self.verify.fast.is_none() {
            errors.push(ManifestError::StrictTddWithoutFast);
        }
        if self.dependencies.contains(task_id) {
            errors.push(ManifestError::SelfDependency(task_id.to_string()));
        }

        if let Some(known) = known_resources {
            for (section, decls) in [("reads", &self.locks.reads), ("writes", &self.locks.writes)] {
                for resource in decls {
                    if !known.contains(resource) {
                        errors.push(ManifestError::UnknownResource {
                            section: section.to_string(),
                            resource: resource.clone(),
                        });
                    }
                }
            }
        }

        errors
    }
}

/// Create a slug from a task name (lowercase, alphanumeric, hyphens).
pub fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_manifest() -> &'static str {
        r#"{
            "name": "Alpha feature",
            "verify": { "doctor": "cargo test" }
        }"#
    }

    #[test]
    fn parses_minimal_manifest_with_defaults() {
        let manifest = TaskManifest::parse(minimal_manifest()).unwrap();
        assert_eq!(manifest.name, "Alpha feature");
        assert!(manifest.description.is_empty());
        assert!(manifest.locks.writes.is_empty());
        assert!(manifest.dependencies.is_empty());
        assert_eq!(manifest.tdd_mode, TddMode::Off);
        assert_eq!(manifest.verify.doctor, "cargo test");
        assert!(manifest.verify.fast.is_none());
    }

    #[test]
    fn rejects_unknown_keys() {
        let json = r#"{
            "name": "Alpha",
            "verify": { "doctor": "true" },
            "surprise": 1
        }"#;
        assert!(TaskManifest::parse(json).is_err());
    }

    #[test]
    fn rejects_unknown_keys_in_nested_sections() {
        let json = r#"{
            "name": "Alpha",
            "locks": { "reads": [], "writes": [], "extra": [] },
            "verify": { "doctor": "true" }
        }"#;
        assert!(TaskManifest::parse(json).is_err());
    }

    #[test]
    fn slug_is_filename_friendly() {
        assert_eq!(slugify("Alpha feature"), "alpha-feature");
        assert_eq!(slugify("Fix bug #123!"), "fix-bug-123");
        assert_eq!(slugify("  spaced  out  "), "spaced-out");
    }

    #[test]
    fn strict_tdd_requires_fast_command() {
        let json = r#"{
            "name": "Alpha",
            "tdd_mode": "strict",
            "verify": { "doctor": "cargo test" }
        }"#;
        let manifest = TaskManifest::parse(json).unwrap();
        let errors = manifest.validate("001", None);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ManifestError::StrictTddWithoutFast)));

        let json = r#"{
            "name": "Alpha",
            "tdd_mode": "strict",
            "verify": { "doctor": "cargo test", "fast": "cargo check" }
        }"#;
        let manifest = TaskManifest::parse(json).unwrap();
        assert!(manifest.validate("001", None).is_empty());
    }

    #[test]
    fn unknown_lock_resource_is_an_error() {
        let json = r#"{
            "name": "Alpha",
            "locks": { "reads": ["db"], "writes": ["api", "ghost"] },
            "verify": { "doctor": "true" }
        }"#;
        let manifest = TaskManifest::parse(json).unwrap();
        let known: BTreeSet<String> = ["db", "api"].iter().map(|s| s.to_string()).collect();

        let errors = manifest.validate("001", Some(&known));
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ManifestError::UnknownResource { section, resource }
                if section == "writes" && resource == "ghost"
        ));

        // Without a known set, lock names are unchecked.
        assert!(manifest.validate("001", None).is_empty());
    }

    #[test]
    fn self_dependency_is_an_error() {
        let json = r#"{
            "name": "Alpha",
            "dependencies": ["002"],
            "verify": { "doctor": "true" }
        }"#;
        let manifest = TaskManifest::parse(json).unwrap();
        let errors = manifest.validate("002", None);
        assert!(errors
            .iter()
            .any(|e| matches!(e, ManifestError::SelfDependency(id) if id == "002")));
    }
}
