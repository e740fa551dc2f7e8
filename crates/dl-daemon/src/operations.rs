//! Operation definitions and their versioned registry.
//!
//! The controller never branches on hard-coded operation behaviour. It
//! resolves an [`Operation`] for each step and reads what it needs (prompt
//! template, category, priority, batch limit) from the carried
//! [`OperationDefinition`]. Compiled-in definitions are the fallback.
//!
//! Overrides live under the operations directory:
//!
//! ```text
//! <dir>/proposals/<kind>.toml   loaded as pending, never used directly
//! <dir>/approved/<kind>.toml    the active override
//! ```
//!
//! A proposal only takes effect after an explicit [`approve`]
//! (`devloop operations --approve <kind>`), and only if its version is newer
//! than the active one.
//!
//! [`approve`]: OperationRegistry::approve_in_dir

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use dl_core::types::WorkCategory;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const PROPOSALS_DIR: &str = "proposals";
const APPROVED_DIR: &str = "approved";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid operation definition {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("definition in {path} is for `{found}`, expected `{expected}`")]
    KindMismatch {
        path: PathBuf,
        expected: OperationKind,
        found: OperationKind,
    },
    #[error("no pending proposal for `{0}`")]
    NoProposal(OperationKind),
    #[error("proposal for `{kind}` has version {proposed}, active is {active}")]
    StaleVersion {
        kind: OperationKind,
        proposed: u32,
        active: u32,
    },
    #[error("unknown operation `{0}`")]
    UnknownKind(String),
}

pub type Result<T> = std::result::Result<T, OperationError>;

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Acquire,
    Execute,
    Evaluate,
    Fix,
    Redesign,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Acquire,
        OperationKind::Execute,
        OperationKind::Evaluate,
        OperationKind::Fix,
        OperationKind::Redesign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Acquire => "acquire",
            OperationKind::Execute => "execute",
            OperationKind::Evaluate => "evaluate",
            OperationKind::Fix => "fix",
            OperationKind::Redesign => "redesign",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == raw.trim().to_ascii_lowercase())
            .ok_or_else(|| OperationError::UnknownKind(raw.to_string()))
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OperationDefinition / Operation
// ---------------------------------------------------------------------------

/// Data describing how one operation behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDefinition {
    pub kind: OperationKind,
    /// Compiled-in definitions are version 0.
    #[serde(default)]
    pub version: u32,
    pub description: String,
    /// Prompt template for tasks this operation creates.
    #[serde(default)]
    pub template: Option<String>,
    /// Category of tasks this operation creates.
    #[serde(default)]
    pub category: Option<WorkCategory>,
    #[serde(default)]
    pub priority: i32,
    /// Upper bound on tasks requested per acquisition.
    #[serde(default)]
    pub max_tasks: Option<usize>,
}

impl OperationDefinition {
    /// The compiled-in definition for `kind`.
    pub fn builtin(kind: OperationKind) -> Self {
        let (description, template, category, priority) = match kind {
            OperationKind::Acquire => (
                "Propose the next batch of tasks that move the project forward.",
                None,
                None,
                0,
            ),
            OperationKind::Execute => (
                "Drain available tasks one at a time through the task lifecycle.",
                None,
                None,
                0,
            ),
            OperationKind::Evaluate => (
                "Run the quality gates against the shared tree and assess path health.",
                None,
                None,
                0,
            ),
            OperationKind::Fix => (
                "Repair the failures reported by the quality gates on the shared tree.",
                Some(FIX_TEMPLATE),
                Some(WorkCategory::Coding),
                100,
            ),
            OperationKind::Redesign => (
                "Reduce structural complexity in the areas that grew fastest.",
                Some(REDESIGN_TEMPLATE),
                Some(WorkCategory::Coding),
                90,
            ),
        };
        Self {
            kind,
            version: 0,
            description: description.to_string(),
            template: template.map(str::to_string),
            category,
            priority,
            max_tasks: None,
        }
    }
}

const FIX_TEMPLATE: &str = "# Fix: {name}

The shared tree no longer passes its quality gates. Make the smallest change
that restores them. Do not add features.

## Diagnostics
{description}";

const REDESIGN_TEMPLATE: &str = "# Redesign: {name}

The codebase is growing faster than it is being simplified. Restructure the
affected code without changing behaviour, keeping tests, lint and build green.

## Signals
{description}";

/// A resolved operation, tagged by kind and carrying its definition.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Acquire(OperationDefinition),
    Execute(OperationDefinition),
    Evaluate(OperationDefinition),
    Fix(OperationDefinition),
    Redesign(OperationDefinition),
}

impl Operation {
    fn from_definition(def: OperationDefinition) -> Self {
        match def.kind {
            OperationKind::Acquire => Operation::Acquire(def),
            OperationKind::Execute => Operation::Execute(def),
            OperationKind::Evaluate => Operation::Evaluate(def),
            OperationKind::Fix => Operation::Fix(def),
            OperationKind::Redesign => Operation::Redesign(def),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.definition().kind
    }

    pub fn definition(&self) -> &OperationDefinition {
        match self {
            Operation::Acquire(d)
            | Operation::Execute(d)
            | Operation::Evaluate(d)
            | Operation::Fix(d)
            | Operation::Redesign(d) => d,
        }
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Where the definition a kind resolves to came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionSource {
    Builtin,
    Override,
}

/// One row of `devloop operations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub kind: OperationKind,
    pub active_version: u32,
    pub source: DefinitionSource,
    pub pending_version: Option<u32>,
}

/// Active overrides plus pending proposals. Kinds without an override
/// resolve to their compiled-in definition.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    active: BTreeMap<OperationKind, OperationDefinition>,
    pending: BTreeMap<OperationKind, OperationDefinition>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, kind: OperationKind) -> Operation {
        let def = self
            .active
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| OperationDefinition::builtin(kind));
        Operation::from_definition(def)
    }

    fn active_version(&self, kind: OperationKind) -> u32 {
        self.active.get(&kind).map_or(0, |d| d.version)
    }

    /// Queue a definition for approval. It is not used until approved.
    pub fn propose(&mut self, def: OperationDefinition) -> Result<()> {
        let active = self.active_version(def.kind);
        if def.version <= active {
            return Err(OperationError::StaleVersion {
                kind: def.kind,
                proposed: def.version,
                active,
            });
        }
        info!(operation = %def.kind, version = def.version, "operation proposal pending approval");
        self.pending.insert(def.kind, def);
        Ok(())
    }

    /// Make the pending proposal for `kind` the active definition.
    pub fn approve(&mut self, kind: OperationKind) -> Result<&OperationDefinition> {
        let def = self
            .pending
            .remove(&kind)
            .ok_or(OperationError::NoProposal(kind))?;
        info!(operation = %kind, version = def.version, "operation override approved");
        self.active.insert(kind, def);
        Ok(&self.active[&kind])
    }

    pub fn reject(&mut self, kind: OperationKind) -> Result<OperationDefinition> {
        self.pending
            .remove(&kind)
            .ok_or(OperationError::NoProposal(kind))
    }

    pub fn pending(&self) -> impl Iterator<Item = &OperationDefinition> {
        self.pending.values()
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        OperationKind::ALL
            .into_iter()
            .map(|kind| RegistryEntry {
                kind,
                active_version: self.active_version(kind),
                source: if self.active.contains_key(&kind) {
                    DefinitionSource::Override
                } else {
                    DefinitionSource::Builtin
                },
                pending_version: self.pending.get(&kind).map(|d| d.version),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Directory persistence
    // -----------------------------------------------------------------------

    /// Load approved overrides and pending proposals from `dir`. A missing
    /// directory yields an empty registry. Proposals that are not newer
    /// than the active override are skipped with a warning.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        for (path, def) in read_definitions(&dir.join(APPROVED_DIR))? {
            info!(operation = %def.kind, version = def.version, path = %path.display(), "operation override active");
            registry.active.insert(def.kind, def);
        }
        for (path, def) in read_definitions(&dir.join(PROPOSALS_DIR))? {
            if let Err(e) = registry.propose(def) {
                warn!(path = %path.display(), error = %e, "ignoring operation proposal");
            }
        }
        Ok(registry)
    }

    /// Approve the pending proposal for `kind` and move its file from
    /// `proposals/` to `approved/`.
    pub fn approve_in_dir(&mut self, dir: &Path, kind: OperationKind) -> Result<()> {
        self.approve(kind)?;
        let file = format!("{kind}.toml");
        let from = dir.join(PROPOSALS_DIR).join(&file);
        let approved = dir.join(APPROVED_DIR);
        std::fs::create_dir_all(&approved).map_err(|source| OperationError::Io {
            path: approved.clone(),
            source,
        })?;
        let to = approved.join(&file);
        std::fs::rename(&from, &to).map_err(|source| OperationError::Io { path: from, source })?;
        Ok(())
    }

    /// Drop the pending proposal for `kind` and delete its file.
    pub fn reject_in_dir(&mut self, dir: &Path, kind: OperationKind) -> Result<()> {
        self.reject(kind)?;
        let path = dir.join(PROPOSALS_DIR).join(format!("{kind}.toml"));
        std::fs::remove_file(&path).map_err(|source| OperationError::Io { path, source })?;
        Ok(())
    }
}

/// Read every `<kind>.toml` in `dir`. The file stem must match the
/// definition's kind.
fn read_definitions(dir: &Path) -> Result<Vec<(PathBuf, OperationDefinition)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(OperationError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };
    let mut defs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "toml") {
            continue;
        }
        let expected = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => OperationKind::parse(stem)?,
            None => continue,
        };
        let content = std::fs::read_to_string(&path).map_err(|source| OperationError::Io {
            path: path.clone(),
            source,
        })?;
        let def: OperationDefinition =
            toml::from_str(&content).map_err(|e| OperationError::Parse {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if def.kind != expected {
            return Err(OperationError::KindMismatch {
                path,
                expected,
                found: def.kind,
            });
        }
        defs.push((path, def));
    }
    defs.sort_by_key(|(_, d)| d.kind);
    Ok(defs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fix_v(version: u32, description: &str) -> OperationDefinition {
        OperationDefinition {
            version,
            description: description.into(),
            ..OperationDefinition::builtin(OperationKind::Fix)
        }
    }

    #[test]
    fn builtins_resolve_without_overrides() {
        let registry = OperationRegistry::new();
        for kind in OperationKind::ALL {
            let op = registry.resolve(kind);
            assert_eq!(op.kind(), kind);
            assert_eq!(op.definition().version, 0);
        }
        assert!(matches!(
            registry.resolve(OperationKind::Fix),
            Operation::Fix(OperationDefinition {
                category: Some(WorkCategory::Coding),
                ..
            })
        ));
    }

    #[test]
    fn proposal_needs_approval_to_take_effect() {
        let mut registry = OperationRegistry::new();
        registry.propose(fix_v(1, "tighter fixes")).unwrap();
        assert_eq!(registry.resolve(OperationKind::Fix).definition().version, 0);
        assert_eq!(registry.pending().count(), 1);

        registry.approve(OperationKind::Fix).unwrap();
        let op = registry.resolve(OperationKind::Fix);
        assert_eq!(op.definition().version, 1);
        assert_eq!(op.definition().description, "tighter fixes");
        assert_eq!(registry.pending().count(), 0);
    }

    #[test]
    fn older_proposals_are_refused() {
        let mut registry = OperationRegistry::new();
        registry.propose(fix_v(2, "v2")).unwrap();
        registry.approve(OperationKind::Fix).unwrap();
        assert!(matches!(
            registry.propose(fix_v(2, "again")),
            Err(OperationError::StaleVersion {
                proposed: 2,
                active: 2,
                ..
            })
        ));
        assert!(matches!(
            registry.approve(OperationKind::Fix),
            Err(OperationError::NoProposal(OperationKind::Fix))
        ));
    }

    #[test]
    fn parse_kind_names() {
        assert_eq!(OperationKind::parse("Redesign").unwrap(), OperationKind::Redesign);
        assert!(matches!(
            OperationKind::parse("deploy"),
            Err(OperationError::UnknownKind(_))
        ));
    }

    #[test]
    fn directory_round_trip_through_approval() {
        let tmp = tempfile::tempdir().unwrap();
        let proposals = tmp.path().join(PROPOSALS_DIR);
        std::fs::create_dir_all(&proposals).unwrap();
        std::fs::write(
            proposals.join("fix.toml"),
            r#"
kind = "fix"
version = 3
description = "Fix only what the failing gate names."
template = "FIX {name}: {description}"
priority = 50
"#,
        )
        .unwrap();

        let mut registry = OperationRegistry::load_from_dir(tmp.path()).unwrap();
        let entry = registry.entries()[3].clone();
        assert_eq!(entry.kind, OperationKind::Fix);
        assert_eq!(entry.source, DefinitionSource::Builtin);
        assert_eq!(entry.pending_version, Some(3));

        registry
            .approve_in_dir(tmp.path(), OperationKind::Fix)
            .unwrap();
        assert!(!proposals.join("fix.toml").exists());
        assert!(tmp.path().join(APPROVED_DIR).join("fix.toml").exists());

        let reloaded = OperationRegistry::load_from_dir(tmp.path()).unwrap();
        let fix = reloaded.resolve(OperationKind::Fix);
        assert_eq!(fix.definition().version, 3);
        assert_eq!(fix.definition().priority, 50);
        assert_eq!(reloaded.pending().count(), 0);
    }

    #[test]
    fn mismatched_file_name_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let approved = tmp.path().join(APPROVED_DIR);
        std::fs::create_dir_all(&approved).unwrap();
        std::fs::write(
            approved.join("fix.toml"),
            "kind = \"redesign\"\nversion = 1\ndescription = \"x\"\n",
        )
        .unwrap();
        assert!(matches!(
            OperationRegistry::load_from_dir(tmp.path()),
            Err(OperationError::KindMismatch { .. })
        ));
    }

    #[test]
    fn missing_directory_is_empty_registry() {
        let registry = OperationRegistry::load_from_dir(Path::new("/no/such/dir")).unwrap();
        assert!(registry
            .entries()
            .iter()
            .all(|e| e.source == DefinitionSource::Builtin && e.pending_version.is_none()));
    }
}
