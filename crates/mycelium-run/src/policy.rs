//! Policy and compliance.
//!
//! Derives per-task effective write locks and a risk tier from the declared
//! manifest, the set of changed files, and the optional code-graph component
//! model. Also produces the compliance checkset (changed files vs declared
//! writes) and rescope plans for violations.

use globset::{Glob, GlobSet, GlobSetBuilder};
use mycelium_core::config::{ControlPlaneConfig, EnforcementMode, LockMode, SurfacePatterns};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid component model: {0}")]
    Model(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

/// Surface change categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SurfaceCategory {
    Contract,
    Config,
    Migration,
    PublicEntrypoint,
}

impl SurfaceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Config => "config",
            Self::Migration => "migration",
            Self::PublicEntrypoint => "public-entrypoint",
        }
    }
}

/// Compiled surface pattern matchers.
#[derive(Debug)]
pub struct SurfaceMatchers {
    contract: GlobSet,
    config: GlobSet,
    migration: GlobSet,
    public_entrypoint: GlobSet,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

impl SurfaceMatchers {
    pub fn from_patterns(patterns: &SurfacePatterns) -> Result<Self> {
        Ok(Self {
            contract: build_globset(&patterns.contract)?,
            config: build_globset(&patterns.config)?,
            migration: build_globset(&patterns.migration)?,
            public_entrypoint: build_globset(&patterns.public_entrypoint)?,
        })
    }

    pub fn categories_for_path(&self, path: &str) -> BTreeSet<SurfaceCategory> {
        let mut categories = BTreeSet::new();
        if self.contract.is_match(path) {
            categories.insert(SurfaceCategory::Contract);
        }
        if self.config.is_match(path) {
            categories.insert(SurfaceCategory::Config);
        }
        if self.migration.is_match(path) {
            categories.insert(SurfaceCategory::Migration);
        }
        if self.public_entrypoint.is_match(path) {
            categories.insert(SurfaceCategory::PublicEntrypoint);
        }
        categories
    }

    pub fn categories_for(&self, paths: &[String]) -> BTreeSet<SurfaceCategory> {
        paths
            .iter()
            .flat_map(|p| self.categories_for_path(p))
            .collect()
    }

    pub fn is_surface(&self, path: &str) -> bool {
        !self.categories_for_path(path).is_empty()
    }
}

/// One component in the code-graph model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    /// Directory roots owned by the component (path prefixes).
    pub roots: Vec<String>,
    /// Components that depend on this one (blast radius input).
    #[serde(default)]
    pub dependents: Vec<String>,
}

/// The component ownership model, read from
/// `.mycelium/control-plane/models/<base_sha>/model.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentModel {
    pub components: Vec<Component>,
}

impl ComponentModel {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Owning component for a path: longest matching root wins.
    pub fn owner_of(&self, path: &str) -> Option<&str> {
        let normalized = path.trim_start_matches("./");
        let mut best: Option<(&str, usize)> = None;
        for component in &self.components {
            for root in &component.roots {
                let root = root.trim_end_matches('/');
                let is_match = normalized == root
                    || normalized.starts_with(&format!("{root}/"));
                if is_match && best.is_none_or(|(_, len)| root.len() > len) {
                    best = Some((component.id.as_str(), root.len()));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.components
            .iter()
            .find(|c| c.id == id)
            .map_or(&[], |c| c.dependents.as_slice())
    }
}

/// Inputs to tier classification.
#[derive(Debug, Clone, Default)]
pub struct TierSignals {
    pub surface_categories: BTreeSet<SurfaceCategory>,
    pub impacted_component_count: i64,
    pub touched_component_count: i64,
    pub repo_root_fallback: bool,
}

/// Collapse the risk signals into an autonomy tier 0-3.
pub fn classify_tier(signals: &TierSignals) -> u8 {
    let impacted = signals
        .impacted_component_count
        .max(signals.touched_component_count)
        .max(0);
    let cats = &signals.surface_categories;
    let has_migration = cats.contains(&SurfaceCategory::Migration);
    let contract_and_config =
        cats.contains(&SurfaceCategory::Contract) && cats.contains(&SurfaceCategory::Config);

    if has_migration || contract_and_config {
        return 3;
    }
    if signals.repo_root_fallback && impacted >= 4 {
        return 3;
    }
    if !cats.is_empty() || impacted >= 4 || signals.repo_root_fallback {
        return 2;
    }
    if impacted >= 2 {
        return 1;
    }
    0
}

/// Enforcement upgrade: `warn` becomes `block` at tier >= 2; `off` stays off.
pub fn effective_enforcement(base: EnforcementMode, tier: u8) -> EnforcementMode {
    match base {
        EnforcementMode::Off => EnforcementMode::Off,
        EnforcementMode::Block => EnforcementMode::Block,
        EnforcementMode::Warn => {
            if tier >= 2 {
                EnforcementMode::Block
            } else {
                EnforcementMode::Warn
            }
        }
    }
}

/// Per-task policy decision, persisted as a validator report.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub task_id: String,
    pub tier: u8,
    pub surface_categories: Vec<String>,
    /// The manifest's declared write locks, preserved for audit.
    pub declared_write_locks: Vec<String>,
    pub effective_write_locks: Vec<String>,
    /// Note recorded when ownership resolution widened to the fallback
    /// resource; observers use it to audit widenings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widened: Option<String>,
    pub enforcement: EnforcementMode,
}

/// Literal prefix of a glob (up to the first meta character), used to map a
/// declared write glob onto component roots.
fn glob_literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '{'))
        .unwrap_or(pattern.len());
    pattern[..end].trim_end_matches('/')
}

/// Computes lock derivation and tier decisions for one run.
#[derive(Debug)]
pub struct PolicyEngine {
    control_plane: ControlPlaneConfig,
    base_enforcement: EnforcementMode,
    matchers: SurfaceMatchers,
    model: Option<ComponentModel>,
}

impl PolicyEngine {
    pub fn new(
        control_plane: ControlPlaneConfig,
        base_enforcement: EnforcementMode,
        model: Option<ComponentModel>,
    ) -> Result<Self> {
        let matchers = SurfaceMatchers::from_patterns(&control_plane.surface_patterns)?;
        Ok(Self {
            control_plane,
            base_enforcement,
            matchers,
            model,
        })
    }

    pub fn model(&self) -> Option<&ComponentModel> {
        self.model.as_ref()
    }

    /// Decide locks, tier, and enforcement for a task.
    ///
    /// `declared_write_locks` and `declared_write_globs` come from the
    /// manifest; `changed_files` is empty before the first attempt (the
    /// declared globs stand in for it).
    pub fn decide(
        &self,
        task_id: &str,
        declared_write_locks: &[String],
        declared_write_globs: &[String],
        changed_files: &[String],
    ) -> PolicyDecision {
        let candidate_paths: Vec<String> = if changed_files.is_empty() {
            declared_write_globs
                .iter()
                .map(|g| glob_literal_prefix(g).to_string())
                .filter(|p| !p.is_empty())
                .collect()
        } else {
            changed_files.to_vec()
        };

        let derived_enabled = self.control_plane.enabled
            && self.control_plane.lock_mode == LockMode::Derived;

        let mut effective: BTreeSet<String> = BTreeSet::new();
        let mut widened: Option<String> = None;
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut impacted: BTreeSet<String> = BTreeSet::new();
        let mut repo_root_fallback = false;

        if derived_enabled {
            for path in &candidate_paths {
                let owner = self.model.as_ref().and_then(|m| m.owner_of(path));
                match owner {
                    Some(id) => {
                        effective.insert(format!("component:{id}"));
                        touched.insert(id.to_string());
                        impacted.insert(id.to_string());
                        if let Some(model) = &self.model {
                            for dependent in model.dependents_of(id) {
                                impacted.insert(dependent.clone());
                            }
                        }
                        if self.control_plane.surface_locks.enabled
                            && self.matchers.is_surface(path)
                        {
                            effective.insert(format!("surface:{id}"));
                        }
                    }
                    None => {
                        effective.insert(self.control_plane.fallback_resource.clone());
                        repo_root_fallback = true;
                        if widened.is_none() {
                            widened = Some(format!(
                                "no component owns `{path}`; widened to `{}`",
                                self.control_plane.fallback_resource
                            ));
                        }
                    }
                }
            }
            if effective.is_empty() {
                // Nothing declared and nothing changed yet: hold the
                // fallback so the task is never lock-free in derived mode.
                effective.insert(self.control_plane.fallback_resource.clone());
                repo_root_fallback = true;
                widened = Some(format!(
                    "no files declared; widened to `{}`",
                    self.control_plane.fallback_resource
                ));
            }
        } else {
            effective.extend(declared_write_locks.iter().cloned());
            if let Some(model) = &self.model {
                for path in &candidate_paths {
                    if let Some(id) = model.owner_of(path) {
                        touched.insert(id.to_string());
                        impacted.insert(id.to_string());
                        for dependent in model.dependents_of(id) {
                            impacted.insert(dependent.clone());
                        }
                    }
                }
            }
        }

        let surface_categories = self.matchers.categories_for(&candidate_paths);
        let tier = classify_tier(&TierSignals {
            surface_categories: surface_categories.clone(),
            impacted_component_count: impacted.len() as i64,
            touched_component_count: touched.len() as i64,
            repo_root_fallback,
        });
        let enforcement = effective_enforcement(self.base_enforcement, tier);

        debug!(task_id, tier, ?effective, "policy decision");
        PolicyDecision {
            task_id: task_id.to_string(),
            tier,
            surface_categories: surface_categories.iter().map(|c| c.as_str().into()).collect(),
            declared_write_locks: declared_write_locks.to_vec(),
            effective_write_locks: effective.into_iter().collect(),
            widened,
            enforcement,
        }
    }
}

// --- Compliance checkset ---

/// Changed files checked against the manifest's declared write globs.
#[derive(Debug, Clone, Serialize)]
pub struct ChecksetReport {
    pub task_id: String,
    pub changed_files: Vec<String>,
    pub undeclared_writes: Vec<String>,
    pub ok: bool,
}

/// Compare the files a task actually changed against its declared writes.
pub fn checkset(
    task_id: &str,
    changed_files: &[String],
    declared_write_globs: &[String],
) -> Result<ChecksetReport> {
    let declared = build_globset(declared_write_globs)?;
    let undeclared: Vec<String> = changed_files
        .iter()
        .filter(|path| !declared.is_match(path.as_str()))
        .cloned()
        .collect();
    Ok(ChecksetReport {
        task_id: task_id.to_string(),
        changed_files: changed_files.to_vec(),
        ok: undeclared.is_empty(),
        undeclared_writes: undeclared,
    })
}

// --- Rescope ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RescopeStatus {
    Updated,
    Noop,
    Failed,
}

impl RescopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Noop => "noop",
            Self::Failed => "failed",
        }
    }
}

/// Plan for expanding a task's declared scope to cover observed violations.
#[derive(Debug, Clone, Serialize)]
pub struct RescopePlan {
    pub status: RescopeStatus,
    pub added_locks: Vec<String>,
    pub added_files: Vec<String>,
    /// Files whose resource could not be mapped at all.
    pub unmappable: Vec<String>,
}

/// Build a rescope plan for undeclared writes.
///
/// Each file maps to its owning component's lock, or to the fallback
/// resource when ownership is unknown. `failed` when a file's resource is
/// entirely unmappable (no owner and no fallback configured).
pub fn rescope(
    undeclared_files: &[String],
    model: Option<&ComponentModel>,
    fallback_resource: Option<&str>,
) -> RescopePlan {
    if undeclared_files.is_empty() {
        return RescopePlan {
            status: RescopeStatus::Noop,
            added_locks: Vec::new(),
            added_files: Vec::new(),
            unmappable: Vec::new(),
        };
    }

    let mut added_locks = BTreeSet::new();
    let mut added_files = BTreeSet::new();
    let mut unmappable = Vec::new();

    for file in undeclared_files {
        let owner = model.and_then(|m| m.owner_of(file));
        match (owner, fallback_resource) {
            (Some(id), _) => {
                added_locks.insert(format!("component:{id}"));
                added_files.insert(file.clone());
            }
            (None, Some(fallback)) => {
                added_locks.insert(fallback.to_string());
                added_files.insert(file.clone());
            }
            (None, None) => unmappable.push(file.clone()),
        }
    }

    RescopePlan {
        status: if unmappable.is_empty() {
            RescopeStatus::Updated
        } else {
            RescopeStatus::Failed
        },
        added_locks: added_locks.into_iter().collect(),
        added_files: added_files.into_iter().collect(),
        unmappable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cats(list: &[SurfaceCategory]) -> BTreeSet<SurfaceCategory> {
        list.iter().copied().collect()
    }

    fn model() -> ComponentModel {
        ComponentModel {
            components: vec![
                Component {
                    id: "api".into(),
                    roots: vec!["src/api".into()],
                    dependents: vec!["web".into()],
                },
                Component {
                    id: "web".into(),
                    roots: vec!["src/web".into()],
                    dependents: Vec::new(),
                },
                Component {
                    id: "core".into(),
                    roots: vec!["src".into()],
                    dependents: Vec::new(),
                },
            ],
        }
    }

    fn derived_cp() -> ControlPlaneConfig {
        let mut cp = ControlPlaneConfig::default();
        cp.enabled = true;
        cp.lock_mode = LockMode::Derived;
        cp
    }

    // --- Tier table (exhaustive over the classification inputs) ---

    #[test]
    fn tier_3_on_migration_surface() {
        let tier = classify_tier(&TierSignals {
            surface_categories: cats(&[SurfaceCategory::Migration]),
            ..TierSignals::default()
        });
        assert_eq!(tier, 3);
    }

    #[test]
    fn tier_3_on_contract_plus_config() {
        let tier = classify_tier(&TierSignals {
            surface_categories: cats(&[SurfaceCategory::Contract, SurfaceCategory::Config]),
            ..TierSignals::default()
        });
        assert_eq!(tier, 3);
    }

    #[test]
    fn tier_3_on_fallback_with_wide_impact() {
        let tier = classify_tier(&TierSignals {
            repo_root_fallback: true,
            impacted_component_count: 4,
            ..TierSignals::default()
        });
        assert_eq!(tier, 3);
    }

    #[test]
    fn tier_2_on_single_surface_category() {
        for category in [
            SurfaceCategory::Contract,
            SurfaceCategory::Config,
            SurfaceCategory::PublicEntrypoint,
        ] {
            let tier = classify_tier(&TierSignals {
                surface_categories: cats(&[category]),
                ..TierSignals::default()
            });
            assert_eq!(tier, 2, "category {category:?}");
        }
    }

    #[test]
    fn tier_2_on_wide_impact_or_fallback_alone() {
        assert_eq!(
            classify_tier(&TierSignals {
                impacted_component_count: 4,
                ..TierSignals::default()
            }),
            2
        );
        assert_eq!(
            classify_tier(&TierSignals {
                repo_root_fallback: true,
                ..TierSignals::default()
            }),
            2
        );
    }

    #[test]
    fn tier_1_on_moderate_impact() {
        assert_eq!(
            classify_tier(&TierSignals {
                impacted_component_count: 2,
                ..TierSignals::default()
            }),
            1
        );
        assert_eq!(
            classify_tier(&TierSignals {
                impacted_component_count: 3,
                ..TierSignals::default()
            }),
            1
        );
    }

    #[test]
    fn tier_0_otherwise() {
        assert_eq!(classify_tier(&TierSignals::default()), 0);
        assert_eq!(
            classify_tier(&TierSignals {
                impacted_component_count: 1,
                touched_component_count: 1,
                ..TierSignals::default()
            }),
            0
        );
    }

    #[test]
    fn impacted_is_max_of_counts_and_floored_at_zero() {
        assert_eq!(
            classify_tier(&TierSignals {
                impacted_component_count: 1,
                touched_component_count: 4,
                ..TierSignals::default()
            }),
            2
        );
        assert_eq!(
            classify_tier(&TierSignals {
                impacted_component_count: -5,
                touched_component_count: -2,
                ..TierSignals::default()
            }),
            0
        );
    }

    // --- Enforcement upgrade ---

    #[test]
    fn enforcement_upgrades_warn_to_block_at_tier_2() {
        assert_eq!(
            effective_enforcement(EnforcementMode::Warn, 2),
            EnforcementMode::Block
        );
        assert_eq!(
            effective_enforcement(EnforcementMode::Warn, 1),
            EnforcementMode::Warn
        );
        assert_eq!(
            effective_enforcement(EnforcementMode::Off, 3),
            EnforcementMode::Off
        );
        assert_eq!(
            effective_enforcement(EnforcementMode::Block, 0),
            EnforcementMode::Block
        );
    }

    // --- Ownership ---

    #[test]
    fn owner_of_prefers_longest_root() {
        let model = model();
        assert_eq!(model.owner_of("src/api/routes.rs"), Some("api"));
        assert_eq!(model.owner_of("src/web/index.ts"), Some("web"));
        assert_eq!(model.owner_of("src/lib.rs"), Some("core"));
        assert_eq!(model.owner_of("docs/readme.md"), None);
        // A root is not a prefix of unrelated siblings.
        assert_eq!(model.owner_of("src/apiary/x.rs"), Some("core"));
    }

    // --- Derived locks ---

    #[test]
    fn derived_locks_emit_one_component_lock_per_owner() {
        let engine = PolicyEngine::new(derived_cp(), EnforcementMode::Warn, Some(model())).unwrap();
        let decision = engine.decide(
            "001",
            &["api".to_string()],
            &["src/api/**".to_string()],
            &[],
        );
        assert_eq!(decision.effective_write_locks, vec!["component:api"]);
        assert!(decision.widened.is_none());
        assert!(!decision
            .effective_write_locks
            .iter()
            .any(|l| l == "repo-root"));
        // Declared locks preserved for audit.
        assert_eq!(decision.declared_write_locks, vec!["api"]);
    }

    #[test]
    fn distinct_components_yield_distinct_locks() {
        let engine = PolicyEngine::new(derived_cp(), EnforcementMode::Warn, Some(model())).unwrap();
        let a = engine.decide("001", &[], &["src/api/**".to_string()], &[]);
        let b = engine.decide("002", &[], &["src/web/**".to_string()], &[]);
        assert_eq!(a.effective_write_locks, vec!["component:api"]);
        assert_eq!(b.effective_write_locks, vec!["component:web"]);
    }

    #[test]
    fn unowned_path_widens_to_fallback_with_note() {
        let engine = PolicyEngine::new(derived_cp(), EnforcementMode::Warn, Some(model())).unwrap();
        let decision = engine.decide("001", &[], &["docs/**".to_string()], &[]);
        assert_eq!(decision.effective_write_locks, vec!["repo-root"]);
        let note = decision.widened.unwrap();
        assert!(note.contains("docs"));
        assert!(note.contains("repo-root"));
    }

    #[test]
    fn surface_locks_added_when_enabled() {
        let mut cp = derived_cp();
        cp.surface_locks.enabled = true;
        let engine = PolicyEngine::new(cp, EnforcementMode::Warn, Some(model())).unwrap();
        let decision = engine.decide(
            "001",
            &[],
            &[],
            &["src/api/config/settings.yaml".to_string()],
        );
        assert!(decision
            .effective_write_locks
            .contains(&"component:api".to_string()));
        assert!(decision
            .effective_write_locks
            .contains(&"surface:api".to_string()));
    }

    #[test]
    fn declared_mode_passes_locks_through() {
        let mut cp = derived_cp();
        cp.lock_mode = LockMode::Declared;
        let engine = PolicyEngine::new(cp, EnforcementMode::Warn, Some(model())).unwrap();
        let decision = engine.decide(
            "001",
            &["db".to_string(), "api".to_string()],
            &["src/api/**".to_string()],
            &[],
        );
        assert_eq!(decision.effective_write_locks, vec!["api", "db"]);
    }

    #[test]
    fn changed_files_take_precedence_over_declared_globs() {
        let engine = PolicyEngine::new(derived_cp(), EnforcementMode::Warn, Some(model())).unwrap();
        let decision = engine.decide(
            "001",
            &[],
            &["src/api/**".to_string()],
            &["src/web/app.ts".to_string()],
        );
        assert_eq!(decision.effective_write_locks, vec!["component:web"]);
    }

    // --- Checkset ---

    #[test]
    fn checkset_flags_undeclared_writes() {
        let report = checkset(
            "001",
            &["src/api/a.rs".to_string(), "README.md".to_string()],
            &["src/api/**".to_string()],
        )
        .unwrap();
        assert!(!report.ok);
        assert_eq!(report.undeclared_writes, vec!["README.md"]);

        let clean = checkset(
            "001",
            &["src/api/a.rs".to_string()],
            &["src/api/**".to_string()],
        )
        .unwrap();
        assert!(clean.ok);
        assert!(clean.undeclared_writes.is_empty());
    }

    // --- Rescope ---

    #[test]
    fn rescope_noop_without_violations() {
        let plan = rescope(&[], Some(&model()), Some("repo-root"));
        assert_eq!(plan.status, RescopeStatus::Noop);
        assert!(plan.added_locks.is_empty());
    }

    #[test]
    fn rescope_maps_files_to_component_locks() {
        let plan = rescope(
            &["src/api/new.rs".to_string(), "src/web/new.ts".to_string()],
            Some(&model()),
            Some("repo-root"),
        );
        assert_eq!(plan.status, RescopeStatus::Updated);
        assert_eq!(
            plan.added_locks,
            vec!["component:api".to_string(), "component:web".to_string()]
        );
        assert_eq!(plan.added_files.len(), 2);
    }

    #[test]
    fn rescope_uses_fallback_for_unowned_files() {
        let plan = rescope(
            &["docs/guide.md".to_string()],
            Some(&model()),
            Some("repo-root"),
        );
        assert_eq!(plan.status, RescopeStatus::Updated);
        assert_eq!(plan.added_locks, vec!["repo-root"]);
    }

    #[test]
    fn rescope_fails_when_resource_is_unmappable() {
        let plan = rescope(&["docs/guide.md".to_string()], Some(&model()), None);
        assert_eq!(plan.status, RescopeStatus::Failed);
        assert_eq!(plan.unmappable, vec!["docs/guide.md"]);
    }

    // --- Model loading ---

    #[test]
    fn component_model_loads_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(
            &path,
            r#"{"components":[{"id":"api","roots":["src/api"],"dependents":["web"]}]}"#,
        )
        .unwrap();
        let model = ComponentModel::load(&path).unwrap();
        assert_eq!(model.components.len(), 1);
        assert_eq!(model.owner_of("src/api/x.rs"), Some("api"));
        assert_eq!(model.dependents_of("api"), &["web".to_string()]);
    }

    #[test]
    fn surface_defaults_match_expected_categories() {
        let matchers = SurfaceMatchers::from_patterns(&SurfacePatterns::default()).unwrap();
        assert_eq!(
            matchers.categories_for_path("api/schema/user.graphql"),
            cats(&[SurfaceCategory::Contract])
        );
        assert!(matchers
            .categories_for_path("deploy/k8s/app.yaml")
            .contains(&SurfaceCategory::Config));
        assert!(matchers
            .categories_for_path("db/migrations/0001_init.sql")
            .contains(&SurfaceCategory::Migration));
        assert!(matchers
            .categories_for_path("src/main.rs")
            .contains(&SurfaceCategory::PublicEntrypoint));
        assert!(matchers.categories_for_path("src/util/misc.rs").is_empty());
    }
}
