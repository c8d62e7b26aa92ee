//! Plan lookup for dispatchers and plan file loading.
//!
//! Plans are authored elsewhere; this module only reads them. Files may be
//! JSON (`.json`) or YAML (anything else), holding either one plan or a list.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use autoflow_types::ExecutionPlan;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

/// Read access to approved plans by id.
pub trait PlanRepository: Send + Sync {
    fn plan(&self, plan_id: &str) -> Option<ExecutionPlan>;
    fn plans(&self) -> Vec<ExecutionPlan>;
}

/// In-memory plan table.
#[derive(Debug, Default)]
pub struct MemoryPlanRepository {
    plans: RwLock<BTreeMap<String, ExecutionPlan>>,
}

impl MemoryPlanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(plans: impl IntoIterator<Item = ExecutionPlan>) -> Self {
        let repository = Self::new();
        for plan in plans {
            repository.upsert(plan);
        }
        repository
    }

    /// Insert or replace a plan, returning the previous version.
    pub fn upsert(&self, plan: ExecutionPlan) -> Option<ExecutionPlan> {
        self.plans.write().insert(plan.id.clone(), plan)
    }

    pub fn remove(&self, plan_id: &str) -> Option<ExecutionPlan> {
        self.plans.write().remove(plan_id)
    }
}

impl PlanRepository for MemoryPlanRepository {
    fn plan(&self, plan_id: &str) -> Option<ExecutionPlan> {
        self.plans.read().get(plan_id).cloned()
    }

    fn plans(&self) -> Vec<ExecutionPlan> {
        self.plans.read().values().cloned().collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanDocument {
    Many(Vec<ExecutionPlan>),
    One(Box<ExecutionPlan>),
}

impl PlanDocument {
    fn into_plans(self) -> Vec<ExecutionPlan> {
        match self {
            Self::Many(plans) => plans,
            Self::One(plan) => vec![*plan],
        }
    }
}

/// Load one plan file.
pub fn load_plan_file(path: impl AsRef<Path>) -> Result<Vec<ExecutionPlan>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("failed to read plan file: {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));

    let document: PlanDocument = if is_json {
        serde_json::from_str(&content).with_context(|| format!("invalid JSON plan: {}", path.display()))?
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("invalid YAML plan: {}", path.display()))?
    };
    let plans = document.into_plans();
    if plans.is_empty() {
        bail!("plan file {} contains no plans", path.display());
    }
    debug!(path = %path.display(), count = plans.len(), "loaded plan file");
    Ok(plans)
}

/// Load every `.json`, `.yaml` and `.yml` file in `dir` (not recursive).
///
/// Duplicate plan ids are an error.
pub fn load_plan_directory(dir: impl AsRef<Path>) -> Result<Vec<ExecutionPlan>> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("failed to list plan directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|extension| extension.to_str())
                    .is_some_and(|extension| matches!(extension.to_ascii_lowercase().as_str(), "json" | "yaml" | "yml"))
        })
        .collect();
    paths.sort();

    let mut seen = BTreeMap::new();
    for path in paths {
        for plan in load_plan_file(&path)? {
            if let Some(previous) = seen.insert(plan.id.clone(), plan) {
                warn!(plan_id = %previous.id, "duplicate plan id");
                bail!("duplicate plan id '{}' in {}", previous.id, path.display());
            }
        }
    }
    Ok(seen.into_values().collect())
}
