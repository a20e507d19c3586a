//! Hash index publication.
//!
//! The index only moves forward from trusted runs: coverage runs and
//! non-default branches leave it untouched unless forced.

use std::fmt;

use tracing::{info, warn};

use incrtest_core::{ExecutedUnit, HashIndex, IndexStore, IndexStoreError, Result, UnitSet};

/// Inputs to the publish decision.
#[derive(Debug, Clone, Default)]
pub struct PublishPolicy {
    pub collect_coverage: bool,
    pub force_update_index: bool,
    pub current_branch: Option<String>,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Coverage-instrumented binaries hash differently from plain ones.
    Coverage,
    NotDefaultBranch {
        current: Option<String>,
        default: Option<String>,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Coverage => f.write_str("coverage was collected"),
            SkipReason::NotDefaultBranch { current, default } => write!(
                f,
                "branch {} is not the default branch {}",
                current.as_deref().unwrap_or("<unknown>"),
                default.as_deref().unwrap_or("<unknown>")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishDecision {
    Publish,
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { revision: String, entries: usize },
    Skipped(SkipReason),
    /// Another pipeline published first; this run's index was dropped.
    Conflict,
}

/// Decide whether this run may publish its index.
pub fn decide(policy: &PublishPolicy, units: &UnitSet<ExecutedUnit>) -> PublishDecision {
    let has_coverage = units
        .values()
        .any(|u| u.run.as_ref().is_some_and(|r| r.coverage.is_some()));
    if policy.collect_coverage || has_coverage {
        return PublishDecision::Skip(SkipReason::Coverage);
    }

    let on_default = match (&policy.current_branch, &policy.default_branch) {
        (Some(current), Some(default)) => current == default,
        _ => false,
    };
    if !on_default && !policy.force_update_index {
        return PublishDecision::Skip(SkipReason::NotDefaultBranch {
            current: policy.current_branch.clone(),
            default: policy.default_branch.clone(),
        });
    }
    PublishDecision::Publish
}

/// Build the `import path → digest` index from executed units.
pub fn build_index(units: &UnitSet<ExecutedUnit>) -> HashIndex {
    let mut index = HashIndex::new();
    for unit in units.values() {
        if let Some(previous) = index.insert(unit.import_path(), unit.hash()) {
            warn!(unit = %unit.import_path(), replaced = %previous, "duplicate unit in index");
        }
    }
    index
}

/// Publish the index for `suite` when the policy allows it.
///
/// A conflicting concurrent publish is logged and swallowed; the next
/// trusted run will publish again.
pub async fn maybe_publish(
    store: &dyn IndexStore,
    suite: &str,
    base_revision: Option<&str>,
    policy: &PublishPolicy,
    units: &UnitSet<ExecutedUnit>,
) -> Result<PublishOutcome> {
    if let PublishDecision::Skip(reason) = decide(policy, units) {
        warn!("not updating the hash index: {reason}");
        return Ok(PublishOutcome::Skipped(reason));
    }

    let index = build_index(units);
    match store.publish(suite, &index, base_revision).await {
        Ok(revision) => {
            info!(suite, entries = index.len(), revision = %revision, "hash index updated");
            Ok(PublishOutcome::Published {
                revision,
                entries: index.len(),
            })
        }
        Err(e @ IndexStoreError::Conflict { .. }) => {
            warn!(suite, "hash index not updated: {e}");
            Ok(PublishOutcome::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}
