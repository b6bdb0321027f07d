use crate::backup_error::BackupError;
use crate::config::PolicyConfig;
use crate::pool::{Pool, Snapshot};
use chrono::NaiveDateTime;
use std::collections::HashSet;

pub mod bucket;
pub mod matcher;

#[cfg(test)]
mod tests;

use bucket::{BucketPlan, TtlPolicy};
use matcher::Matcher;

/// Decides, per snapshot, whether to keep or destroy, combining the
/// rule-based keep policies with the time-to-live bucket plan.
///
/// A snapshot is destroyed iff the rule-based keep is not mandatory and
/// the bucket planner placed it in trash. Snapshots the rules mark as
/// mandatory carry the pool-side protection tag; all others must not.
pub struct RetentionPlanner {
    ttl: Option<TtlPolicy>,
    max_retention: Option<Matcher>,
    retention_policy: Option<Matcher>,
    now: NaiveDateTime,
}

#[derive(Debug, PartialEq, Default)]
pub struct PruneOutcome {
    pub destroyed: Vec<String>,
    pub protected: Vec<String>,
    pub released: Vec<String>,
}

impl RetentionPlanner {
    pub fn from_config(policy: &PolicyConfig, now: NaiveDateTime) -> Result<Self, BackupError> {
        Ok(RetentionPlanner {
            ttl: policy
                .time_to_live
                .as_deref()
                .map(TtlPolicy::parse)
                .transpose()?,
            max_retention: policy
                .max_retention
                .as_deref()
                .map(Matcher::parse)
                .transpose()?,
            retention_policy: policy
                .retention_policy
                .as_deref()
                .map(Matcher::parse)
                .transpose()?,
            now,
        })
    }

    /// Prunes one volume of a pool.
    pub fn prune(&self, pool: &mut Pool, volume: &str) -> Result<PruneOutcome, BackupError> {
        let Some(volume_state) = pool.volume(volume) else {
            log::debug!(
                "volume \"{}\" not present on pool \"{}\", nothing to prune",
                volume,
                pool.name()
            );
            return Ok(PruneOutcome::default());
        };

        let decisions: Vec<(String, bool, Option<bool>)> = volume_state
            .snapshots()
            .iter()
            .map(|snapshot| {
                (
                    snapshot.name().to_string(),
                    snapshot.is_protected(),
                    self.rule_keep(snapshot),
                )
            })
            .collect();

        let plan = match &self.ttl {
            Some(policy) => {
                let plan = bucket::plan(volume_state.snapshots(), policy);
                log_plan(volume, &plan);
                plan
            }
            None => BucketPlan::default(),
        };
        let trash: HashSet<&String> = plan.trash.iter().collect();

        let mut outcome = PruneOutcome::default();

        for (name, currently_protected, keep) in &decisions {
            let want_protected = *keep == Some(true);

            if want_protected && !currently_protected {
                pool.protect_snapshot(volume, name)?;
                outcome.protected.push(name.clone());
            } else if !want_protected && *currently_protected {
                pool.unprotect_snapshot(volume, name)?;
                outcome.released.push(name.clone());
            }
        }

        for (name, _, keep) in &decisions {
            if *keep != Some(true) && trash.contains(name) {
                pool.remove_snapshot(volume, name)?;
                outcome.destroyed.push(name.clone());
            }
        }

        Ok(outcome)
    }

    /// Three-valued keep flag of the rule-based policies.
    ///
    /// `None` means keep on a best-effort basis. A configured max-retention
    /// policy turns the default into `Some(false)` unless one of its rules
    /// rescues the snapshot; a matching retention-policy rule always wins
    /// with `Some(true)`.
    fn rule_keep(&self, snapshot: &Snapshot) -> Option<bool> {
        let mut keep = None;

        if let Some(max_retention) = &self.max_retention {
            keep = if max_retention.matches(snapshot, self.now) {
                None
            } else {
                Some(false)
            };
        }

        if let Some(retention_policy) = &self.retention_policy {
            if retention_policy.matches(snapshot, self.now) {
                keep = Some(true);
            }
        }

        keep
    }
}

fn log_plan(volume: &str, plan: &BucketPlan) {
    for (bucket, names) in [
        ("mandatory", &plan.mandatory),
        ("h", &plan.hourly),
        ("d", &plan.daily),
        ("w", &plan.weekly),
        ("m", &plan.monthly),
        ("y", &plan.yearly),
        ("trash", &plan.trash),
    ] {
        for name in names {
            log::debug!("volume \"{}\": {} -> {}", volume, name, bucket);
        }
    }
}
