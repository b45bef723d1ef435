//! Batch study-assignment bookkeeping.
//!
//! Batches operate on the de-duplicated input: repeated exam ids collapse
//! to one, blank ids are dropped, first-seen order is kept. Every distinct
//! id lands in exactly one bucket:
//!
//! | Bucket | Reported as | Counted in |
//! |--------|-------------|------------|
//! | not in the study registry | `failed_items` / `not_found` | - |
//! | already assigned to the project | `failed_items` / `already_assigned` | `skipped_count` |
//! | newly inserted | - | `added_count` |

use std::collections::HashSet;

use serde::Serialize;

use crate::error::RecordsError;

/// Default upper bound on distinct exam ids per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotFound,
    AlreadyAssigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub exam_id: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddStudiesOutcome {
    pub added_count: usize,
    pub skipped_count: usize,
    pub failed_items: Vec<FailedItem>,
    pub requested_count: usize,
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoveStudiesOutcome {
    pub removed_count: usize,
}

/// Distinct, non-blank ids in first-seen order.
pub fn distinct_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.as_ref().trim();
        if !id.is_empty() && seen.insert(id.to_string()) {
            out.push(id.to_string());
        }
    }
    out
}

pub fn check_batch_limit(requested: usize, max: usize) -> Result<(), RecordsError> {
    if requested > max {
        return Err(RecordsError::BatchLimitExceeded { requested, max });
    }
    Ok(())
}

/// Split distinct ids into `(missing, already_assigned, fresh)`.
pub fn partition(
    distinct: &[String],
    registered: &HashSet<String>,
    assigned: &HashSet<String>,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut missing = Vec::new();
    let mut already = Vec::new();
    let mut fresh = Vec::new();
    for id in distinct {
        if !registered.contains(id) {
            missing.push(id.clone());
        } else if assigned.contains(id) {
            already.push(id.clone());
        } else {
            fresh.push(id.clone());
        }
    }
    (missing, already, fresh)
}

/// Assemble the per-batch report.
///
/// `already_assigned` must include ids that lost an insert race to a
/// concurrent batch; `added_count` is the number of rows actually inserted.
pub fn summarize(
    distinct: &[String],
    missing: &HashSet<String>,
    already_assigned: &HashSet<String>,
    added_count: usize,
    max_batch_size: usize,
) -> AddStudiesOutcome {
    let failed_items: Vec<FailedItem> = distinct
        .iter()
        .filter_map(|id| {
            let reason = if missing.contains(id) {
                FailureReason::NotFound
            } else if already_assigned.contains(id) {
                FailureReason::AlreadyAssigned
            } else {
                return None;
            };
            Some(FailedItem {
                exam_id: id.clone(),
                reason,
            })
        })
        .collect();
    let skipped_count = failed_items
        .iter()
        .filter(|f| f.reason == FailureReason::AlreadyAssigned)
        .count();

    AddStudiesOutcome {
        added_count,
        skipped_count,
        failed_items,
        requested_count: distinct.len(),
        max_batch_size,
    }
}
