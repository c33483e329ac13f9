//! Consecutive-day guard. Pure functions, no I/O: dedupe by calendar day,
//! sort ascending, scan for the longest run of exactly-adjacent days.

use std::collections::BTreeSet;

use crate::model::Day;

/// Longest run of back-to-back calendar days in `days`. Ordering and
/// duplicates don't matter.
///
/// An empty input reports a run of 1: "no booking yet" is treated like a
/// single free-standing day so callers need no special case. Asymmetric,
/// but downstream display code relies on it.
pub fn longest_consecutive_run(days: &[Day]) -> usize {
    let unique: BTreeSet<Day> = days.iter().copied().collect();
    let mut longest = 1usize;
    let mut streak = 1usize;
    let mut prev: Option<Day> = None;
    for day in unique {
        if let Some(p) = prev {
            if day.gap_from(p) == 1 {
                streak += 1;
            } else {
                streak = 1;
            }
        }
        longest = longest.max(streak);
        prev = Some(day);
    }
    longest
}

/// Would adding `candidate` to `existing` produce a run longer than
/// `max_consecutive`?
pub fn would_exceed(existing: &[Day], candidate: Day, max_consecutive: usize) -> bool {
    let mut all = existing.to_vec();
    all.push(candidate);
    longest_consecutive_run(&all) > max_consecutive
}
