//! Pure task-selection policy: the blocking filter, blocker-aware ordering,
//! and free-slot accounting used by the reconciler.
//!
//! Ordering is most-blocking first, then highest priority, then oldest.
//! Clearing blockers first maximizes downstream throughput; priority breaks
//! ties among non-blockers; FIFO gives fairness within a tie.

use crate::models::Task;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Sorts after any real timestamp, so tasks without `created_at` go last
/// within a tie.
const CREATED_AT_SENTINEL: &str = "~";

/// Filter out currently-blocked tasks and order the rest. Returns the
/// ordered candidates and the number filtered out.
///
/// With `disable_blocking` set this is an exact pass-through: no filtering,
/// no blocker counting, no reordering.
pub fn order_candidates(tasks: Vec<Task>, disable_blocking: bool) -> (Vec<Task>, u64) {
    if disable_blocking {
        return (tasks, 0);
    }

    let counts = blocker_counts(&tasks);
    let (mut eligible, blocked) = filter_blocked(tasks);
    sort_candidates(&mut eligible, &counts);
    (eligible, blocked)
}

/// Remove every task with `is_currently_blocked`, counting the removals.
pub fn filter_blocked(tasks: Vec<Task>) -> (Vec<Task>, u64) {
    let before = tasks.len();
    let eligible: Vec<Task> = tasks.into_iter().filter(|t| !t.is_currently_blocked).collect();
    let blocked = (before - eligible.len()) as u64;
    (eligible, blocked)
}

/// How many tasks in `tasks` each task id blocks. Blockers referenced from
/// outside the candidate list contribute nothing.
pub fn blocker_counts(tasks: &[Task]) -> HashMap<String, usize> {
    let ids: std::collections::HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut counts = HashMap::new();
    for task in tasks {
        if let Some(blocker) = task.blocked_by_task_id.as_deref() {
            if ids.contains(blocker) {
                *counts.entry(blocker.to_string()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Stable sort by `(-blocker_count, -priority, created_at_or_sentinel)`.
/// Full ties keep the task service's order.
pub fn sort_candidates(tasks: &mut [Task], counts: &HashMap<String, usize>) {
    tasks.sort_by(|a, b| {
        let key = |t: &Task| {
            (
                Reverse(counts.get(&t.id).copied().unwrap_or(0)),
                Reverse(t.priority),
            )
        };
        key(a)
            .cmp(&key(b))
            .then_with(|| created_at_key(a).cmp(created_at_key(b)))
    });
}

fn created_at_key(task: &Task) -> &str {
    task.created_at.as_deref().unwrap_or(CREATED_AT_SENTINEL)
}

/// Free slots for one agent given its configured limit and the number of
/// leases it currently holds.
pub fn free_slots(limit: u32, in_flight: usize) -> u32 {
    limit.saturating_sub(in_flight.min(u32::MAX as usize) as u32)
}

/// The agent with the most free slots; ties go to the lexicographically
/// smallest name. Returns the winner even at zero slots, which the caller
/// treats as "stop assigning".
pub fn pick_agent(free: &BTreeMap<String, u32>) -> Option<(&str, u32)> {
    let mut best: Option<(&str, u32)> = None;
    for (name, &slots) in free {
        match best {
            Some((_, top)) if slots <= top => {}
            _ => best = Some((name.as_str(), slots)),
        }
    }
    best
}
