//! Per-node execution accounting.
//!
//! Counters live only in process memory: they are not persisted, not shared
//! with other nodes, and start from zero after a restart. Every map is a
//! `DashMap` of atomics so callers on any thread can update them without a
//! coarse lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use cadence_core::{JobId, JobTrigger, TriggerId};
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use tracing::debug;

use crate::trigger::epoch_second;

#[derive(Debug, Default)]
pub struct TaskContext {
    /// Active executions of each job on this node.
    reentry: DashMap<JobId, AtomicI32>,
    /// Fire attempts per trigger on this node.
    fire_counts: DashMap<TriggerId, AtomicI64>,
    /// Completed executions per job on this node.
    run_counts: DashMap<JobId, AtomicI64>,
    /// Triggers due in the next few seconds, keyed by epoch second.
    staged: DashMap<i64, Vec<JobTrigger>>,
}

/// Fetch `key`, creating a zeroed counter on first use.
///
/// The read path takes only a shard read lock; the write lock is held just
/// long enough to insert a missing counter.
fn counter<K, V>(map: &DashMap<K, V>, key: K) -> Ref<'_, K, V>
where
    K: Eq + std::hash::Hash,
    V: Default,
{
    if let Some(existing) = map.get(&key) {
        return existing;
    }
    map.entry(key).or_default().downgrade()
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    // --- reentry -----------------------------------------------------------

    /// Current number of active executions of `job_id`.
    pub fn reentry_count(&self, job_id: JobId) -> i32 {
        self.reentry
            .get(&job_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Record an execution start; returns the count *before* this one.
    pub fn get_and_increment_reentry(&self, job_id: JobId) -> i32 {
        counter(&self.reentry, job_id).fetch_add(1, Ordering::AcqRel)
    }

    /// Record an execution start; returns the count including this one.
    pub fn increment_reentry(&self, job_id: JobId) -> i32 {
        self.get_and_increment_reentry(job_id) + 1
    }

    /// Record an execution end; returns the remaining count.
    ///
    /// A decrement that races ahead of its matching increment creates the
    /// counter and drives it briefly negative rather than being lost.
    pub fn decrement_reentry(&self, job_id: JobId) -> i32 {
        counter(&self.reentry, job_id).fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn remove_reentry(&self, job_id: JobId) {
        self.reentry.remove(&job_id);
    }

    // --- fire count --------------------------------------------------------

    pub fn fire_count(&self, trigger_id: TriggerId) -> i64 {
        self.fire_counts
            .get(&trigger_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Count one fire attempt; returns the new total.
    pub fn increment_fire_count(&self, trigger_id: TriggerId) -> i64 {
        counter(&self.fire_counts, trigger_id).fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Roll back a fire attempt that was aborted before it was recorded.
    ///
    /// Does nothing when the trigger has no counter (it was removed).
    pub fn decrement_fire_count(&self, trigger_id: TriggerId) -> Option<i64> {
        self.fire_counts
            .get(&trigger_id)
            .map(|c| c.fetch_sub(1, Ordering::AcqRel) - 1)
    }

    pub fn remove_fire_count(&self, trigger_id: TriggerId) {
        self.fire_counts.remove(&trigger_id);
    }

    // --- run count ---------------------------------------------------------

    pub fn run_count(&self, job_id: JobId) -> i64 {
        self.run_counts
            .get(&job_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Count one completed execution; returns the new total.
    pub fn increment_run_count(&self, job_id: JobId) -> i64 {
        counter(&self.run_counts, job_id).fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn remove_run_count(&self, job_id: JobId) {
        self.run_counts.remove(&job_id);
    }

    // --- bulk removal ------------------------------------------------------

    /// Forget every counter owned by a deleted job.
    pub fn remove_job(&self, job_id: JobId) {
        self.remove_reentry(job_id);
        self.remove_run_count(job_id);
    }

    /// Forget every counter and staged entry owned by a deleted trigger.
    pub fn remove_trigger(&self, trigger_id: TriggerId) {
        self.remove_fire_count(trigger_id);
        self.unstage_trigger(trigger_id);
    }

    // --- next-trigger staging ----------------------------------------------

    /// File `trigger` under the epoch second of its `next_fire_time`.
    ///
    /// Triggers without a next fire time are ignored. Staging the same
    /// trigger twice for the same second keeps the newer snapshot.
    pub fn stage_trigger(&self, trigger: &JobTrigger) {
        let Some(at) = trigger.next_fire_time else {
            debug!(trigger_id = %trigger.id, "not staging trigger without next_fire_time");
            return;
        };
        let mut group = self.staged.entry(epoch_second(at)).or_default();
        match group.iter_mut().find(|t| t.id == trigger.id) {
            Some(existing) => *existing = trigger.clone(),
            None => group.push(trigger.clone()),
        }
    }

    /// Remove `trigger_id` from every staged second.
    pub fn unstage_trigger(&self, trigger_id: TriggerId) {
        for mut group in self.staged.iter_mut() {
            group.retain(|t| t.id != trigger_id);
        }
        self.staged.retain(|_, group| !group.is_empty());
    }

    /// Remove and return every group due at or before `second`, oldest first.
    pub fn take_due_triggers(&self, second: i64) -> BTreeMap<i64, Vec<JobTrigger>> {
        let due: Vec<i64> = self
            .staged
            .iter()
            .map(|e| *e.key())
            .filter(|k| *k <= second)
            .collect();

        due.into_iter()
            .filter_map(|k| self.staged.remove(&k))
            .collect()
    }

    /// Total number of staged trigger snapshots.
    pub fn staged_count(&self) -> usize {
        self.staged.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn reentry_counts_up_and_down() {
        let ctx = TaskContext::new();
        let job = JobId(7);
        assert_eq!(ctx.reentry_count(job), 0);
        assert_eq!(ctx.get_and_increment_reentry(job), 0);
        assert_eq!(ctx.increment_reentry(job), 2);
        assert_eq!(ctx.decrement_reentry(job), 1);
        assert_eq!(ctx.reentry_count(job), 1);

        ctx.remove_reentry(job);
        assert_eq!(ctx.reentry_count(job), 0);
    }

    #[test]
    fn early_decrement_goes_negative_then_settles() {
        let ctx = TaskContext::new();
        let job = JobId(1);
        assert_eq!(ctx.decrement_reentry(job), -1);
        assert_eq!(ctx.increment_reentry(job), 0);
    }

    #[test]
    fn concurrent_reentry_updates_are_not_lost() {
        let ctx = Arc::new(TaskContext::new());
        let job = JobId(42);

        let handles: Vec<_> = (0..100)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        ctx.increment_reentry(job);
                    }
                    // Even threads give back everything, odd ones give back half.
                    let decrements = if i % 2 == 0 { 1000 } else { 500 };
                    for _ in 0..decrements {
                        ctx.decrement_reentry(job);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(ctx.reentry_count(job), 50 * 500);
    }

    #[test]
    fn fire_count_rollback_only_touches_existing_counter() {
        let ctx = TaskContext::new();
        let trigger = TriggerId(3);
        assert_eq!(ctx.decrement_fire_count(trigger), None);
        assert_eq!(ctx.fire_count(trigger), 0);

        assert_eq!(ctx.increment_fire_count(trigger), 1);
        assert_eq!(ctx.increment_fire_count(trigger), 2);
        assert_eq!(ctx.decrement_fire_count(trigger), Some(1));
        assert_eq!(ctx.fire_count(trigger), 1);

        ctx.remove_trigger(trigger);
        assert_eq!(ctx.fire_count(trigger), 0);
    }

    #[test]
    fn run_count_is_per_job() {
        let ctx = TaskContext::new();
        ctx.increment_run_count(JobId(1));
        ctx.increment_run_count(JobId(1));
        ctx.increment_run_count(JobId(2));
        assert_eq!(ctx.run_count(JobId(1)), 2);
        assert_eq!(ctx.run_count(JobId(2)), 1);

        ctx.increment_reentry(JobId(1));
        ctx.remove_job(JobId(1));
        assert_eq!(ctx.run_count(JobId(1)), 0);
        assert_eq!(ctx.reentry_count(JobId(1)), 0);
        assert_eq!(ctx.run_count(JobId(2)), 1);
    }

    #[test]
    fn staged_triggers_are_taken_once_due() {
        let ctx = TaskContext::new();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let at = |secs: i64| base + Duration::seconds(secs);

        ctx.stage_trigger(&JobTrigger::fixed_interval(1, 1, 5, base).with_next_fire_time(at(1)));
        ctx.stage_trigger(&JobTrigger::fixed_interval(2, 1, 5, base).with_next_fire_time(at(1)));
        ctx.stage_trigger(&JobTrigger::fixed_interval(3, 1, 5, base).with_next_fire_time(at(3)));
        // Re-staging the same trigger for the same second replaces it.
        ctx.stage_trigger(&JobTrigger::fixed_interval(1, 1, 5, base).with_next_fire_time(at(1)));
        // No next fire time: ignored.
        ctx.stage_trigger(&JobTrigger::fixed_interval(4, 1, 5, base));
        assert_eq!(ctx.staged_count(), 3);

        let due = ctx.take_due_triggers(base.timestamp() + 2);
        assert_eq!(due.len(), 1);
        assert_eq!(due[&(base.timestamp() + 1)].len(), 2);
        assert_eq!(ctx.staged_count(), 1);

        ctx.unstage_trigger(TriggerId(3));
        assert_eq!(ctx.staged_count(), 0);
        assert!(ctx.take_due_triggers(base.timestamp() + 10).is_empty());
    }
}
