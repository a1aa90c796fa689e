//! Ready queue: per-priority buckets of round-robin threads.
//!
//! Replaces the source kernel's `last_handled`/`current` queue fields
//! (`original_source/include/core/task/queue.h`) and the teacher's
//! RT/Normal/CFS triple-bucket split with one ordered map keyed by
//! [`Priority`] (spec §9 AVL→ordered-map, spec §3 "Priority queue bucket").

extern crate alloc;

use alloc::collections::{BTreeMap, VecDeque};

use crate::process::thread::ThreadId;
use crate::sched::task::Priority;

/// One priority level's ready threads. `order` rotates on every dispatch, so
/// `n` READY threads in the same bucket each run exactly once per `n`
/// consecutive dispatches (spec §8 "Scheduler fairness within a bucket").
/// `last_dispatched` and `current` track, respectively, the last thread this
/// bucket handed out and the one presently running from it.
struct Bucket {
    order: VecDeque<ThreadId>,
    last_dispatched: Option<ThreadId>,
    current: Option<ThreadId>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            last_dispatched: None,
            current: None,
        }
    }

    fn push(&mut self, tid: ThreadId) {
        self.order.push_back(tid);
    }

    fn remove(&mut self, tid: ThreadId) {
        self.order.retain(|t| *t != tid);
        if self.last_dispatched == Some(tid) {
            self.last_dispatched = None;
        }
        if self.current == Some(tid) {
            self.current = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn dispatch_next(&mut self) -> Option<ThreadId> {
        let tid = self.order.pop_front()?;
        self.order.push_back(tid);
        self.last_dispatched = Some(tid);
        self.current = Some(tid);
        Some(tid)
    }
}

/// Flat priority space over every READY thread in the system.
pub struct ReadyQueue {
    buckets: BTreeMap<Priority, Bucket>,
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    /// Mark `tid` READY at `priority`.
    pub fn enqueue(&mut self, priority: Priority, tid: ThreadId) {
        self.buckets.entry(priority).or_insert_with(Bucket::new).push(tid);
    }

    /// Remove `tid` from the queue, e.g. because it blocked or was killed.
    pub fn remove(&mut self, priority: Priority, tid: ThreadId) {
        if let Some(bucket) = self.buckets.get_mut(&priority) {
            bucket.remove(tid);
            if bucket.is_empty() {
                self.buckets.remove(&priority);
            }
        }
    }

    /// The next thread to dispatch: the highest-priority nonempty bucket's
    /// next round-robin slot (spec §4.6 steps 2-3). Buckets iterate in
    /// ascending priority order, so `Priority::HIGHEST` (0) is checked first.
    pub fn dispatch_next(&mut self) -> Option<ThreadId> {
        self.buckets.values_mut().find_map(|b| b.dispatch_next())
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_within_a_bucket_is_fair() {
        let mut q = ReadyQueue::new();
        q.enqueue(Priority::DEFAULT, ThreadId(1));
        q.enqueue(Priority::DEFAULT, ThreadId(2));
        q.enqueue(Priority::DEFAULT, ThreadId(3));

        let mut counts = [0u32; 4];
        for _ in 0..9 {
            let tid = q.dispatch_next().unwrap();
            counts[tid.0 as usize] += 1;
        }
        assert_eq!(counts[1], 3);
        assert_eq!(counts[2], 3);
        assert_eq!(counts[3], 3);
    }

    #[test]
    fn higher_priority_bucket_runs_first() {
        let mut q = ReadyQueue::new();
        q.enqueue(Priority::LOWEST, ThreadId(1));
        q.enqueue(Priority::HIGHEST, ThreadId(2));
        assert_eq!(q.dispatch_next(), Some(ThreadId(2)));
    }

    #[test]
    fn empty_bucket_is_removed_after_last_thread_leaves() {
        let mut q = ReadyQueue::new();
        q.enqueue(Priority::DEFAULT, ThreadId(1));
        q.remove(Priority::DEFAULT, ThreadId(1));
        assert!(q.is_empty());
    }
}
