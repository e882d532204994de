//! Job queues

use gpusim_core::{JobKey, SimError, SimResult};
use std::cmp::Ordering;
use std::collections::VecDeque;

/// How a queue orders the jobs inserted into it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrdering {
    /// Jobs stay at the position they were inserted at
    Fifo,
    /// Jobs are kept sorted by ascending priority, then submit time
    Priority,
}

/// A queued job handle with the attributes the queue orders by
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub key: JobKey,
    pub submit_time: f64,
    pub priority: f64,
}

impl QueueEntry {
    fn rank(&self, other: &QueueEntry) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.submit_time.total_cmp(&other.submit_time))
    }
}

/// One or more ordered job queues
///
/// The manager is policy-agnostic: callers decide queue and position, the
/// queue's ordering decides how the position hint is honoured.
#[derive(Debug, Clone)]
pub struct JobQueueManager {
    queues: Vec<VecDeque<QueueEntry>>,
    ordering: QueueOrdering,
}

impl JobQueueManager {
    /// Create `num_queues` empty queues
    pub fn new(num_queues: usize, ordering: QueueOrdering) -> Self {
        Self {
            queues: vec![VecDeque::new(); num_queues],
            ordering,
        }
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn ordering(&self) -> QueueOrdering {
        self.ordering
    }

    pub fn queues(&self) -> &[VecDeque<QueueEntry>] {
        &self.queues
    }

    /// Number of jobs in queue `queue_idx`, zero for an unknown queue
    pub fn queue_len(&self, queue_idx: usize) -> usize {
        self.queues.get(queue_idx).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Every queued entry, queue by queue
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.queues.iter().flatten()
    }

    /// Peek at the entry at `pos` of queue `queue_idx`
    pub fn get_next_job(&self, queue_idx: usize, pos: usize) -> Option<&QueueEntry> {
        self.queues.get(queue_idx)?.get(pos)
    }

    /// Remove the entry at `pos` of queue `queue_idx`
    pub fn pop(&mut self, queue_idx: usize, pos: usize) -> Option<QueueEntry> {
        self.queues.get_mut(queue_idx)?.remove(pos)
    }

    /// Insert an entry into queue `queue_idx`
    ///
    /// FIFO queues insert at `pos` (clamped to the tail). Priority queues
    /// place the entry among its equal-rank peers, as close to `pos` as the
    /// ordering allows.
    pub fn insert(&mut self, entry: QueueEntry, queue_idx: usize, pos: usize) -> SimResult<()> {
        let num_queues = self.queues.len();
        let queue = self.queues.get_mut(queue_idx).ok_or_else(|| {
            SimError::Config(format!(
                "queue {} does not exist ({} queues configured)",
                queue_idx, num_queues
            ))
        })?;

        let idx = match self.ordering {
            QueueOrdering::Fifo => pos.min(queue.len()),
            QueueOrdering::Priority => {
                let lower = queue.partition_point(|e| e.rank(&entry) == Ordering::Less);
                let upper = queue.partition_point(|e| e.rank(&entry) != Ordering::Greater);
                pos.clamp(lower, upper)
            }
        };
        queue.insert(idx, entry);
        Ok(())
    }

    /// Count queued jobs, restricted to those already submitted when `now` is given
    pub fn total_jobs(&self, now: Option<u64>) -> usize {
        match now {
            Some(now) => self.iter().filter(|e| e.submit_time <= now as f64).count(),
            None => self.iter().count(),
        }
    }

    /// Drain every queue
    pub fn pop_all_queuing_jobs(&mut self) -> Vec<QueueEntry> {
        self.queues.iter_mut().flat_map(|q| q.drain(..)).collect()
    }

    /// Stable sort of every queue by submit time
    ///
    /// Priority queues keep their priority order and only settle ties by
    /// submit time, so inserts can still binary-search them.
    pub fn sort_by_submit_time(&mut self) {
        for queue in &mut self.queues {
            let entries = queue.make_contiguous();
            match self.ordering {
                QueueOrdering::Fifo => {
                    entries.sort_by(|a, b| a.submit_time.total_cmp(&b.submit_time))
                }
                QueueOrdering::Priority => entries.sort_by(|a, b| a.rank(b)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn entries(n: usize) -> Vec<QueueEntry> {
        let mut arena: SlotMap<JobKey, ()> = SlotMap::with_key();
        (0..n)
            .map(|i| QueueEntry {
                key: arena.insert(()),
                submit_time: i as f64,
                priority: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_fifo_insert_and_pop() {
        let mut q = JobQueueManager::new(1, QueueOrdering::Fifo);
        let e = entries(3);
        for (i, entry) in e.iter().enumerate() {
            q.insert(entry.clone(), 0, i).unwrap();
        }

        assert_eq!(q.queue_len(0), 3);
        assert_eq!(q.get_next_job(0, 0).unwrap().key, e[0].key);
        assert_eq!(q.pop(0, 1).unwrap().key, e[1].key);
        assert_eq!(q.pop(0, 0).unwrap().key, e[0].key);
        assert_eq!(q.queue_len(0), 1);
    }

    #[test]
    fn test_fifo_insert_clamps_to_tail() {
        let mut q = JobQueueManager::new(1, QueueOrdering::Fifo);
        let e = entries(2);
        q.insert(e[0].clone(), 0, 10).unwrap();
        q.insert(e[1].clone(), 0, 0).unwrap();
        assert_eq!(q.get_next_job(0, 0).unwrap().key, e[1].key);
        assert_eq!(q.get_next_job(0, 1).unwrap().key, e[0].key);
    }

    #[test]
    fn test_priority_orders_by_priority_then_submit_time() {
        let mut q = JobQueueManager::new(1, QueueOrdering::Priority);
        let mut e = entries(3);
        e[0].priority = 3.0;
        e[1].priority = 1.0;
        e[2].priority = 1.0;
        e[2].submit_time = -1.0;
        for entry in &e {
            q.insert(entry.clone(), 0, q.queue_len(0)).unwrap();
        }

        let order: Vec<JobKey> = q.iter().map(|x| x.key).collect();
        assert_eq!(order, vec![e[2].key, e[1].key, e[0].key]);
    }

    #[test]
    fn test_priority_reinsert_keeps_position_among_equals() {
        let mut q = JobQueueManager::new(1, QueueOrdering::Priority);
        let mut e = entries(3);
        for entry in &mut e {
            entry.submit_time = 0.0;
        }
        for entry in &e {
            q.insert(entry.clone(), 0, q.queue_len(0)).unwrap();
        }

        let head = q.pop(0, 0).unwrap();
        q.insert(head, 0, 0).unwrap();
        assert_eq!(q.get_next_job(0, 0).unwrap().key, e[0].key);
    }

    #[test]
    fn test_insert_into_missing_queue_fails() {
        let mut q = JobQueueManager::new(1, QueueOrdering::Fifo);
        let e = entries(1);
        assert!(matches!(
            q.insert(e[0].clone(), 3, 0),
            Err(SimError::Config(_))
        ));
    }

    #[test]
    fn test_total_jobs_and_drain() {
        let mut q = JobQueueManager::new(2, QueueOrdering::Fifo);
        let e = entries(3);
        q.insert(e[0].clone(), 0, 0).unwrap();
        q.insert(e[1].clone(), 1, 0).unwrap();
        q.insert(e[2].clone(), 1, 1).unwrap();

        assert_eq!(q.total_jobs(None), 3);
        assert_eq!(q.total_jobs(Some(1)), 2);

        let drained = q.pop_all_queuing_jobs();
        assert_eq!(drained.len(), 3);
        assert!(q.is_empty());
        assert!(q.pop(0, 0).is_none());
    }

    #[test]
    fn test_sort_by_submit_time() {
        let mut q = JobQueueManager::new(1, QueueOrdering::Fifo);
        let e = entries(3);
        q.insert(e[2].clone(), 0, 0).unwrap();
        q.insert(e[0].clone(), 0, 1).unwrap();
        q.insert(e[1].clone(), 0, 2).unwrap();

        q.sort_by_submit_time();
        let times: Vec<f64> = q.iter().map(|x| x.submit_time).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_sort_keeps_priority_order() {
        let mut q = JobQueueManager::new(1, QueueOrdering::Priority);
        let mut e = entries(3);
        e[0].priority = 0.9;
        e[1].priority = 0.1;
        e[2].priority = 0.5;
        q.insert(e[0].clone(), 0, 0).unwrap();
        q.insert(e[1].clone(), 0, 1).unwrap();

        q.sort_by_submit_time();
        q.insert(e[2].clone(), 0, q.queue_len(0)).unwrap();

        let order: Vec<f64> = q.iter().map(|x| x.priority).collect();
        assert_eq!(order, vec![0.1, 0.5, 0.9]);
    }
}
