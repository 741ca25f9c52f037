// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

use crate::logging::macros::*;
use crate::work::WorkUnit;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Number of job ids the chip can tell apart
pub const JOB_SLOTS: usize = 128;
/// Distance between consecutively assigned job ids
pub const JOB_ID_STRIDE: u8 = 24;

/// Registry of outstanding work indexed by job id
///
/// Job ids are assigned in a cycle `0, 24, 48, ... (previous + 24) % 128` so that consecutive
/// jobs don't land next to each other in the chip job buffer. Storing work under an id that is
/// still occupied releases the previous work.
///
/// The registry is shared by the send context (`submit`, `mark_valid`) and the receive context
/// (`is_valid`, `take`). Locks are held only for a single slot or flag access.
pub struct JobRegistry {
    /// Id the next submitted work gets
    next_job_id: AtomicU8,
    /// Work currently associated with each job id
    active_jobs: Mutex<Vec<Option<Arc<WorkUnit>>>>,
    /// Results for job ids that are not flagged here are stale
    valid_jobs: Mutex<[bool; JOB_SLOTS]>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            next_job_id: AtomicU8::new(0),
            active_jobs: Mutex::new(vec![None; JOB_SLOTS]),
            valid_jobs: Mutex::new([false; JOB_SLOTS]),
        }
    }

    fn lock_active(&self) -> MutexGuard<Vec<Option<Arc<WorkUnit>>>> {
        // slots are replaced in one assignment, poisoning leaves them consistent
        self.active_jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_valid(&self) -> MutexGuard<[bool; JOB_SLOTS]> {
        self.valid_jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate next job id, concurrent callers never get the same one
    fn alloc_next_job_id(&self) -> u8 {
        let advance =
            |job_id: u8| Some(((job_id as usize + JOB_ID_STRIDE as usize) % JOB_SLOTS) as u8);
        match self
            .next_job_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
        {
            Ok(job_id) | Err(job_id) => job_id,
        }
    }

    /// Store `work` under a newly allocated job id and flag the id as valid
    ///
    /// Work previously stored under the same id is released before the new one is installed.
    /// Returns: the job id
    pub fn submit(&self, work: Arc<WorkUnit>) -> u8 {
        let job_id = self.alloc_next_job_id();
        let slot = job_id as usize;

        // results for the superseded work must not be matched against the new one
        self.lock_valid()[slot] = false;
        {
            let mut active_jobs = self.lock_active();
            if let Some(previous) = active_jobs[slot].take() {
                trace!("Releasing work superseded in slot {:#04x}", job_id);
                drop(previous);
            }
            active_jobs[slot] = Some(work);
        }
        self.mark_valid(job_id);

        job_id
    }

    /// Flag `job_id` as outstanding, results for it will be accepted
    pub fn mark_valid(&self, job_id: u8) {
        if let Some(flag) = self.lock_valid().get_mut(job_id as usize) {
            *flag = true;
        }
    }

    /// Stop accepting results for `job_id` (e.g. the job never left the host)
    pub fn invalidate(&self, job_id: u8) {
        if let Some(flag) = self.lock_valid().get_mut(job_id as usize) {
            *flag = false;
        }
    }

    /// Stop accepting results for all outstanding jobs at once (new block)
    pub fn invalidate_all(&self) {
        let mut valid_jobs = self.lock_valid();
        for flag in valid_jobs.iter_mut() {
            *flag = false;
        }
    }

    pub fn is_valid(&self, job_id: u8) -> bool {
        self.lock_valid()
            .get(job_id as usize)
            .cloned()
            .unwrap_or(false)
    }

    /// Look-up work stored under `job_id`
    ///
    /// The work stays in the registry until superseded, the caller gets its own reference.
    pub fn take(&self, job_id: u8) -> Option<Arc<WorkUnit>> {
        self.lock_active()
            .get(job_id as usize)
            .and_then(|slot| slot.clone())
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::work;

    use std::sync::Barrier;
    use std::thread;

    /// Test that job ids follow the 24-stride cycle
    #[test]
    fn test_job_id_sequence() {
        let registry = JobRegistry::new();
        let ids: Vec<u8> = (0..7)
            .map(|i| registry.submit(Arc::new(work::test::prepare(i))))
            .collect();
        assert_eq!(ids, vec![0, 24, 48, 72, 96, 120, 16]);
    }

    /// Test that `job_id` wraps around and visits multiples of 8 only
    #[test]
    fn test_job_id_wrap_around() {
        let registry = JobRegistry::new();
        let work = Arc::new(work::test::prepare(0));
        let ids: Vec<u8> = (0..16).map(|_| registry.submit(work.clone())).collect();
        assert!(ids.iter().all(|id| id % 8 == 0 && (*id as usize) < JOB_SLOTS));
        // 16 distinct ids before the cycle repeats
        assert_eq!(registry.submit(work.clone()), ids[0]);
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 16);
    }

    /// Test that stored work can be found and results for it are accepted
    #[test]
    fn test_submit_and_take() {
        let registry = JobRegistry::new();
        let work = Arc::new(work::test::prepare(1));
        let job_id = registry.submit(work.clone());

        assert!(registry.is_valid(job_id));
        let found = registry.take(job_id).expect("work is stored");
        assert!(Arc::ptr_eq(&found, &work));
        // taking doesn't remove the work
        assert!(registry.take(job_id).is_some());

        assert!(!registry.is_valid(job_id + 8));
        assert!(registry.take(job_id + 8).is_none());
        // ids out of range are never valid
        assert!(!registry.is_valid(200));
        assert!(registry.take(200).is_none());
    }

    /// Test that reusing a job id releases the work stored under it
    #[test]
    fn test_reuse_releases_previous_work() {
        let registry = JobRegistry::new();
        let first = Arc::new(work::test::prepare(0));
        let first_ref = Arc::downgrade(&first);
        assert_eq!(registry.submit(first), 0);
        assert!(first_ref.upgrade().is_some());

        // go once around the cycle, the 17th submission lands in slot 0 again
        for i in 1..16 {
            assert_ne!(registry.submit(Arc::new(work::test::prepare(i))), 0);
            assert!(first_ref.upgrade().is_some(), "work released too early");
        }
        let second = Arc::new(work::test::prepare(16));
        assert_eq!(registry.submit(second.clone()), 0);

        assert!(first_ref.upgrade().is_none(), "superseded work not released");
        let found = registry.take(0).expect("work is stored");
        assert!(Arc::ptr_eq(&found, &second));
        assert!(registry.is_valid(0));
    }

    #[test]
    fn test_validity_flags() {
        let registry = JobRegistry::new();
        let a = registry.submit(Arc::new(work::test::prepare(0)));
        let b = registry.submit(Arc::new(work::test::prepare(1)));
        assert!(registry.is_valid(a) && registry.is_valid(b));

        registry.invalidate(a);
        assert!(!registry.is_valid(a));
        assert!(registry.is_valid(b));

        registry.invalidate_all();
        assert!(!registry.is_valid(a));
        assert!(!registry.is_valid(b));
        // work itself is kept until superseded
        assert!(registry.take(b).is_some());

        registry.mark_valid(b);
        assert!(registry.is_valid(b));
    }

    /// Several send contexts share one registry, no job id is handed out twice in a row
    #[test]
    fn test_concurrent_submitters() {
        const THREADS: usize = 4;
        const SUBMITS: usize = 64;

        let registry = Arc::new(JobRegistry::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let senders: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (0..SUBMITS)
                        .map(|i| registry.submit(Arc::new(work::test::prepare(i as u32))))
                        .collect::<Vec<u8>>()
                })
            })
            .collect();

        let mut counts = [0usize; JOB_SLOTS];
        for sender in senders {
            for job_id in sender.join().expect("sender panicked") {
                counts[job_id as usize] += 1;
            }
        }
        // 256 allocations go around the 16-id cycle exactly 16 times
        for (job_id, count) in counts.iter().enumerate() {
            let expected = if job_id % 8 == 0 { THREADS * SUBMITS / 16 } else { 0 };
            assert_eq!(*count, expected, "job id {:#04x}", job_id);
        }
    }

    /// Send and receive context hammer the registry from different threads
    #[test]
    fn test_concurrent_access() {
        let registry = Arc::new(JobRegistry::new());

        let sender = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..2000 {
                    let job_id = registry.submit(Arc::new(work::test::prepare(i)));
                    assert!(job_id % 8 == 0);
                }
            })
        };
        let receiver = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..2000usize {
                    let job_id = ((i * JOB_ID_STRIDE as usize) % JOB_SLOTS) as u8;
                    if registry.is_valid(job_id) {
                        // a valid id always has work behind it
                        assert!(registry.take(job_id).is_some());
                    }
                }
            })
        };
        sender.join().expect("sender panicked");
        receiver.join().expect("receiver panicked");

        let valid = (0..JOB_SLOTS as u8).filter(|id| registry.is_valid(*id)).count();
        assert_eq!(valid, 16);
    }
}
