//! Job registry: owns every in-flight job, indexed both by an internal key
//! assigned at construction and, once known, by child PID.
//!
//! spec.md §4.2 describes a single PID-keyed fanout table. This crate
//! inserts a job into the scheduler *before* its PID exists (spec.md
//! §4.5.4 records the scheduler entry ahead of calling `start_cmd`), so a
//! PID cannot be the arena's primary key. `Registry` is therefore the
//! owning arena keyed by `JobKey`, with the PID fanout as a secondary
//! index populated by `attach_pid` once the spawn adapter returns — see
//! DESIGN.md's Open Question resolutions.

use std::collections::HashMap;

use crate::job::Job;

/// Default expected fanout capacity, per spec.md §4.2.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey(u64);

pub struct Registry {
    next_id: u64,
    jobs: HashMap<u64, Job>,
    by_pid: HashMap<u32, u64>,
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Registry {
            next_id: 0,
            jobs: HashMap::with_capacity(capacity),
            by_pid: HashMap::with_capacity(capacity),
        }
    }

    /// Insert a job that has not yet been spawned (no PID). Returns its key.
    pub fn insert_pending(&mut self, job: Job) -> JobKey {
        let id = self.next_id;
        self.next_id += 1;
        self.jobs.insert(id, job);
        JobKey(id)
    }

    /// Record the PID once `start_cmd` has succeeded, per spec.md §4.5.4.
    pub fn attach_pid(&mut self, key: JobKey, pid: u32) {
        if let Some(job) = self.jobs.get_mut(&key.0) {
            job.pid = pid;
        }
        self.by_pid.insert(pid, key.0);
    }

    pub fn lookup_by_key(&self, key: JobKey) -> Option<&Job> {
        self.jobs.get(&key.0)
    }

    pub fn lookup_by_key_mut(&mut self, key: JobKey) -> Option<&mut Job> {
        self.jobs.get_mut(&key.0)
    }

    pub fn lookup_by_pid(&self, pid: u32) -> Option<&Job> {
        let id = self.by_pid.get(&pid)?;
        self.jobs.get(id)
    }

    pub fn key_for_pid(&self, pid: u32) -> Option<JobKey> {
        self.by_pid.get(&pid).copied().map(JobKey)
    }

    /// Remove and return a job by key, dropping its PID fanout entry if any.
    pub fn remove(&mut self, key: JobKey) -> Option<Job> {
        let job = self.jobs.remove(&key.0)?;
        if job.pid != 0 {
            self.by_pid.remove(&job.pid);
        }
        Some(job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Visit every still-resident job. Used by emergency shutdown (spec.md
    /// §4.5.10), which must reach every job regardless of PID-fanout state.
    pub fn iter(&self) -> impl Iterator<Item = (JobKey, &Job)> {
        self.jobs.iter().map(|(id, job)| (JobKey(*id), job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, Timestamp};

    fn sample_job() -> Job {
        Job::new(b"1".to_vec(), "true".to_string(), 60, Vec::new(), Timestamp::now())
    }

    #[test]
    fn insert_then_attach_pid_is_lookupable_both_ways() {
        let mut reg = Registry::with_capacity(16);
        let key = reg.insert_pending(sample_job());
        assert!(reg.lookup_by_pid(1234).is_none());
        reg.attach_pid(key, 1234);
        assert_eq!(reg.lookup_by_pid(1234).unwrap().pid, 1234);
        assert_eq!(reg.lookup_by_key(key).unwrap().pid, 1234);
    }

    #[test]
    fn remove_clears_both_indices() {
        let mut reg = Registry::with_capacity(16);
        let key = reg.insert_pending(sample_job());
        reg.attach_pid(key, 42);
        assert_eq!(reg.len(), 1);
        let removed = reg.remove(key).unwrap();
        assert_eq!(removed.pid, 42);
        assert!(reg.lookup_by_pid(42).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn iter_visits_every_resident_job() {
        let mut reg = Registry::with_capacity(16);
        reg.insert_pending(sample_job());
        reg.insert_pending(sample_job());
        assert_eq!(reg.iter().count(), 2);
    }

    #[test]
    fn default_capacity_matches_spec() {
        assert_eq!(DEFAULT_CAPACITY, 4096);
    }
}
