//! Cron-driven tick source.
//!
//! One slot per scan mode in use. When a slot fires, every job registered on it is spawned
//! as its own task, so connectors tick in parallel. A fire that is late (suspend, slow
//! host) collapses into a single tick rather than replaying every missed trigger.

use crate::model::Instant;
use crate::scan_mode::ScanMode;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Job {
    South { south_id: String, scan_mode_id: String },
    North { north_id: String },
}

#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: Job);
}

struct Slot {
    mode: Arc<ScanMode>,
    jobs: Vec<Job>,
    next_fire: Option<Instant>,
}

pub struct Scheduler {
    slots: Mutex<HashMap<String, Slot>>,
    changed: Notify,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(tracker: TaskTracker) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            tracker,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, mode: Arc<ScanMode>, job: Job) {
        {
            let mut slots = self.lock();
            let slot = slots.entry(mode.id.clone()).or_insert_with(|| Slot {
                next_fire: mode.schedule.next_after(&Utc::now()),
                mode: mode.clone(),
                jobs: Vec::new(),
            });
            if !slot.jobs.contains(&job) {
                tracing::debug!(scan_mode = %mode.id, ?job, "job registered");
                slot.jobs.push(job);
            }
        }
        self.changed.notify_one();
    }

    /// Removes every job matching `predicate`; slots left without jobs stop firing.
    pub fn deregister_where(&self, predicate: impl Fn(&Job) -> bool) {
        {
            let mut slots = self.lock();
            for slot in slots.values_mut() {
                slot.jobs.retain(|job| !predicate(job));
            }
            slots.retain(|_, slot| !slot.jobs.is_empty());
        }
        self.changed.notify_one();
    }

    pub fn deregister_south(&self, id: &str) {
        self.deregister_where(|job| matches!(job, Job::South { south_id, .. } if south_id == id));
    }

    pub fn deregister_north(&self, id: &str) {
        self.deregister_where(|job| matches!(job, Job::North { north_id } if north_id == id));
    }

    pub fn scan_mode_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn jobs_for(&self, scan_mode_id: &str) -> Vec<Job> {
        self.lock()
            .get(scan_mode_id)
            .map(|slot| slot.jobs.clone())
            .unwrap_or_default()
    }

    pub fn start(self: Arc<Self>, runner: Arc<dyn JobRunner>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.tracker.clone();
        tracker.spawn(async move { self.run(runner, cancel).await })
    }

    async fn run(&self, runner: Arc<dyn JobRunner>, cancel: CancellationToken) {
        loop {
            let deadline = self.next_deadline();
            let delay = deadline.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.changed.notified() => continue,
                _ = sleep_for(delay) => {}
            }
            let Some(deadline) = deadline else {
                continue;
            };
            // The timer may wake a hair before the wall clock reaches the deadline.
            let now = Utc::now().max(deadline);
            for job in self.take_due(now) {
                let runner = runner.clone();
                self.tracker.spawn(async move { runner.run(job).await });
            }
        }
        tracing::debug!("scheduler stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock().values().filter_map(|slot| slot.next_fire).min()
    }

    /// Collects jobs of every slot due at `now` and moves those slots to their next trigger.
    fn take_due(&self, now: Instant) -> Vec<Job> {
        let mut due = Vec::new();
        for slot in self.lock().values_mut() {
            let Some(fire) = slot.next_fire else {
                continue;
            };
            if fire > now {
                continue;
            }
            due.extend(slot.jobs.iter().cloned());
            let from = fire.max(now);
            slot.next_fire = slot.mode.schedule.next_after(&from);
            if slot.next_fire.is_none() {
                tracing::warn!(scan_mode = %slot.mode.id, "scan mode has no further trigger");
            }
        }
        due
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_mode::CronSchedule;

    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<Job>>,
    }

    #[async_trait]
    impl JobRunner for Recorder {
        async fn run(&self, job: Job) {
            self.jobs.lock().unwrap().push(job);
        }
    }

    fn mode(id: &str, expression: &str) -> Arc<ScanMode> {
        Arc::new(ScanMode {
            id: id.to_string(),
            name: id.to_string(),
            schedule: CronSchedule::parse(id, expression).unwrap(),
        })
    }

    fn south(id: &str, scan_mode_id: &str) -> Job {
        Job::South {
            south_id: id.to_string(),
            scan_mode_id: scan_mode_id.to_string(),
        }
    }

    #[test]
    fn one_slot_per_scan_mode_in_use() {
        let scheduler = Scheduler::new(TaskTracker::new());
        let every_second = mode("every-second", "* * * * * *");
        scheduler.register(every_second.clone(), south("s1", "every-second"));
        scheduler.register(every_second.clone(), south("s1", "every-second"));
        scheduler.register(every_second, Job::North { north_id: "n1".into() });
        scheduler.register(mode("hourly", "0 0 * * * *"), south("s2", "hourly"));

        assert_eq!(scheduler.scan_mode_ids(), vec!["every-second", "hourly"]);
        assert_eq!(scheduler.jobs_for("every-second").len(), 2);

        scheduler.deregister_south("s2");
        assert_eq!(scheduler.scan_mode_ids(), vec!["every-second"]);
        scheduler.deregister_north("n1");
        assert_eq!(scheduler.jobs_for("every-second"), vec![south("s1", "every-second")]);
    }

    #[test]
    fn late_fires_collapse_into_one_tick() {
        let scheduler = Scheduler::new(TaskTracker::new());
        scheduler.register(mode("every-second", "* * * * * *"), south("s1", "every-second"));

        let late = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(scheduler.take_due(late).len(), 1);
        assert!(scheduler.take_due(late).is_empty());
        assert!(scheduler.next_deadline().unwrap() > late);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_registered_jobs_until_cancelled() {
        let scheduler = Arc::new(Scheduler::new(TaskTracker::new()));
        let recorder = Arc::new(Recorder::default());
        scheduler.register(mode("every-second", "* * * * * *"), south("s1", "every-second"));
        let cancel = CancellationToken::new();
        let handle = scheduler.clone().start(recorder.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        handle.await.unwrap();

        let fired = recorder.jobs.lock().unwrap().len();
        assert!(fired >= 2, "fired {fired} times");
    }

    #[tokio::test(start_paused = true)]
    async fn deregistered_jobs_stop_firing() {
        let scheduler = Arc::new(Scheduler::new(TaskTracker::new()));
        let recorder = Arc::new(Recorder::default());
        scheduler.register(mode("every-second", "* * * * * *"), south("s1", "every-second"));
        scheduler.deregister_south("s1");
        let cancel = CancellationToken::new();
        let handle = scheduler.clone().start(recorder.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(recorder.jobs.lock().unwrap().is_empty());
    }
}
