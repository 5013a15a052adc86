//! Cron-style scheduler for recurring gateway tasks.
//!
//! Each registered schedule runs on its own spawned loop. Handlers execute
//! on a child task so a panic is contained and logged rather than killing
//! the loop. Expressions use six fields (seconds first) and fire in the
//! schedule's own timezone.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cron::Schedule;
use metrics::counter;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::error::AppError;

const TARGET: &str = "esigate::scheduler";

#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self);
}

#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub name: String,
    /// Six-field cron expression, seconds first.
    pub expression: String,
    pub timezone: chrono_tz::Tz,
    /// Fire once immediately when the schedule starts.
    pub run_on_init: bool,
}

#[derive(Debug, Clone)]
pub struct ScheduleSummary {
    pub name: String,
    pub expression: String,
    pub timezone: String,
    pub running: bool,
    pub last_fire: Option<OffsetDateTime>,
    pub next_fire: Option<OffsetDateTime>,
}

struct Entry {
    spec: ScheduleSpec,
    schedule: Schedule,
    task: Arc<dyn ScheduledTask>,
    handle: Option<JoinHandle<()>>,
    last_fire: Arc<RwLock<Option<OffsetDateTime>>>,
}

#[derive(Default)]
pub struct Scheduler {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Scheduler {
    pub fn validate_expression(expression: &str) -> Result<Schedule, AppError> {
        Schedule::from_str(expression)
            .map_err(|err| AppError::validation(format!("invalid cron expression: {err}")))
    }

    /// Register a schedule without starting it. Names are unique.
    pub fn register(
        &self,
        spec: ScheduleSpec,
        task: Arc<dyn ScheduledTask>,
    ) -> Result<(), AppError> {
        let schedule = Self::validate_expression(&spec.expression)?;
        let mut entries = self.write("register");
        if entries.contains_key(&spec.name) {
            return Err(AppError::validation(format!(
                "schedule `{}` already registered",
                spec.name
            )));
        }
        debug!(target: TARGET, name = %spec.name, expression = %spec.expression, "schedule registered");
        entries.insert(
            spec.name.clone(),
            Entry {
                spec,
                schedule,
                task,
                handle: None,
                last_fire: Arc::new(RwLock::new(None)),
            },
        );
        Ok(())
    }

    /// Start a registered schedule. Returns false (with a warning) when it
    /// is already running.
    pub fn start(&self, name: &str) -> Result<bool, AppError> {
        let mut entries = self.write("start");
        let entry = entries.get_mut(name).ok_or(AppError::NotFound)?;

        if entry.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(target: TARGET, name, "schedule already running");
            return Ok(false);
        }

        let spec = entry.spec.clone();
        let schedule = entry.schedule.clone();
        let task = entry.task.clone();
        let last_fire = entry.last_fire.clone();

        info!(target: TARGET, name, expression = %spec.expression, timezone = %spec.timezone, "schedule started");
        entry.handle = Some(tokio::spawn(async move {
            if spec.run_on_init {
                fire(&spec.name, &task, &last_fire).await;
            }
            loop {
                let Some(next) = schedule.upcoming(spec.timezone).next() else {
                    info!(target: TARGET, name = %spec.name, "schedule has no future fires, stopping");
                    break;
                };
                let wait = (next.with_timezone(&chrono::Utc) - chrono::Utc::now())
                    .to_std()
                    .unwrap_or_default();
                tokio::time::sleep(wait).await;
                fire(&spec.name, &task, &last_fire).await;
            }
        }));
        Ok(true)
    }

    /// Stop a running schedule. Idempotent; returns whether it was running.
    pub fn stop(&self, name: &str) -> bool {
        let mut entries = self.write("stop");
        match entries.get_mut(name).and_then(|entry| entry.handle.take()) {
            Some(handle) => {
                handle.abort();
                info!(target: TARGET, name, "schedule stopped");
                true
            }
            None => {
                warn!(target: TARGET, name, "schedule not running");
                false
            }
        }
    }

    pub fn stop_all(&self) {
        let mut entries = self.write("stop_all");
        for (name, entry) in entries.iter_mut() {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
                info!(target: TARGET, name = %name, "schedule stopped");
            }
        }
    }

    pub fn next_fire(&self, name: &str) -> Option<OffsetDateTime> {
        let entries = self.read("next_fire");
        let entry = entries.get(name)?;
        let next = entry.schedule.upcoming(entry.spec.timezone).next()?;
        OffsetDateTime::from_unix_timestamp(next.timestamp()).ok()
    }

    pub fn last_fire(&self, name: &str) -> Option<OffsetDateTime> {
        let entries = self.read("last_fire");
        let entry = entries.get(name)?;
        *read_lock(&entry.last_fire)
    }

    pub fn summary(&self) -> Vec<ScheduleSummary> {
        let entries = self.read("summary");
        let mut summaries: Vec<ScheduleSummary> = entries
            .values()
            .map(|entry| ScheduleSummary {
                name: entry.spec.name.clone(),
                expression: entry.spec.expression.clone(),
                timezone: entry.spec.timezone.to_string(),
                running: entry.handle.as_ref().is_some_and(|h| !h.is_finished()),
                last_fire: *read_lock(&entry.last_fire),
                next_fire: entry
                    .schedule
                    .upcoming(entry.spec.timezone)
                    .next()
                    .and_then(|next| OffsetDateTime::from_unix_timestamp(next.timestamp()).ok()),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    fn read(&self, op: &'static str) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(op, lock_kind = "rwlock.read", result = "poisoned_recovered", "Recovered from poisoned scheduler lock");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self, op: &'static str) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(op, lock_kind = "rwlock.write", result = "poisoned_recovered", "Recovered from poisoned scheduler lock");
                poisoned.into_inner()
            }
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run the handler on a child task so a panic cannot unwind into the loop.
async fn fire(
    name: &str,
    task: &Arc<dyn ScheduledTask>,
    last_fire: &Arc<RwLock<Option<OffsetDateTime>>>,
) {
    debug!(target: TARGET, name, "schedule firing");
    counter!("esigate_schedule_fires_total", "schedule" => name.to_string()).increment(1);
    {
        let mut guard = last_fire
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(OffsetDateTime::now_utc());
    }

    let child = {
        let task = task.clone();
        tokio::spawn(async move { task.run().await })
    };
    if child.await.is_err() {
        error!(target: TARGET, name, "scheduled task panicked");
        counter!("esigate_schedule_panics_total", "schedule" => name.to_string()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct CountingTask {
        runs: AtomicUsize,
    }

    impl CountingTask {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ScheduledTask for CountingTask {
        async fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    // Fires once a year; far enough away that tests never race it.
    const YEARLY: &str = "0 0 0 1 1 *";

    fn spec(name: &str, run_on_init: bool) -> ScheduleSpec {
        ScheduleSpec {
            name: name.to_string(),
            expression: YEARLY.to_string(),
            timezone: chrono_tz::UTC,
            run_on_init,
        }
    }

    #[test]
    fn expression_validation() {
        assert!(Scheduler::validate_expression("0 */2 * * * *").is_ok());
        assert!(Scheduler::validate_expression("not cron").is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let scheduler = Scheduler::default();
        scheduler
            .register(spec("sweep", false), CountingTask::new())
            .expect("first registration");
        let err = scheduler
            .register(spec("sweep", false), CountingTask::new())
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_reports_state() {
        let scheduler = Scheduler::default();
        scheduler
            .register(spec("sweep", false), CountingTask::new())
            .expect("register");

        assert!(scheduler.start("sweep").expect("first start"));
        assert!(!scheduler.start("sweep").expect("second start"));
        assert!(scheduler.stop("sweep"));
        assert!(!scheduler.stop("sweep"));
    }

    #[tokio::test]
    async fn run_on_init_fires_immediately() {
        let scheduler = Scheduler::default();
        let task = CountingTask::new();
        scheduler
            .register(spec("refresh-scan", true), task.clone())
            .expect("register");
        scheduler.start("refresh-scan").expect("start");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.last_fire("refresh-scan").is_some());
        scheduler.stop_all();
    }

    #[tokio::test]
    async fn next_fire_is_in_the_future() {
        let scheduler = Scheduler::default();
        scheduler
            .register(spec("sweep", false), CountingTask::new())
            .expect("register");

        let next = scheduler.next_fire("sweep").expect("next fire");
        assert!(next > OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn summary_reflects_running_state() {
        let scheduler = Scheduler::default();
        scheduler
            .register(spec("sweep", false), CountingTask::new())
            .expect("register");

        let before = scheduler.summary();
        assert_eq!(before.len(), 1);
        assert!(!before[0].running);
        assert!(before[0].next_fire.is_some());

        scheduler.start("sweep").expect("start");
        assert!(scheduler.summary()[0].running);
        scheduler.stop_all();
        assert!(!scheduler.summary()[0].running);
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_the_loop() {
        struct PanickingTask;

        #[async_trait]
        impl ScheduledTask for PanickingTask {
            async fn run(&self) {
                panic!("task exploded");
            }
        }

        let scheduler = Scheduler::default();
        scheduler
            .register(spec("bad", true), Arc::new(PanickingTask))
            .expect("register");
        scheduler.start("bad").expect("start");

        tokio::time::sleep(Duration::from_millis(50)).await;
        // The loop survived the panic and is still running.
        assert!(scheduler.summary()[0].running);
        scheduler.stop_all();
    }
}
