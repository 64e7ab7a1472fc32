//! Reconciliation Sweep
//!
//! Background passes that repair state left behind by aborts, crashed hosts
//! and deleted spaces. Cleaners run independently of the engine and only
//! look at persisted state.
//!
//! # Architecture
//!
//! - [`aborted`]: Ends aborted operations whose instance is still active
//! - [`stale_locks`]: Releases locks of inactive operations
//! - [`orphaned`]: Purges data of deleted spaces

pub mod aborted;
pub mod orphaned;
pub mod stale_locks;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::sync::watch;

use crate::config::CleanupConfig;
use crate::errors::{CleanupError, ConfigError};
use crate::execution::supervisor::Clock;

pub use aborted::AbortedOperationsCleaner;
pub use orphaned::OrphanedDataCleaner;
pub use stale_locks::StaleLockCleaner;

/// One reconciliation pass.
pub trait Cleaner: Send + Sync {
    fn name(&self) -> &str;

    /// Repairs what is older than `expiration`; returns how many entries
    /// were repaired.
    fn execute(&self, expiration: DateTime<Utc>) -> Result<usize, CleanupError>;
}

#[derive(Debug, Clone)]
pub struct CleanerRun {
    pub cleaner: String,
    pub result: Result<usize, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub runs: Vec<CleanerRun>,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.runs
            .iter()
            .filter_map(|run| run.result.as_ref().ok())
            .sum()
    }

    pub fn failures(&self) -> usize {
        self.runs.iter().filter(|run| run.result.is_err()).count()
    }
}

/// Runs the cleaners in order, once or on an interval.
pub struct CleanUpJob {
    cleaners: Vec<Arc<dyn Cleaner>>,
    grace_window: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl CleanUpJob {
    pub fn new(
        cleaners: Vec<Arc<dyn Cleaner>>,
        config: &CleanupConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            cleaners,
            grace_window: config.grace_window()?,
            clock,
        })
    }

    pub fn cleaner_names(&self) -> Vec<&str> {
        self.cleaners.iter().map(|cleaner| cleaner.name()).collect()
    }

    /// Runs every cleaner once. A failing cleaner is logged and the next
    /// one still runs.
    pub fn run_once(&self) -> CleanupReport {
        let expiration = self.clock.now() - self.grace_window;
        info!("Starting clean-up with expiration time {}", expiration);

        let mut report = CleanupReport::default();
        for cleaner in &self.cleaners {
            let result = match cleaner.execute(expiration) {
                Ok(count) => {
                    debug!("Cleaner '{}' repaired {} entries", cleaner.name(), count);
                    Ok(count)
                }
                Err(e) => {
                    error!("Cleaner '{}' failed: {}", cleaner.name(), e);
                    Err(e.to_string())
                }
            };
            report.runs.push(CleanerRun {
                cleaner: cleaner.name().to_string(),
                result,
            });
        }

        info!(
            "Clean-up finished: {} entries repaired, {} cleaners failed",
            report.total(),
            report.failures()
        );
        report
    }

    /// Runs a pass every `interval` until `shutdown` turns true or its
    /// sender is dropped. Passes run on the blocking pool.
    pub async fn run_periodically(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let job = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || job.run_once()).await {
                        error!("Clean-up pass did not complete: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stopping periodic clean-up");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::errors::StoreError;
    use crate::execution::supervisor::ManualClock;

    struct Recording {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
        expirations: Mutex<Vec<DateTime<Utc>>>,
    }

    impl Recording {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                calls: AtomicUsize::new(0),
                expirations: Mutex::new(Vec::new()),
            })
        }
    }

    impl Cleaner for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(&self, expiration: DateTime<Utc>) -> Result<usize, CleanupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.expirations.lock().unwrap().push(expiration);
            if self.fail {
                Err(StoreError::Unavailable("database down".to_string()).into())
            } else {
                Ok(2)
            }
        }
    }

    #[test]
    fn test_failing_cleaner_does_not_stop_others() {
        let now = Utc::now();
        let first = Recording::new("first", true);
        let second = Recording::new("second", false);
        let cleaners: Vec<Arc<dyn Cleaner>> = vec![first.clone(), second.clone()];
        let job = CleanUpJob::new(
            cleaners,
            &CleanupConfig::default(),
            Arc::new(ManualClock::new(now)),
        )
        .unwrap();

        let report = job.run_once();

        assert_eq!(report.failures(), 1);
        assert_eq!(report.total(), 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            second.expirations.lock().unwrap()[0],
            now - chrono::Duration::minutes(30)
        );
        assert_eq!(report.runs[0].cleaner, "first");
    }

    #[test]
    fn test_out_of_range_grace_window_rejected() {
        let mut config = CleanupConfig::default();
        config.grace_window_minutes = u64::MAX;
        let result = CleanUpJob::new(Vec::new(), &config, Arc::new(ManualClock::new(Utc::now())));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_periodic_job_stops_on_shutdown() {
        let cleaner = Recording::new("counting", false);
        let job = Arc::new(CleanUpJob::new(
            vec![cleaner.clone() as Arc<dyn Cleaner>],
            &CleanupConfig::default(),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(job.run_periodically(Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(45)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(cleaner.calls.load(Ordering::SeqCst) >= 2);
    }
}
