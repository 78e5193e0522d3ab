//! Worker fan-out over packages.
//!
//! One job per package: each job runs a full extractor invocation on a
//! blocking thread, bounded by a semaphore and a per-package deadline.
//! Workers never touch the cache; their results flow back to the master
//! in completion order, and the master applies all cache writes.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::warn;

use crate::extractor::Extractor;
use crate::hints::Hint;
use crate::model::{Component, Package};

/// Default per-package processing deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("worker pool failure: {0}")]
    Pool(String),
    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The extractor ran to completion.
    Ok,
    /// The worker raised (panic or deadline); the package is recorded as
    /// seen with a diagnostic hint so the pass can continue.
    Exception,
    /// The pool itself broke down; the pass must stop.
    Failure,
}

/// Result of one extraction job, consumed by the master.
pub struct JobResult {
    pub status: JobStatus,
    pub message: String,
    pub package: Package,
    pub components: Vec<Component>,
}

/// Statistics over one scheduler run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunStats {
    pub processed: usize,
    pub exceptions: usize,
    pub components_found: usize,
}

/// Bounded worker pool driving extraction jobs.
pub struct Scheduler {
    workers: usize,
    deadline: Duration,
}

impl Scheduler {
    pub fn new(workers: usize, deadline: Duration) -> Self {
        Scheduler {
            workers: workers.max(1),
            deadline,
        }
    }

    /// One worker per available core, with the default deadline.
    pub fn with_defaults() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(workers, DEFAULT_DEADLINE)
    }

    /// Fans `packages` out to workers and feeds results to `on_result` in
    /// completion order. The callback is where the master performs its
    /// cache writes; an error there aborts the run.
    pub async fn run(
        &self,
        extractor: Arc<Extractor>,
        packages: Vec<Package>,
        on_result: &mut dyn FnMut(JobResult) -> Result<(), crate::cache::CacheError>,
    ) -> Result<RunStats, SchedulerError> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut jobs: JoinSet<JobResult> = JoinSet::new();

        for pkg in packages {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SchedulerError::Pool(e.to_string()))?;
            let extractor = Arc::clone(&extractor);
            let deadline = self.deadline;

            jobs.spawn(async move {
                let _permit = permit;
                let worker_pkg = pkg.clone();
                let suite = extractor.suite().to_string();
                let arch = pkg.arch.clone();

                let outcome = timeout(
                    deadline,
                    tokio::task::spawn_blocking(move || extractor.process(&worker_pkg)),
                )
                .await;

                match outcome {
                    Ok(Ok(components)) => {
                        let message = format!(
                            "Processed: {} ({}/{}), found {} components",
                            pkg.name,
                            suite,
                            arch,
                            components.iter().filter(|c| !c.is_ignored()).count()
                        );
                        JobResult {
                            status: JobStatus::Ok,
                            message,
                            package: pkg,
                            components,
                        }
                    }
                    Ok(Err(join_error)) => {
                        let mut cpt = Component::new(pkg.clone());
                        cpt.add_hint(Hint::new(
                            "internal-error",
                            [("error", join_error.to_string().as_str())],
                        ));
                        JobResult {
                            status: JobStatus::Exception,
                            message: format!(
                                "worker for {} raised: {join_error}",
                                pkg.pkid()
                            ),
                            package: pkg,
                            components: vec![cpt],
                        }
                    }
                    Err(_elapsed) => {
                        let mut cpt = Component::new(pkg.clone());
                        cpt.add_hint(Hint::new(
                            "extractor-timeout",
                            [("timeout_secs", deadline.as_secs().to_string().as_str())],
                        ));
                        JobResult {
                            status: JobStatus::Exception,
                            message: format!(
                                "worker for {} exceeded the {}s deadline",
                                pkg.pkid(),
                                deadline.as_secs()
                            ),
                            package: pkg,
                            components: vec![cpt],
                        }
                    }
                }
            });
        }

        let mut stats = RunStats::default();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(result) => {
                    stats.processed += 1;
                    match result.status {
                        JobStatus::Ok => {
                            stats.components_found += result
                                .components
                                .iter()
                                .filter(|c| !c.is_ignored())
                                .count();
                        }
                        JobStatus::Exception => {
                            stats.exceptions += 1;
                            warn!(message = %result.message, "worker exception");
                        }
                        JobStatus::Failure => {
                            return Err(SchedulerError::Pool(result.message));
                        }
                    }
                    on_result(result)?;
                }
                Err(join_error) => {
                    // the job wrapper itself died; nothing to attribute
                    // the failure to, so the whole pass is compromised
                    return Err(SchedulerError::Pool(join_error.to_string()));
                }
            }
        }

        Ok(stats)
    }
}
