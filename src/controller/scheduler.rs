use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Gateway;
use crate::config::SchedulerConfig;
use crate::transport::PortManager;

/// A unit of periodic work.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn initial_delay(&self) -> Duration;

    fn period(&self) -> Duration;

    /// Whether a run occupies one of the shared worker permits. Long-lived
    /// jobs opt out so they cannot starve the short periodic ones.
    fn uses_worker_pool(&self) -> bool {
        true
    }

    async fn run(&self) -> Result<()>;
}

/// Task status tracking
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatus {
    fn started(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.run_count += 1;
    }

    fn succeeded(&mut self, now: DateTime<Utc>) {
        self.last_success = Some(now);
        self.success_count += 1;
        self.last_error = None;
    }

    fn failed(&mut self, message: String) {
        self.error_count += 1;
        self.last_error = Some(message);
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(msg) = payload.downcast_ref::<&str>() {
                format!("panicked: {msg}")
            } else if let Some(msg) = payload.downcast_ref::<String>() {
                format!("panicked: {msg}")
            } else {
                "panicked".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}

/// Runs periodic jobs on a bounded worker pool.
///
/// Every run is spawned on its own task, so a panicking job only marks its
/// own [`TaskStatus`]; the next tick runs it again. Stopping the scheduler
/// cancels the shared port token, which also aborts in-flight serial I/O.
pub struct ScanScheduler {
    jobs: Vec<Arc<dyn ScheduledJob>>,
    statuses: BTreeMap<&'static str, Arc<RwLock<TaskStatus>>>,
    permits: Arc<Semaphore>,
    ports: PortManager,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    grace: Duration,
}

impl ScanScheduler {
    pub fn new(worker_pool_size: usize, ports: PortManager) -> Self {
        let shutdown = ports.shutdown_token();
        Self {
            jobs: Vec::new(),
            statuses: BTreeMap::new(),
            permits: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            ports,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
            grace: Duration::from_secs(5),
        }
    }

    /// Scheduler with the serial scan, network scan and validation jobs.
    pub fn for_gateway(gateway: Arc<Gateway>, cfg: &SchedulerConfig) -> Self {
        let mut scheduler = Self::new(cfg.worker_pool_size, gateway.ports.clone())
            .with_grace(cfg.shutdown_grace());
        for job in GatewayJob::all(gateway, cfg) {
            scheduler.add_job(Arc::new(job));
        }
        scheduler
    }

    /// How long an in-flight run may take to notice shutdown before it is aborted
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn add_job(&mut self, job: Arc<dyn ScheduledJob>) {
        self.statuses
            .insert(job.name(), Arc::new(RwLock::new(TaskStatus::default())));
        self.jobs.push(job);
    }

    /// Start one loop per job
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for job in &self.jobs {
            let Some(status) = self.statuses.get(job.name()) else {
                continue;
            };
            let runner = JobRunner {
                job: Arc::clone(job),
                status: Arc::clone(status),
                permits: Arc::clone(&self.permits),
                shutdown: self.shutdown.clone(),
                grace: self.grace,
            };
            tasks.spawn(runner.run_loop());
        }
        info!(jobs = self.jobs.len(), "scheduler started");
    }

    pub async fn status(&self, name: &str) -> Option<TaskStatus> {
        match self.statuses.get(name) {
            Some(status) => Some(status.read().await.clone()),
            None => None,
        }
    }

    pub async fn statuses(&self) -> Vec<(&'static str, TaskStatus)> {
        let mut all = Vec::with_capacity(self.statuses.len());
        for (name, status) in &self.statuses {
            all.push((*name, status.read().await.clone()));
        }
        all
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop scheduling, wait up to `grace` for running jobs, then close every port.
    ///
    /// Returns true when all loops finished and all ports closed in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("scheduler shutting down");
        self.shutdown.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "job loop ended abnormally");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!("jobs still running after grace period, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let closed = self.ports.shutdown(grace).await;
        info!(drained, closed, "scheduler stopped");
        drained && closed
    }
}

struct JobRunner {
    job: Arc<dyn ScheduledJob>,
    status: Arc<RwLock<TaskStatus>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl JobRunner {
    async fn run_loop(self) {
        let name = self.job.name();
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = sleep(self.job.initial_delay()) => {}
        }

        let mut ticker = interval(self.job.period().max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let permit = if self.job.uses_worker_pool() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                }
            } else {
                None
            };

            let now = Utc::now();
            self.status.write().await.started(now);
            debug!(job = name, "job started");

            let job = Arc::clone(&self.job);
            let mut run = tokio::spawn(async move {
                let _permit = permit;
                job.run().await
            });

            let joined = tokio::select! {
                joined = &mut run => joined,
                _ = self.shutdown.cancelled() => match timeout(self.grace, &mut run).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(job = name, "run did not stop in time, aborting");
                        run.abort();
                        (&mut run).await
                    }
                },
            };

            let mut status = self.status.write().await;
            match joined {
                Ok(Ok(())) => {
                    status.succeeded(now);
                    debug!(job = name, "job completed");
                }
                Ok(Err(e)) => {
                    error!(job = name, error = %e, "job failed");
                    status.failed(format!("{e:#}"));
                }
                Err(e) if e.is_panic() => {
                    let message = panic_message(e);
                    error!(job = name, error = %message, "job panicked");
                    status.failed(message);
                }
                Err(e) => {
                    status.failed(e.to_string());
                    break;
                }
            }
        }
        debug!(job = name, "job loop stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    SerialScan,
    NetworkScan,
    Validation,
}

/// The gateway's periodic discovery and validation work
pub struct GatewayJob {
    kind: JobKind,
    gateway: Arc<Gateway>,
    initial_delay: Duration,
    period: Duration,
}

impl GatewayJob {
    pub fn all(gateway: Arc<Gateway>, cfg: &SchedulerConfig) -> Vec<Self> {
        let job = |kind, delay_secs, period_secs| GatewayJob {
            kind,
            gateway: Arc::clone(&gateway),
            initial_delay: Duration::from_secs(delay_secs),
            period: Duration::from_secs(period_secs),
        };
        vec![
            job(JobKind::SerialScan, cfg.serial_scan_delay_secs, cfg.serial_scan_interval_secs),
            job(JobKind::NetworkScan, cfg.network_scan_delay_secs, cfg.network_scan_interval_secs),
            job(JobKind::Validation, cfg.validation_delay_secs, cfg.validation_interval_secs),
        ]
    }
}

#[async_trait]
impl ScheduledJob for GatewayJob {
    fn name(&self) -> &'static str {
        match self.kind {
            JobKind::SerialScan => "serial_scan",
            JobKind::NetworkScan => "network_scan",
            JobKind::Validation => "device_validation",
        }
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    fn period(&self) -> Duration {
        self.period
    }

    /// Validation holds each device for a full polling window
    fn uses_worker_pool(&self) -> bool {
        self.kind != JobKind::Validation
    }

    async fn run(&self) -> Result<()> {
        match self.kind {
            JobKind::SerialScan => {
                self.gateway.run_serial_scan().await;
            }
            JobKind::NetworkScan => {
                self.gateway.run_network_scan().await;
            }
            JobKind::Validation => {
                Arc::clone(&self.gateway).validate_pending().await?;
            }
        }
        Ok(())
    }
}
