//! In-process job executor.
//!
//! Worker threads claim runnable jobs through the facade, run the handler
//! registered for the job, and report the outcome back through the facade so
//! completion cascades (sync release, joins) happen in one place. The executor
//! is also a wakeup dispatcher: parked jobs are re-entered on a worker through
//! the resume handler named by the join's `wakeup_handler_ref`.

use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use jobweave_core::{JobId, ResultPayload};

use super::types::{Job, JobStatus, RESULT_CODE_INTERNAL_ERROR, RESULT_CODE_SUCCESS};
use crate::config::EngineConfig;
use crate::error::{JobError, JobResult};
use crate::join::AsyncJoin;
use crate::manager::AsyncJobManager;
use crate::wakeup::{Wakeup, WakeupDispatcher, WakeupError};

/// Dispatcher name the executor registers under by default.
pub const EXECUTOR_DISPATCHER: &str = "executor";

/// What a job handler decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        result_code: i32,
        result: Option<ResultPayload>,
    },
    Failed {
        result_code: i32,
        result: Option<ResultPayload>,
    },
    /// The job joined a child asynchronously and stays `InProgress` until resumed.
    Parked,
}

impl JobOutcome {
    pub fn success(result: Option<ResultPayload>) -> Self {
        Self::Completed {
            result_code: RESULT_CODE_SUCCESS,
            result,
        }
    }

    /// Failure whose result is `{"error": message}`.
    pub fn failure(result_code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Failed {
            result_code,
            result: ResultPayload::from_json(&serde_json::json!({ "error": message })).ok(),
        }
    }
}

/// What a handler sees while running a job.
pub struct JobContext<'a> {
    manager: &'a AsyncJobManager,
    job: Job,
}

impl<'a> JobContext<'a> {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn manager(&self) -> &'a AsyncJobManager {
        self.manager
    }

    /// Park this job on `child`; return the outcome from the handler.
    pub fn park_on(&self, child: JobId, wakeup: AsyncJoin) -> JobResult<JobOutcome> {
        self.manager.join_async(self.job.id, child, wakeup)?;
        Ok(JobOutcome::Parked)
    }
}

/// Runs a job body.
pub type JobHandler = Box<dyn Fn(&JobContext<'_>) -> JobOutcome + Send + Sync>;

/// Re-enters a parked job after a wakeup.
pub type ResumeHandler = Box<dyn Fn(&JobContext<'_>, &Wakeup) -> JobOutcome + Send + Sync>;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Worker threads; a job blocked in `join_sync` occupies one
    pub workers: usize,
    /// Name for logging and thread names
    pub name: String,
    /// Name registered in the dispatcher registry
    pub dispatcher: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            workers: 4,
            name: "job-executor".to_string(),
            dispatcher: EXECUTOR_DISPATCHER.to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            poll_interval: config.executor_poll_interval,
            workers: config.executor_workers,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: impl Into<String>) -> Self {
        self.dispatcher = dispatcher.into();
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_parked: u64,
    pub jobs_resumed: u64,
}

/// Dispatcher half of the executor: queues wakeups for the workers.
struct ResumeQueue {
    tx: Mutex<mpsc::Sender<Wakeup>>,
}

impl WakeupDispatcher for ResumeQueue {
    fn dispatch(&self, wakeup: &Wakeup) -> Result<(), WakeupError> {
        let tx = self.tx.lock().map_err(|_| WakeupError::Poisoned)?;
        tx.send(wakeup.clone())
            .map_err(|_| WakeupError::Failed("executor is not accepting wakeups".to_string()))
    }
}

pub struct JobExecutor {
    manager: Arc<AsyncJobManager>,
    config: JobExecutorConfig,
    handlers: HashMap<String, JobHandler>,
    resume_handlers: HashMap<String, ResumeHandler>,
    resumes: Mutex<mpsc::Receiver<Wakeup>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutor {
    /// Create an executor and register it as `config.dispatcher`.
    pub fn new(manager: Arc<AsyncJobManager>, config: JobExecutorConfig) -> JobResult<Self> {
        let (tx, rx) = mpsc::channel();
        manager
            .dispatchers()
            .register(config.dispatcher.clone(), Arc::new(ResumeQueue { tx: Mutex::new(tx) }))
            .map_err(|err| JobError::Storage(err.to_string()))?;

        Ok(Self {
            manager,
            config,
            handlers: HashMap::new(),
            resume_handlers: HashMap::new(),
            resumes: Mutex::new(rx),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        })
    }

    /// Register the body for jobs whose `dispatcher_ref` (or, failing that,
    /// `cmd`) equals `key`. `"*"` catches everything else.
    pub fn register_handler<F>(&mut self, key: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext<'_>) -> JobOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(key.into(), Box::new(handler));
    }

    /// Register the continuation named by a join's `wakeup_handler_ref`.
    pub fn register_resume_handler<F>(&mut self, handler_ref: impl Into<String>, handler: F)
    where
        F: Fn(&JobContext<'_>, &Wakeup) -> JobOutcome + Send + Sync + 'static,
    {
        self.resume_handlers.insert(handler_ref.into(), Box::new(handler));
    }

    pub fn stats(&self) -> ExecutorStats {
        read_stats(&self.stats)
    }

    fn handler_for(&self, job: &Job) -> Option<&JobHandler> {
        job.dispatcher_ref
            .as_deref()
            .and_then(|d| self.handlers.get(d))
            .or_else(|| self.handlers.get(job.cmd.as_str()))
            .or_else(|| self.handlers.get("*"))
    }

    /// Do one unit of work: a pending resumption first, else a newly claimed job.
    /// Returns whether there was anything to do.
    pub fn run_once(&self) -> JobResult<bool> {
        if let Some(wakeup) = self.next_wakeup()? {
            self.resume(&wakeup)?;
            return Ok(true);
        }
        match self.manager.claim_job()? {
            Some(job) => {
                self.execute(job)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn next_wakeup(&self) -> JobResult<Option<Wakeup>> {
        let rx = self
            .resumes
            .lock()
            .map_err(|_| JobError::Storage("executor resume queue poisoned".to_string()))?;
        match rx.try_recv() {
            Ok(wakeup) => Ok(Some(wakeup)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Run a claimed job's body and report its outcome.
    pub fn execute(&self, job: Job) -> JobResult<JobOutcome> {
        let job_id = job.id;
        let outcome = match self.handler_for(&job) {
            Some(handler) => {
                debug!(executor = %self.config.name, job_id = %job_id, cmd = %job.cmd, "running job");
                let ctx = JobContext {
                    manager: &self.manager,
                    job,
                };
                guarded(|| handler(&ctx))
            }
            None => {
                warn!(job_id = %job_id, cmd = %job.cmd, "no handler for job");
                JobOutcome::failure(RESULT_CODE_INTERNAL_ERROR, format!("no handler for job {}", job.cmd))
            }
        };
        self.report(job_id, &outcome)?;
        Ok(outcome)
    }

    /// Re-enter a parked job. Wakeups for jobs that already finished are dropped.
    pub fn resume(&self, wakeup: &Wakeup) -> JobResult<Option<JobOutcome>> {
        let job = self.manager.get_async_job(wakeup.parent_job_id)?;
        if job.is_terminal() {
            debug!(job_id = %job.id, reason = ?wakeup.reason, "wakeup for finished job ignored");
            return Ok(None);
        }

        self.bump(|s| s.jobs_resumed += 1);
        let job_id = job.id;
        let outcome = match self.resume_handlers.get(&wakeup.handler_ref) {
            Some(handler) => {
                info!(job_id = %job_id, handler = %wakeup.handler_ref, reason = ?wakeup.reason, "resuming parked job");
                let ctx = JobContext {
                    manager: &self.manager,
                    job,
                };
                guarded(|| handler(&ctx, wakeup))
            }
            None => {
                warn!(job_id = %job_id, handler = %wakeup.handler_ref, "no resume handler for parked job");
                JobOutcome::failure(
                    RESULT_CODE_INTERNAL_ERROR,
                    format!("no resume handler {}", wakeup.handler_ref),
                )
            }
        };
        self.report(job_id, &outcome)?;
        Ok(Some(outcome))
    }

    fn report(&self, job_id: JobId, outcome: &JobOutcome) -> JobResult<()> {
        let result = match outcome {
            JobOutcome::Completed { result_code, result } => {
                self.bump(|s| s.jobs_completed += 1);
                self.manager
                    .complete_async_job(job_id, JobStatus::Completed, *result_code, result.clone())
                    .map(|_| ())
            }
            JobOutcome::Failed { result_code, result } => {
                self.bump(|s| s.jobs_failed += 1);
                self.manager
                    .complete_async_job(job_id, JobStatus::Failed, *result_code, result.clone())
                    .map(|_| ())
            }
            JobOutcome::Parked => {
                self.bump(|s| s.jobs_parked += 1);
                debug!(job_id = %job_id, "job parked");
                Ok(())
            }
        };
        self.bump(|s| s.jobs_processed += 1);
        result
    }

    fn bump(&self, update: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    /// Spawn the worker threads.
    pub fn spawn(self) -> io::Result<JobExecutorHandle> {
        let workers = self.config.workers.max(1);
        let name = self.config.name.clone();
        let stats = self.stats.clone();
        let executor = Arc::new(self);

        let mut handle = JobExecutorHandle {
            workers: Vec::with_capacity(workers),
            stats,
        };
        for index in 0..workers {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let worker = executor.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&worker, index, shutdown_rx));

            match spawned {
                Ok(join) => handle.workers.push((shutdown_tx, Some(join))),
                Err(err) => {
                    handle.shutdown();
                    return Err(err);
                }
            }
        }

        info!(executor = %name, workers, "job executor started");
        Ok(handle)
    }
}

fn guarded(run: impl FnOnce() -> JobOutcome) -> JobOutcome {
    catch_unwind(AssertUnwindSafe(run))
        .unwrap_or_else(|_| JobOutcome::failure(RESULT_CODE_INTERNAL_ERROR, "job handler panicked"))
}

fn read_stats(stats: &Mutex<ExecutorStats>) -> ExecutorStats {
    stats.lock().map(|s| s.clone()).unwrap_or_default()
}

fn worker_loop(executor: &JobExecutor, index: usize, shutdown_rx: mpsc::Receiver<()>) {
    let name = executor.config.name.as_str();
    debug!(executor = %name, worker = index, "executor worker started");

    loop {
        match executor.run_once() {
            Ok(true) => {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }
                continue;
            }
            Ok(false) => {}
            Err(err) => error!(executor = %name, worker = index, error = %err, "executor step failed"),
        }

        match shutdown_rx.recv_timeout(executor.config.poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(executor = %name, worker = index, "executor worker stopped");
}

/// Handle to control running executor workers.
#[derive(Debug)]
pub struct JobExecutorHandle {
    workers: Vec<(mpsc::Sender<()>, Option<thread::JoinHandle<()>>)>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    pub fn shutdown(mut self) {
        for (tx, _) in &self.workers {
            let _ = tx.send(());
        }
        for (_, join) in &mut self.workers {
            if let Some(j) = join.take() {
                let _ = j.join();
            }
        }
        info!("job executor stopped");
    }

    pub fn stats(&self) -> ExecutorStats {
        read_stats(&self.stats)
    }
}
