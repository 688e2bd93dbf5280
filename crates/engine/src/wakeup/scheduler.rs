use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobweave_bus::topics::{TOPIC_JOB_STATE, TOPIC_JOIN_COMPLETED, TOPIC_JOIN_DISJOINED};
use jobweave_bus::{BusMessage, MessageBus, Subscription, TopicFilter};

use crate::error::JobResult;
use crate::join::{JoinCoordinator, JoinMode, Recheck};

/// Counts from one sweep over the waiting async joins.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub satisfied: usize,
    pub timed_out: usize,
    /// Polled and still waiting
    pub rechecked: usize,
    /// Could not be checked this round; journaled against the parent
    pub failed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.satisfied == 0 && self.timed_out == 0 && self.rechecked == 0 && self.failed == 0
    }
}

/// Drives resumption of parked async joins.
///
/// Bus events wake joins listening on the published topic; a periodic sweep
/// re-checks readiness and enforces timeouts. Join and job-state messages
/// also unpark local sync waiters, so completions on other nodes are seen.
pub struct WakeupScheduler {
    coordinator: Arc<JoinCoordinator>,
    bus: Arc<dyn MessageBus>,
    sweep_interval: Duration,
}

impl WakeupScheduler {
    pub fn new(
        coordinator: Arc<JoinCoordinator>,
        bus: Arc<dyn MessageBus>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            bus,
            sweep_interval,
        }
    }

    /// React to one bus message. Returns the number of joins it woke.
    ///
    /// A join that cannot be checked is journaled and skipped; the others
    /// are still woken.
    pub fn handle_message(&self, message: &BusMessage) -> JobResult<usize> {
        let topic = message.topic();
        if matches!(topic, TOPIC_JOIN_COMPLETED | TOPIC_JOIN_DISJOINED | TOPIC_JOB_STATE) {
            self.coordinator.notify_local()?;
        }

        let mut woken = 0;
        for record in self.coordinator.joins().waiting(JoinMode::Async)? {
            if !record.listens_to(topic) {
                continue;
            }
            match self.coordinator.wake_on_event(&record, topic) {
                Ok(Recheck::Gone) => {}
                Ok(_) => woken += 1,
                Err(err) => self.coordinator.report_failure(&record, &err),
            }
        }
        if woken > 0 {
            debug!(topic, woken, "topic event woke parked joins");
        }
        Ok(woken)
    }

    /// Re-check every async join whose poll is due or whose timeout elapsed at `now`.
    ///
    /// One join failing its check does not hold up the rest of the sweep.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> JobResult<SweepReport> {
        let mut report = SweepReport::default();

        for record in self.coordinator.joins().waiting(JoinMode::Async)? {
            if !record.is_check_due(now) && !record.is_timed_out(now) {
                continue;
            }
            match self.coordinator.recheck_async(&record, now) {
                Ok(Recheck::Satisfied) => report.satisfied += 1,
                Ok(Recheck::TimedOut) => report.timed_out += 1,
                Ok(Recheck::Pending) => report.rechecked += 1,
                Ok(Recheck::Gone) => {}
                Err(err) => {
                    self.coordinator.report_failure(&record, &err);
                    report.failed += 1;
                }
            }
        }

        if !report.is_empty() {
            debug!(
                satisfied = report.satisfied,
                timed_out = report.timed_out,
                rechecked = report.rechecked,
                failed = report.failed,
                "wakeup sweep"
            );
        }
        Ok(report)
    }

    /// Run the scheduler on a background thread until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> io::Result<WakeupSchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = self.bus.subscribe(TopicFilter::All);

        let join = thread::Builder::new()
            .name("jobweave-wakeup".to_string())
            .spawn(move || self.run(sub, shutdown_rx))?;

        Ok(WakeupSchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn run(&self, sub: Subscription<BusMessage>, shutdown_rx: mpsc::Receiver<()>) {
        info!(sweep_interval_ms = self.sweep_interval.as_millis() as u64, "wakeup scheduler started");
        let mut next_sweep = Instant::now() + self.sweep_interval;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let wait = next_sweep.saturating_duration_since(Instant::now());
            match sub.recv_timeout(wait) {
                Ok(message) => {
                    if let Err(err) = self.handle_message(&message) {
                        warn!(topic = message.topic(), error = %err, "wakeup event handling failed");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if Instant::now() >= next_sweep {
                if let Err(err) = self.sweep_once(Utc::now()) {
                    warn!(error = %err, "wakeup sweep failed");
                }
                next_sweep = Instant::now() + self.sweep_interval;
            }
        }
        info!("wakeup scheduler stopped");
    }
}

/// Handle to stop and join the scheduler thread.
#[derive(Debug)]
pub struct WakeupSchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WakeupSchedulerHandle {
    /// Request shutdown and wait for the scheduler to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
