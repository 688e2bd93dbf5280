//! Cross-component scenarios driven through the facade.
//!
//! In-memory job, join and sync-queue stores plus a bus; several managers
//! sharing them stand in for several management nodes.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Duration as ChronoDuration;

    use jobweave_bus::{InMemoryMessageBus, MessageBus};
    use jobweave_core::{ExecutionContextId, JobId, ResultPayload};

    use crate::config::EngineConfig;
    use crate::error::JobError;
    use crate::jobs::{
        InMemoryJobStore, Job, JobExecutor, JobExecutorConfig, JobOutcome, JobStatus, JobStore,
        JournalType, RESULT_CODE_SUCCESS,
    };
    use crate::join::{AsyncJoin, InMemoryJoinStore, JoinState, JoinStore};
    use crate::manager::AsyncJobManager;
    use crate::sync_queue::{Admission, InMemorySyncQueueStore, SyncObjectKey};
    use crate::wakeup::{Wakeup, WakeupError, WakeupReason};

    /// Shared adapters for a small cluster.
    struct Cluster {
        jobs: Arc<InMemoryJobStore>,
        joins: Arc<InMemoryJoinStore>,
        sync: Arc<InMemorySyncQueueStore>,
        bus: Arc<InMemoryMessageBus>,
    }

    impl Cluster {
        fn new() -> Self {
            Self {
                jobs: InMemoryJobStore::arc(),
                joins: InMemoryJoinStore::arc(),
                sync: InMemorySyncQueueStore::arc(),
                bus: Arc::new(InMemoryMessageBus::new()),
            }
        }

        fn node(&self, node_id: u64) -> Arc<AsyncJobManager> {
            let config = EngineConfig::default()
                .with_node_id(node_id)
                .with_sync_join_check_interval(Duration::from_millis(20))
                .with_sweep_interval(Duration::from_millis(10));
            Arc::new(AsyncJobManager::new(
                config,
                self.jobs.clone(),
                self.joins.clone(),
                self.sync.clone(),
                self.bus.clone(),
            ))
        }
    }

    fn node() -> Arc<AsyncJobManager> {
        Cluster::new().node(1)
    }

    /// Registers a dispatcher that records every wakeup it receives.
    fn recording_dispatcher(manager: &AsyncJobManager, name: &str) -> Arc<Mutex<Vec<Wakeup>>> {
        let woken = Arc::new(Mutex::new(Vec::new()));
        let sink = woken.clone();
        manager
            .dispatchers()
            .register(
                name,
                Arc::new(move |w: &Wakeup| -> Result<(), WakeupError> {
                    sink.lock().unwrap().push(w.clone());
                    Ok(())
                }),
            )
            .unwrap();
        woken
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn second_job_on_same_vm_waits_for_release() {
        let manager = node();
        let key = SyncObjectKey::new("vm-7");

        let (a, admission_a) = manager
            .submit_async_job_with_sync(Job::new("StartVM"), key.clone(), 1)
            .unwrap();
        let (b, admission_b) = manager
            .submit_async_job_with_sync(Job::new("StopVM"), key.clone(), 1)
            .unwrap();
        assert_eq!(admission_a, Admission::Granted);
        assert_eq!(admission_b, Admission::Waiting { position: 1 });

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || {
                manager
                    .sync_queue()
                    .wait_until_active(b, Duration::from_secs(5))
                    .unwrap()
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        assert!(!manager.sync_queue().is_active(b).unwrap());

        manager
            .complete_async_job(a, JobStatus::Completed, RESULT_CODE_SUCCESS, None)
            .unwrap();
        assert!(waiter.join().unwrap());
        assert_eq!(manager.sync_queue().active_count(&key).unwrap(), 1);

        // B's completion frees the key entirely.
        manager.complete_async_job(b, JobStatus::Completed, 0, None).unwrap();
        assert_eq!(manager.sync_queue().active_count(&key).unwrap(), 0);
    }

    #[test]
    fn cancelling_active_job_promotes_next() {
        let manager = node();
        let key = SyncObjectKey::new("vm-7");
        let (a, _) = manager.submit_async_job_with_sync(Job::new("StartVM"), key.clone(), 1).unwrap();
        let (b, _) = manager.submit_async_job_with_sync(Job::new("StopVM"), key, 1).unwrap();

        manager.complete_async_job(a, JobStatus::Cancelled, 0, None).unwrap();
        assert!(manager.sync_queue().is_active(b).unwrap());
    }

    #[test]
    fn unbounded_key_never_gates() {
        let manager = node();
        for _ in 0..5 {
            let (_, admission) = manager
                .submit_async_job_with_sync(Job::new("Snapshot"), SyncObjectKey::new("pool-1"), 0)
                .unwrap();
            assert_eq!(admission, Admission::Granted);
        }
    }

    #[test]
    fn sync_join_returns_completed_child_payload() {
        let manager = node();
        let parent = manager.submit_async_job(Job::new("DeployVM")).unwrap();
        let child = manager.submit_async_job(Job::new("PrepareTemplate")).unwrap();
        let payload = ResultPayload::from_json(&serde_json::json!({ "template_id": 42 })).unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.join_sync(parent, child))
        };
        thread::sleep(Duration::from_millis(30));

        manager
            .complete_async_job(child, JobStatus::Completed, 0, Some(payload.clone()))
            .unwrap();

        let joined = waiter.join().unwrap().unwrap();
        assert_eq!(joined.status, JobStatus::Completed);
        assert_eq!(joined.result, Some(payload));
    }

    #[test]
    fn sync_join_sees_completion_on_another_node() {
        let cluster = Cluster::new();
        let node_a = cluster.node(1);
        let node_b = cluster.node(2);
        let parent = node_a.submit_async_job(Job::new("DeployVM")).unwrap();
        let child = node_b.submit_async_job(Job::new("PrepareTemplate")).unwrap();

        let waiter = {
            let node_a = node_a.clone();
            thread::spawn(move || node_a.join_sync(parent, child))
        };
        thread::sleep(Duration::from_millis(30));

        node_b
            .complete_async_job(child, JobStatus::Failed, 530, Some(ResultPayload::raw("disk full")))
            .unwrap();

        let joined = waiter.join().unwrap().unwrap();
        assert_eq!(joined.status, JobStatus::Failed);
        assert_eq!(joined.result, Some(ResultPayload::raw("disk full")));
    }

    #[test]
    fn async_join_times_out_exactly_once() {
        let manager = node();
        let woken = recording_dispatcher(&manager, "vm-dispatcher");
        let parent = manager.submit_async_job(Job::new("DeployVM")).unwrap();
        let child = manager.submit_async_job(Job::new("PrepareTemplate")).unwrap();

        let record = manager
            .join_async(
                parent,
                child,
                AsyncJoin::new("deploy-continue", "vm-dispatcher")
                    .with_interval_ms(1000)
                    .with_timeout_ms(5000),
            )
            .unwrap();
        let scheduler = manager.wakeup_scheduler();
        let at = |ms| record.joined_at + ChronoDuration::milliseconds(ms);

        for ms in [1000, 2000, 3000, 4000] {
            let report = scheduler.sweep_once(at(ms)).unwrap();
            assert_eq!(report.timed_out, 0);
        }
        assert_eq!(scheduler.sweep_once(at(5000)).unwrap().timed_out, 1);
        assert_eq!(scheduler.sweep_once(at(6000)).unwrap().timed_out, 0);
        assert_eq!(scheduler.sweep_once(at(60_000)).unwrap().timed_out, 0);

        let woken = woken.lock().unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].reason, WakeupReason::TimedOut);
        assert_eq!(woken[0].handler_ref, "deploy-continue");
        assert_eq!(
            woken[0].records[0].outcome(),
            Some(Err(JobError::JoinTimeout { parent, child }))
        );

        // A late completion must not resume the parent again.
        manager.complete_async_job(child, JobStatus::Completed, 0, None).unwrap();
        assert_eq!(
            manager.join_coordinator().joins().get(parent, child).unwrap().unwrap().state,
            JoinState::TimedOut
        );
    }

    #[test]
    fn duplicate_completion_resumes_parent_once() {
        let manager = node();
        let woken = recording_dispatcher(&manager, "vm-dispatcher");
        let parent = manager.submit_async_job(Job::new("DeployVM")).unwrap();
        let child = manager.submit_async_job(Job::new("PrepareTemplate")).unwrap();
        manager
            .join_async(parent, child, AsyncJoin::new("deploy-continue", "vm-dispatcher"))
            .unwrap();

        let payload = Some(ResultPayload::raw("ok"));
        manager.complete_async_job(child, JobStatus::Completed, 0, payload.clone()).unwrap();
        let snapshot = manager.get_async_job(child).unwrap();
        manager.complete_async_job(child, JobStatus::Completed, 0, payload).unwrap();
        // At-least-once bus delivery of the join itself.
        manager.complete_join(child, JobStatus::Completed, None).unwrap();

        assert_eq!(manager.get_async_job(child).unwrap(), snapshot);
        assert_eq!(woken.lock().unwrap().len(), 1);
    }

    #[test]
    fn topic_event_wakes_parked_parent_through_bus() {
        let manager = node();
        let woken = recording_dispatcher(&manager, "vm-dispatcher");
        let parent = manager.submit_async_job(Job::new("DeployVM")).unwrap();
        let child = manager.submit_async_job(Job::new("PrepareTemplate")).unwrap();
        manager
            .join_async(
                parent,
                child,
                AsyncJoin::new("deploy-continue", "vm-dispatcher").with_topics(["vm.7.ready"]),
            )
            .unwrap();

        let handle = manager.wakeup_scheduler().spawn().unwrap();
        manager
            .bus()
            .publish(jobweave_bus::BusMessage::signal("vm.7.ready"))
            .unwrap();
        let fired = wait_until(Duration::from_secs(2), || !woken.lock().unwrap().is_empty());
        handle.shutdown();

        assert!(fired);
        assert_eq!(
            woken.lock().unwrap()[0].reason,
            WakeupReason::Event {
                topic: "vm.7.ready".to_string()
            }
        );
    }

    #[test]
    fn failing_dispatcher_is_journaled_and_does_not_block_others() {
        let manager = node();
        manager
            .dispatchers()
            .register(
                "broken",
                Arc::new(|_: &Wakeup| -> Result<(), WakeupError> {
                    Err(WakeupError::Failed("handler registry offline".to_string()))
                }),
            )
            .unwrap();
        let woken = recording_dispatcher(&manager, "healthy");

        let child = manager.submit_async_job(Job::new("PrepareTemplate")).unwrap();
        let broken_parent = manager.submit_async_job(Job::new("DeployVM")).unwrap();
        let healthy_parent = manager.submit_async_job(Job::new("DeployVM")).unwrap();
        manager
            .join_async(broken_parent, child, AsyncJoin::new("continue", "broken"))
            .unwrap();
        manager
            .join_async(healthy_parent, child, AsyncJoin::new("continue", "healthy"))
            .unwrap();

        let satisfied = manager.complete_join(child, JobStatus::Completed, None).unwrap();
        assert_eq!(satisfied, 2);
        assert_eq!(woken.lock().unwrap()[0].parent_job_id, healthy_parent);

        let journal = manager.journal(broken_parent).unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].journal_type, JournalType::Failure);
        assert!(journal[0].text.contains("handler registry offline"));
    }

    #[test]
    fn disjoin_is_idempotent_and_unparks_sync_waiter() {
        let manager = node();
        let parent = manager.submit_async_job(Job::new("DeployVM")).unwrap();
        let child = manager.submit_async_job(Job::new("PrepareTemplate")).unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.join_sync(parent, child))
        };
        assert!(wait_until(Duration::from_secs(2), || {
            !manager.join_coordinator().joins_of(parent).unwrap().is_empty()
        }));

        manager.disjoin_job(parent, child).unwrap();
        manager.disjoin_job(parent, child).unwrap();

        assert_eq!(waiter.join().unwrap(), Err(JobError::Disjoined { parent, child }));
        assert!(manager.join_coordinator().joiners_of(child).unwrap().is_empty());
    }

    #[test]
    fn pseudo_job_mapping_does_not_survive_restart() {
        let cluster = Cluster::new();
        let ctx = ExecutionContextId::new("ctx1");

        let before = {
            let manager = cluster.node(1);
            let first = manager.get_pseudo_job(&ctx).unwrap();
            let second = manager.get_pseudo_job(&ctx).unwrap();
            assert_eq!(first.id, second.id);
            first.id
        };

        let restarted = cluster.node(1);
        let report = restarted.on_startup().unwrap();
        assert_eq!(report.pseudo_jobs_expunged, 1);
        assert_eq!(restarted.get_async_job(before), Err(JobError::NotFound(before)));
        assert_ne!(restarted.get_pseudo_job(&ctx).unwrap().id, before);
    }

    #[test]
    fn restart_fails_running_jobs_and_resolves_their_joiners() {
        let cluster = Cluster::new();
        let crashed = cluster.node(3);
        let key = SyncObjectKey::new("vm-9");
        let (running, _) = crashed
            .submit_async_job_with_sync(Job::new("StartVM"), key, 1)
            .unwrap();
        assert_eq!(crashed.claim_job().unwrap().map(|j| j.id), Some(running));

        let parent = cluster.node(4).submit_async_job(Job::new("DeployVM")).unwrap();
        let observer = cluster.node(4);
        let woken = recording_dispatcher(&observer, "vm-dispatcher");
        observer
            .join_async(parent, running, AsyncJoin::new("continue", "vm-dispatcher"))
            .unwrap();

        let restarted = cluster.node(3);
        assert_eq!(restarted.on_startup().unwrap().jobs_interrupted, 1);

        assert_eq!(restarted.get_async_job(running).unwrap().status, JobStatus::Failed);
        let record = restarted.join_coordinator().joins().get(parent, running).unwrap().unwrap();
        assert_eq!(record.state, JoinState::Satisfied);
        assert_eq!(record.join_status, Some(JobStatus::Failed));
        // The restarted node has no "vm-dispatcher"; the failure is journaled there.
        assert!(woken.lock().unwrap().is_empty());
        assert_eq!(restarted.journal(parent).unwrap().len(), 1);
    }

    #[test]
    fn executor_and_scheduler_resume_timed_out_parent() {
        let manager = node();
        let mut executor = JobExecutor::new(
            manager.clone(),
            JobExecutorConfig::default()
                .with_workers(1)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();

        let stuck_child: Arc<Mutex<Option<JobId>>> = Arc::new(Mutex::new(None));
        let child_slot = stuck_child.clone();
        executor.register_handler("DeployVM", move |ctx| {
            // Claimed by a node that never finishes it.
            let child_id = match ctx.manager().submit_async_job(Job::new("PrepareTemplate")) {
                Ok(id) => id,
                Err(err) => return JobOutcome::failure(1, err.to_string()),
            };
            ctx.manager().jobs().mark_in_progress(child_id, 99).unwrap();
            *child_slot.lock().unwrap() = Some(child_id);
            ctx.park_on(
                child_id,
                AsyncJoin::new("deploy-continue", crate::jobs::EXECUTOR_DISPATCHER).with_timeout_ms(50),
            )
            .unwrap_or_else(|err| JobOutcome::failure(1, err.to_string()))
        });
        let resumed = Arc::new(AtomicUsize::new(0));
        let resumed_count = resumed.clone();
        executor.register_resume_handler("deploy-continue", move |_ctx, wakeup| {
            resumed_count.fetch_add(1, Ordering::SeqCst);
            match wakeup.records[0].outcome() {
                Some(Err(err)) => JobOutcome::failure(530, err.to_string()),
                _ => JobOutcome::success(None),
            }
        });

        let parent = manager.submit_async_job(Job::new("DeployVM")).unwrap();
        let scheduler = manager.wakeup_scheduler().spawn().unwrap();
        let workers = executor.spawn().unwrap();

        let finished = wait_until(Duration::from_secs(5), || {
            manager.get_async_job(parent).map(|j| j.is_terminal()).unwrap_or(false)
        });
        workers.shutdown();
        scheduler.shutdown();

        assert!(finished);
        let job = manager.get_async_job(parent).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.result_code, 530);
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
        let child = stuck_child.lock().unwrap().unwrap();
        assert_eq!(manager.get_async_job(child).unwrap().status, JobStatus::InProgress);
    }

    #[test]
    fn nodes_share_one_sync_queue_limit() {
        let cluster = Cluster::new();
        let (node1, node2) = (cluster.node(1), cluster.node(2));
        let key = SyncObjectKey::new("vm-7");

        let (a, admission_a) = node1
            .submit_async_job_with_sync(Job::new("StartVM"), key.clone(), 1)
            .unwrap();
        let (b, admission_b) = node2
            .submit_async_job_with_sync(Job::new("StopVM"), key.clone(), 1)
            .unwrap();
        assert_eq!(admission_a, Admission::Granted);
        assert_eq!(admission_b, Admission::Waiting { position: 1 });

        assert_eq!(node2.claim_job().unwrap(), None);
        assert_eq!(node1.claim_job().unwrap().map(|j| j.id), Some(a));
        assert_eq!(node2.claim_job().unwrap(), None);

        node1.complete_async_job(a, JobStatus::Completed, 0, None).unwrap();
        assert_eq!(node2.claim_job().unwrap().map(|j| j.id), Some(b));
    }

    #[test]
    fn restarted_node_keeps_queued_jobs_runnable() {
        let cluster = Cluster::new();
        let key = SyncObjectKey::new("vm-7");
        let (a, b) = {
            let before = cluster.node(1);
            let (a, _) = before.submit_async_job_with_sync(Job::new("StartVM"), key.clone(), 1).unwrap();
            let (b, _) = before.submit_async_job_with_sync(Job::new("StopVM"), key.clone(), 1).unwrap();
            (a, b)
        };

        let restarted = cluster.node(1);
        let report = restarted.on_startup().unwrap();
        assert_eq!(report.sync_claims_restored, 0);

        let runnable: Vec<JobId> = restarted.runnable_jobs(10).unwrap().iter().map(|j| j.id).collect();
        assert_eq!(runnable, vec![a]);
        assert_eq!(
            restarted.sync_queue().admission(b).unwrap(),
            Some(Admission::Waiting { position: 1 })
        );
    }

    #[test]
    fn startup_rebuilds_lost_sync_claims_in_submit_order() {
        let cluster = Cluster::new();
        let key = SyncObjectKey::new("vm-7");
        let before = cluster.node(1);
        let (a, _) = before.submit_async_job_with_sync(Job::new("StartVM"), key.clone(), 1).unwrap();
        let (b, _) = before.submit_async_job_with_sync(Job::new("StopVM"), key.clone(), 1).unwrap();
        let (c, _) = before.submit_async_job_with_sync(Job::new("StartVM"), key.clone(), 1).unwrap();
        // Running elsewhere, so it must get its slot back ahead of older queued jobs.
        before.jobs().mark_in_progress(b, 2).unwrap();

        // Same job store, empty sync-queue store.
        let rebuilt = Cluster {
            jobs: cluster.jobs.clone(),
            joins: cluster.joins.clone(),
            sync: InMemorySyncQueueStore::arc(),
            bus: cluster.bus.clone(),
        };
        let restarted = rebuilt.node(1);
        assert_eq!(restarted.on_startup().unwrap().sync_claims_restored, 3);

        assert!(restarted.sync_queue().is_active(b).unwrap());
        assert_eq!(
            restarted.sync_queue().admission(a).unwrap(),
            Some(Admission::Waiting { position: 1 })
        );
        assert_eq!(
            restarted.sync_queue().admission(c).unwrap(),
            Some(Admission::Waiting { position: 2 })
        );
        assert!(restarted.runnable_jobs(10).unwrap().is_empty());

        restarted.complete_async_job(b, JobStatus::Completed, 0, None).unwrap();
        assert_eq!(restarted.claim_job().unwrap().map(|j| j.id), Some(a));
    }

    #[test]
    fn executor_never_claims_pseudo_jobs() {
        let manager = node();
        let executor = JobExecutor::new(manager.clone(), JobExecutorConfig::default().with_workers(1)).unwrap();
        let ctx = ExecutionContextId::new("ctx1");
        let pseudo = manager.get_pseudo_job(&ctx).unwrap();

        assert!(!executor.run_once().unwrap());
        assert_eq!(manager.get_async_job(pseudo.id).unwrap().status, JobStatus::Queued);
        assert!(manager.claim_job().unwrap().is_none());

        // The context's job can still act as a join parent.
        let child = manager.submit_async_job(Job::new("PrepareTemplate")).unwrap();
        manager.complete_async_job(child, JobStatus::Completed, 0, None).unwrap();
        assert_eq!(
            manager.join_sync(pseudo.id, child).unwrap().status,
            JobStatus::Completed
        );
    }
}
