//! Predicate poll kept for call sites that have not moved to joins.
//!
//! Nothing here touches join records or the join coordinator.

use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use jobweave_bus::{MessageBus, TopicFilter};

/// Block until `predicate` holds or `timeout` elapses.
///
/// The predicate is evaluated once up front, then again on every message
/// published to one of `topics` and on every `check_interval` tick.
/// Returns whether the predicate was satisfied.
#[deprecated(note = "park the job with `join_sync` or `join_async` instead")]
pub fn wait_and_check<F>(
    bus: &dyn MessageBus,
    topics: &[&str],
    check_interval: Duration,
    timeout: Duration,
    mut predicate: F,
) -> bool
where
    F: FnMut() -> bool,
{
    // Subscribe before the first check so no publish slips between them.
    let sub = bus.subscribe(TopicFilter::topics(topics.iter().copied()));
    let deadline = Instant::now() + timeout;

    loop {
        if predicate() {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(?topics, timeout_ms = timeout.as_millis() as u64, "wait_and_check timed out");
            return false;
        }

        let tick = check_interval.min(deadline - now);
        match sub.recv_timeout(tick) {
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(tick),
        }
    }
}

#[cfg(test)]
#[allow(deprecated)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use jobweave_bus::{BusMessage, InMemoryMessageBus};

    use super::*;

    #[test]
    fn returns_immediately_when_already_true() {
        let bus = InMemoryMessageBus::new();
        assert!(wait_and_check(&bus, &["vm.7"], Duration::from_secs(10), Duration::from_secs(10), || true));
    }

    #[test]
    fn times_out_when_never_true() {
        let bus = InMemoryMessageBus::new();
        let checks = AtomicUsize::new(0);
        let satisfied = wait_and_check(
            &bus,
            &["vm.7"],
            Duration::from_millis(10),
            Duration::from_millis(60),
            || {
                checks.fetch_add(1, Ordering::SeqCst);
                false
            },
        );
        assert!(!satisfied);
        assert!(checks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn topic_publish_triggers_recheck() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let ready = Arc::new(AtomicBool::new(false));

        let publisher = {
            let bus = bus.clone();
            let ready = ready.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                ready.store(true, Ordering::SeqCst);
                bus.publish(BusMessage::signal("vm.7")).unwrap();
            })
        };

        // Interval far beyond the timeout: only the publish can wake the check.
        let started = Instant::now();
        let satisfied = wait_and_check(
            &*bus,
            &["vm.7"],
            Duration::from_secs(60),
            Duration::from_secs(5),
            || ready.load(Ordering::SeqCst),
        );
        publisher.join().unwrap();

        assert!(satisfied);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
