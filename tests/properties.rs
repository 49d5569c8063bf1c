//! Property tests for the quantified invariants: FSM monotonicity, retry
//! timing bounds, scaling bounds, selection determinism.

use drover::autoscaler::{decide, AutoscalerConfig, AutoscalerSample, ScaleDecision};
use drover::{
    Backoff, BalancerStrategy, Error, InstantSleeper, Jitter, LoadBalancer, RetryPolicy,
    TaskState, TrackingSleeper,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn any_state() -> impl Strategy<Value = TaskState> {
    prop_oneof![
        Just(TaskState::Pending),
        Just(TaskState::Assigned),
        Just(TaskState::Running),
        Just(TaskState::Completed),
        Just(TaskState::Failed),
        Just(TaskState::Cancelled),
    ]
}

proptest! {
    /// Terminal states are never left, whatever transition is attempted.
    #[test]
    fn terminal_states_are_absorbing(attempts in proptest::collection::vec(any_state(), 1..20)) {
        let mut state = TaskState::Pending;
        let mut terminal_since: Option<TaskState> = None;
        for next in attempts {
            if state.may_become(next) {
                state = next;
            }
            if let Some(terminal) = terminal_since {
                prop_assert_eq!(state, terminal, "left terminal state");
            }
            if state.is_terminal() {
                terminal_since.get_or_insert(state);
            }
        }
    }

    /// Backoff follows `min(cap, base * multiplier^(n-1))`.
    #[test]
    fn exponential_backoff_is_capped_and_monotone(
        base_ms in 1u64..1_000,
        multiplier in 1.0f64..4.0,
        cap_ms in 1_000u64..60_000,
        attempt in 1usize..20,
    ) {
        let backoff = Backoff::exponential_with_multiplier(
            Duration::from_millis(base_ms),
            multiplier,
        )
        .with_max(Duration::from_millis(cap_ms));

        let delay = backoff.delay(attempt);
        prop_assert!(delay <= Duration::from_millis(cap_ms));
        prop_assert!(delay >= Duration::from_millis(base_ms).min(Duration::from_millis(cap_ms)));
        // Monotone non-decreasing in the attempt number.
        prop_assert!(backoff.delay(attempt + 1) >= delay);
    }

    /// Proportional jitter adds at most a quarter of the base delay.
    #[test]
    fn proportional_jitter_bound(delay_ms in 0u64..10_000) {
        let delay = Duration::from_millis(delay_ms);
        let jittered = Jitter::proportional().apply(delay);
        prop_assert!(jittered >= delay);
        prop_assert!(jittered <= delay + Duration::from_millis(delay_ms / 4 + 1));
    }

    /// Scale decisions never push the pool outside `[min, max]`.
    #[test]
    fn scale_decisions_respect_bounds(
        pending in 0usize..100,
        idle in 0usize..20,
        busy in 0usize..20,
        min in 0usize..8,
        span in 1usize..8,
    ) {
        let config = AutoscalerConfig {
            min_workers: min,
            max_workers: min + span,
            ..AutoscalerConfig::default()
        };
        let live = idle + busy;
        let sample = AutoscalerSample {
            pending_tasks: pending,
            idle_workers: idle,
            busy_workers: busy,
            utilisation: if live == 0 { 0.0 } else { busy as f64 / live as f64 },
            pool_size: live,
        };
        match decide(&config, &sample, true, true) {
            ScaleDecision::Up(step) => {
                prop_assert!(live + step <= config.max_workers);
                prop_assert!(step <= config.scale_up_step);
            }
            ScaleDecision::Down(step) => {
                prop_assert!(live - step >= config.min_workers);
                prop_assert!(step <= config.scale_down_step);
            }
            ScaleDecision::Hold => {}
        }
    }
}

/// Wall time across attempts is at least the no-jitter backoff sum, and with
/// proportional jitter at most 1.25x of it (measured via the tracked sleeps).
#[tokio::test]
async fn retry_sleep_budget_brackets_the_schedule() {
    let base = Duration::from_millis(100);
    let attempts = 4u32;
    let expected: Duration = (1..attempts as usize).map(|n| base * 2u32.pow(n as u32 - 1)).sum();

    for (jitter, upper) in [
        (Jitter::None, expected),
        (Jitter::proportional(), expected.mul_f64(1.25)),
    ] {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::builder()
            .max_attempts(attempts)
            .unwrap()
            .backoff(Backoff::exponential(base))
            .jitter(jitter)
            .sleeper(sleeper.clone())
            .build();
        let counter = Arc::new(AtomicU32::new(0));
        let _ = policy
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::timeout("always"))
                }
            })
            .await;

        let slept = sleeper.total_slept();
        assert!(slept >= expected, "{slept:?} below schedule {expected:?}");
        assert!(slept <= upper + Duration::from_millis(5), "{slept:?} above bound {upper:?}");
        assert_eq!(counter.load(Ordering::SeqCst), attempts);
    }
}

/// Round-robin distributes evenly and deterministically across idle workers.
#[test]
fn round_robin_is_fair_over_cycles() {
    use drover::{WorkerRecord, WorkerStatsTracker, WorkerStatus};
    use std::collections::BTreeSet;
    use std::collections::HashMap;

    let workers: Vec<WorkerRecord> = (0..5)
        .map(|n| WorkerRecord {
            worker_id: format!("w{n}"),
            capabilities: BTreeSet::from(["echo".to_string()]),
            status: WorkerStatus::Idle,
            last_heartbeat_millis: 0,
            registered_at_millis: 0,
            current_task: None,
            stats: WorkerStatsTracker::default(),
        })
        .collect();

    let balancer = LoadBalancer::new(BalancerStrategy::RoundRobin);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..50 {
        let picked = balancer.select("echo", &workers).unwrap();
        *counts.entry(picked).or_default() += 1;
    }
    for n in 0..5 {
        assert_eq!(counts[&format!("w{n}")], 10);
    }
}

/// One-attempt policies execute exactly once and never sleep.
#[tokio::test]
async fn single_attempt_policy_never_sleeps() {
    let sleeper = TrackingSleeper::new();
    let policy = RetryPolicy::builder()
        .max_attempts(1)
        .unwrap()
        .sleeper(sleeper.clone())
        .build();
    let _ = policy
        .execute(|| async { Err::<(), _>(Error::timeout("nope")) })
        .await;
    assert!(sleeper.calls().is_empty());

    // InstantSleeper keeps exhaustive retries quick in tests.
    let fast = RetryPolicy::builder()
        .max_attempts(10)
        .unwrap()
        .sleeper(InstantSleeper)
        .build();
    let started = std::time::Instant::now();
    let _ = fast.execute(|| async { Err::<(), _>(Error::timeout("nope")) }).await;
    assert!(started.elapsed() < Duration::from_millis(200));
}
