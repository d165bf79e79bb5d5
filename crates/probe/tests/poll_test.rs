use std::time::Duration;

use async_trait::async_trait;
use devstack_probe::{Backoff, PollOutcome, PollPolicy, Probe, ProbeStatus, poll};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Becomes ready a fixed time after creation.
struct ReadyAfter {
    created: Instant,
    after: Option<Duration>,
}

impl ReadyAfter {
    fn new(after: Duration) -> Self {
        Self {
            created: Instant::now(),
            after: Some(after),
        }
    }

    fn never() -> Self {
        Self {
            created: Instant::now(),
            after: None,
        }
    }
}

#[async_trait]
impl Probe for ReadyAfter {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn check(&self) -> ProbeStatus {
        match self.after {
            Some(after) if self.created.elapsed() >= after => ProbeStatus::Ready,
            _ => ProbeStatus::NotReady("still starting".to_string()),
        }
    }
}

/// Never answers within a reasonable time.
struct Hanging;

#[async_trait]
impl Probe for Hanging {
    fn kind(&self) -> &'static str {
        "hanging"
    }

    async fn check(&self) -> ProbeStatus {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        ProbeStatus::Ready
    }
}

fn policy(interval_ms: u64, timeout_secs: u64) -> PollPolicy {
    PollPolicy::fixed(
        Duration::from_millis(interval_ms),
        Duration::from_secs(timeout_secs),
    )
}

#[tokio::test(start_paused = true)]
async fn test_ready_probe_is_healthy_on_first_check() {
    let probe = ReadyAfter::new(Duration::ZERO);

    let outcome = poll(&probe, &policy(1_000, 10), &CancellationToken::new()).await;

    assert_eq!(
        outcome,
        PollOutcome::Healthy {
            elapsed: Duration::ZERO,
            polls: 1,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_healthy_within_one_interval_of_readiness() {
    let probe = ReadyAfter::new(Duration::from_secs(2));

    let outcome = poll(&probe, &policy(1_000, 10), &CancellationToken::new()).await;

    assert!(outcome.is_healthy());
    assert!(outcome.elapsed() >= Duration::from_secs(2));
    assert!(outcome.elapsed() <= Duration::from_secs(3));
    assert_eq!(outcome.polls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_between_checks_is_seen_on_next_check() {
    let probe = ReadyAfter::new(Duration::from_millis(4_500));

    let outcome = poll(&probe, &policy(2_000, 10), &CancellationToken::new()).await;

    assert_eq!(
        outcome,
        PollOutcome::Healthy {
            elapsed: Duration::from_secs(6),
            polls: 4,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_never_ready_times_out_at_deadline() {
    let probe = ReadyAfter::never();

    let outcome = poll(&probe, &policy(3_000, 10), &CancellationToken::new()).await;

    match outcome {
        PollOutcome::TimedOut {
            elapsed,
            polls,
            last_error,
        } => {
            assert_eq!(elapsed, Duration::from_secs(10));
            // Checks at 0, 3, 6, 9 and a final one at the deadline
            assert_eq!(polls, 5);
            assert_eq!(last_error.as_deref(), Some("still starting"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_check_is_bounded_by_deadline() {
    let outcome = poll(&Hanging, &policy(1_000, 5), &CancellationToken::new()).await;

    match outcome {
        PollOutcome::TimedOut {
            elapsed,
            polls,
            last_error,
        } => {
            assert_eq!(elapsed, Duration::from_secs(5));
            assert_eq!(polls, 1);
            assert!(last_error.unwrap().contains("did not complete in time"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_polling() {
    let probe = ReadyAfter::never();
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        canceller.cancel();
    });

    let outcome = poll(&probe, &policy(1_000, 60), &cancel).await;

    assert_eq!(
        outcome,
        PollOutcome::Cancelled {
            elapsed: Duration::from_millis(2_500),
            polls: 3,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_linear_backoff_spaces_out_checks() {
    let probe = ReadyAfter::new(Duration::from_secs(4));
    let policy = PollPolicy {
        interval: Duration::from_secs(1),
        timeout: Duration::from_secs(30),
        backoff: Backoff::Linear {
            step_ms: 1_000,
            max_ms: 10_000,
        },
    };

    let outcome = poll(&probe, &policy, &CancellationToken::new()).await;

    // Checks at 0, 1, 3 and 6
    assert_eq!(
        outcome,
        PollOutcome::Healthy {
            elapsed: Duration::from_secs(6),
            polls: 4,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_probe_does_not_delay_another() {
    let fast = ReadyAfter::new(Duration::from_secs(1));
    let slow = ReadyAfter::never();
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let fast_policy = policy(500, 10);
    let slow_policy = policy(500, 20);

    let fast_poll = async {
        let outcome = poll(&fast, &fast_policy, &cancel).await;
        (outcome, started.elapsed())
    };

    let ((fast_outcome, fast_done), slow_outcome) =
        tokio::join!(fast_poll, poll(&slow, &slow_policy, &cancel));

    assert!(fast_outcome.is_healthy());
    assert_eq!(fast_done, Duration::from_secs(1));
    assert!(matches!(slow_outcome, PollOutcome::TimedOut { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_unrepresentable_timeout_never_expires() {
    let probe = ReadyAfter::new(Duration::from_secs(2));

    let outcome = poll(&probe, &policy(1_000, u64::MAX), &CancellationToken::new()).await;

    assert_eq!(
        outcome,
        PollOutcome::Healthy {
            elapsed: Duration::from_secs(2),
            polls: 3,
        }
    );
}
