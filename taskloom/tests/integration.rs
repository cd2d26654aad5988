//! End-to-end scenarios exercising the wiring `ThreadPoolBuilder` does on top
//! of `taskloom-core`'s individually-tested primitives: submit/run through a
//! built pool, cooperative and non-cooperative cancellation, a circuit
//! breaker tripping and recovering through `submit`, work-stealing draining
//! a lopsided deque, and the autoscaler growing a saturated pool. Mirrors
//! the scenarios named in the scheduling core's own test plan.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taskloom::{
    CircuitBreakerConfig, ErrorCode, ErrorInfo, Job, ScaleUpConfig, ThreadPoolBuilder,
    VictimSelectionPolicy, WorkerPolicy,
};

fn wait_until(deadline: Instant, mut pred: impl FnMut() -> bool) -> bool {
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

#[test]
fn simple_submit_and_run() {
    let pool = ThreadPoolBuilder::new()
        .with_workers(4)
        .build_and_start()
        .unwrap();

    let counter = Arc::new(AtomicU64::new(0));
    for _ in 0..1000 {
        let counter = Arc::clone(&counter);
        pool.submit(Job::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    }

    let ok = wait_until(Instant::now() + Duration::from_secs(5), || {
        counter.load(Ordering::SeqCst) == 1000
    });
    assert!(ok, "expected all 1000 jobs to run");
    assert_eq!(pool.metrics().snapshot().tasks_executed, 1000);
    assert_eq!(pool.metrics().snapshot().tasks_failed, 0);
    pool.stop(false).unwrap();
}

#[test]
fn cooperative_cancellation_stops_promptly() {
    let pool = ThreadPoolBuilder::new()
        .with_workers(2)
        .build_and_start()
        .unwrap();

    let iterations = Arc::new(AtomicUsize::new(0));
    let token = taskloom::CancellationToken::new();
    let job_iterations = Arc::clone(&iterations);
    let job_token = Arc::clone(&token);
    pool.submit(
        Job::new(move || {
            while !job_token.is_cancelled() {
                job_iterations.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(())
        })
        .with_cancellation(token),
    )
    .unwrap();

    // let it spin a couple of iterations, then request immediate shutdown.
    std::thread::sleep(Duration::from_millis(100));
    let started = Instant::now();
    pool.stop(true).unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "immediate stop should not wait for the job to run to completion"
    );
}

#[test]
fn non_cooperative_job_delays_graceful_stop() {
    let pool = ThreadPoolBuilder::new()
        .with_workers(1)
        .build_and_start()
        .unwrap();

    pool.submit(Job::new(|| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(())
    }))
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    pool.stop(false).unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(200),
        "graceful stop must wait for the running job to finish"
    );
}

#[test]
fn circuit_breaker_trips_and_recovers_through_submit() {
    let pool = ThreadPoolBuilder::new()
        .with_workers(2)
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 5,
            minimum_requests: 1000, // keep the rate-based path out of this test
            open_duration: Duration::from_millis(150),
            half_open_max_requests: 1,
            half_open_success_threshold: 1,
            ..Default::default()
        })
        .build_and_start()
        .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let completed = Arc::clone(&completed);
        pool.submit(Job::new(move || {
            completed.fetch_add(1, Ordering::SeqCst);
            Err(ErrorInfo::new(ErrorCode::JobExecutionFailed, "test", "boom"))
        }))
        .unwrap();
    }

    wait_until(Instant::now() + Duration::from_secs(2), || {
        completed.load(Ordering::SeqCst) == 5
    });

    // the breaker has now observed 5 consecutive failures; further
    // submissions should be rejected outright.
    let rejected = wait_until(Instant::now() + Duration::from_secs(1), || {
        matches!(
            pool.submit(Job::new(|| Ok(()))),
            Err(ref e) if e.code == ErrorCode::CircuitOpen
        )
    });
    assert!(rejected, "circuit should be open after consecutive failures");

    // wait past open_duration, then a success should start recovery.
    std::thread::sleep(Duration::from_millis(200));
    let recovered = Arc::new(AtomicUsize::new(0));
    let recovered_job = Arc::clone(&recovered);
    pool.submit(Job::new(move || {
        recovered_job.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }))
    .unwrap();

    let closed = wait_until(Instant::now() + Duration::from_secs(1), || {
        recovered.load(Ordering::SeqCst) == 1
            && pool.submit(Job::new(|| Ok(()))).is_ok()
    });
    assert!(closed, "circuit should close again after a half-open success");
    pool.stop(false).unwrap();
}

#[test]
fn work_stealing_drains_a_lopsided_deque() {
    let pool = ThreadPoolBuilder::new()
        .with_workers(8)
        .with_work_stealing(WorkerPolicy {
            policy: VictimSelectionPolicy::Adaptive,
            ..Default::default()
        })
        .build_and_start()
        .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..2000 {
        let completed = Arc::clone(&completed);
        pool.submit(Job::new(move || {
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    }

    let ok = wait_until(Instant::now() + Duration::from_secs(10), || {
        completed.load(Ordering::SeqCst) == 2000
    });
    assert!(ok, "expected all stolen jobs to complete");
    pool.stop(false).unwrap();
}

#[test]
fn autoscaler_grows_a_saturated_pool() {
    let pool = ThreadPoolBuilder::new()
        .with_workers(2)
        .with_min_workers(2)
        .with_autoscaling(taskloom::AutoscalingPolicy {
            min_workers: 2,
            max_workers: 16,
            sample_interval: Duration::from_millis(100),
            samples_for_decision: 2,
            scale_up: ScaleUpConfig {
                utilization_threshold: 0.5,
                cooldown: Duration::from_millis(100),
                ..Default::default()
            },
            ..Default::default()
        })
        .build_and_start()
        .unwrap();

    for _ in 0..500 {
        let pool_clone = pool.clone();
        let _ = pool_clone.submit(Job::new(|| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        }));
    }

    let grew = wait_until(Instant::now() + Duration::from_secs(3), || {
        pool.worker_count() >= 4
    });
    assert!(grew, "expected the pool to scale up under sustained load");
    assert!(pool.worker_count() <= 16);
    pool.stop(false).unwrap();
}
