use cadence_http_ratelimiting::{
    Endpoint, Method, RateLimiter, RatelimitHeaders, SkipReason, Work, WorkStatus,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

fn endpoint() -> Endpoint {
    Endpoint::new(Method::Get, "channels/{channel_id}/messages", "111")
}

/// Work that blocks the bucket's worker until the receiver resolves,
/// signalling once it is in flight.
fn blocking(
    name: &'static str,
    started: oneshot::Sender<()>,
    gate: oneshot::Receiver<()>,
    tx: mpsc::UnboundedSender<&'static str>,
) -> Work {
    let channels = Arc::new(Mutex::new(Some((started, gate))));

    Work::builder(
        endpoint(),
        WorkStatus::new(),
        Box::new(move |_| {
            let channels = Arc::clone(&channels);
            let tx = tx.clone();

            Box::pin(async move {
                let channels = channels.lock().unwrap().take();
                if let Some((started, gate)) = channels {
                    let _ = started.send(());
                    let _ = gate.await;
                }
                tx.send(name).unwrap();

                None
            })
        }),
    )
    .build()
}

#[tokio::test]
async fn cancelled_work_is_skipped() {
    let limiter = RateLimiter::current(true);
    let (gate_tx, gate_rx) = oneshot::channel();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (skip_tx, skip_rx) = oneshot::channel();

    let status = WorkStatus::new();
    let doomed = {
        let tx = tx.clone();

        Work::builder(
            endpoint(),
            status.clone(),
            Box::new(move |_| {
                let tx = tx.clone();

                Box::pin(async move {
                    tx.send("doomed").unwrap();

                    None
                })
            }),
        )
        .on_skipped(Box::new(move |reason| {
            skip_tx.send(reason).unwrap();
        }))
        .build()
    };

    let (started_tx, started_rx) = oneshot::channel();
    limiter
        .queue(blocking("blocker", started_tx, gate_rx, tx.clone()))
        .unwrap();
    limiter.queue(doomed).unwrap();

    // The blocker holds the worker, so the cancel lands while the second
    // work is still queued.
    started_rx.await.unwrap();
    status.cancel();
    gate_tx.send(()).unwrap();

    assert_eq!(Some("blocker"), rx.recv().await);
    assert_eq!(SkipReason::Cancelled, skip_rx.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn expired_work_never_reaches_transport() {
    let limiter = RateLimiter::current(true);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (skip_tx, skip_rx) = oneshot::channel();

    // Drain the bucket so the next work has to wait out a 200ms reset.
    let throttle = {
        let limiter = limiter.clone();
        let tx = tx.clone();

        Work::builder(
            endpoint(),
            WorkStatus::new(),
            Box::new(move |_| {
                let limiter = limiter.clone();
                let tx = tx.clone();

                Box::pin(async move {
                    let pairs = [
                        ("x-ratelimit-bucket", "abc".as_bytes()),
                        ("x-ratelimit-limit", "1".as_bytes()),
                        ("x-ratelimit-remaining", "0".as_bytes()),
                        ("x-ratelimit-reset-after", "0.200".as_bytes()),
                    ];
                    let headers = RatelimitHeaders::from_pairs(pairs.into_iter()).unwrap();
                    let delay = limiter
                        .handle_response(&endpoint(), 200, &headers, false)
                        .unwrap();
                    tx.send("throttle").unwrap();

                    delay
                })
            }),
        )
        .build()
    };

    limiter.queue(throttle).unwrap();
    assert_eq!(Some("throttle"), rx.recv().await);

    let executed = Arc::new(AtomicBool::new(false));
    let expiring = {
        let executed = Arc::clone(&executed);

        Work::builder(
            endpoint(),
            WorkStatus::new(),
            Box::new(move |_| {
                let executed = Arc::clone(&executed);

                Box::pin(async move {
                    executed.store(true, Ordering::SeqCst);

                    None
                })
            }),
        )
        .deadline(Instant::now() + std::time::Duration::from_millis(50))
        .on_skipped(Box::new(move |reason| {
            skip_tx.send(reason).unwrap();
        }))
        .build()
    };

    limiter.queue(expiring).unwrap();

    assert_eq!(SkipReason::DeadlineExpired, skip_rx.await.unwrap());
    assert!(!executed.load(Ordering::SeqCst), "expired work was dispatched");
}

#[tokio::test]
async fn cancel_all_spares_priority_work() {
    let limiter = RateLimiter::current(true);
    let (gate_tx, gate_rx) = oneshot::channel();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (skip_tx, skip_rx) = oneshot::channel();

    let ordinary = {
        let tx = tx.clone();

        Work::builder(
            endpoint(),
            WorkStatus::new(),
            Box::new(move |_| {
                let tx = tx.clone();

                Box::pin(async move {
                    tx.send("ordinary").unwrap();

                    None
                })
            }),
        )
        .on_skipped(Box::new(move |reason| {
            skip_tx.send(reason).unwrap();
        }))
        .build()
    };

    let important = {
        let tx = tx.clone();

        Work::builder(
            endpoint(),
            WorkStatus::new(),
            Box::new(move |_| {
                let tx = tx.clone();

                Box::pin(async move {
                    tx.send("important").unwrap();

                    None
                })
            }),
        )
        .priority(true)
        .build()
    };

    let (started_tx, started_rx) = oneshot::channel();
    limiter
        .queue(blocking("blocker", started_tx, gate_rx, tx.clone()))
        .unwrap();
    limiter.queue(ordinary).unwrap();
    limiter.queue(important).unwrap();

    started_rx.await.unwrap();
    assert_eq!(1, limiter.cancel_all().unwrap());
    gate_tx.send(()).unwrap();

    assert_eq!(Some("blocker"), rx.recv().await);
    assert_eq!(SkipReason::Cancelled, skip_rx.await.unwrap());
    assert_eq!(Some("important"), rx.recv().await);
}
