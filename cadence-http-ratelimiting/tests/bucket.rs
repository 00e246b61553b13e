use cadence_http_ratelimiting::{
    Endpoint, Method, RateLimiter, RatelimitHeaders, Work, WorkStatus,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task, time::Instant};

fn endpoint() -> Endpoint {
    Endpoint::new(Method::Get, "channels/{channel_id}/messages", "111")
}

fn present(bucket: &str, limit: u64, remaining: u64, reset_after: &str) -> RatelimitHeaders {
    let limit = limit.to_string();
    let remaining = remaining.to_string();
    let pairs = [
        ("x-ratelimit-bucket", bucket.as_bytes()),
        ("x-ratelimit-limit", limit.as_bytes()),
        ("x-ratelimit-remaining", remaining.as_bytes()),
        ("x-ratelimit-reset-after", reset_after.as_bytes()),
    ];

    RatelimitHeaders::from_pairs(pairs.into_iter()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn bucket_learned_from_first_response() {
    let limiter = RateLimiter::current(true);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let reporter = limiter.clone();
    let work = Work::builder(
        endpoint(),
        WorkStatus::new(),
        Box::new(move |_| {
            let limiter = reporter.clone();
            let tx = tx.clone();

            Box::pin(async move {
                let delay = limiter
                    .handle_response(&endpoint(), 200, &present("abc", 5, 4, "1.000"), false)
                    .unwrap();
                tx.send(()).unwrap();

                delay
            })
        }),
    )
    .build();

    limiter.queue(work).unwrap();
    rx.recv().await.unwrap();
    task::yield_now().await;

    assert_eq!(
        Some("abc".to_owned()),
        limiter.route_hash(&endpoint()).unwrap(),
    );

    let info = limiter.bucket(&endpoint()).unwrap().expect("bucket exists");
    assert_eq!(5, info.limit);
    assert_eq!(4, info.remaining);
    let reset_at = info.reset_at.expect("reset timer started");
    assert!(reset_at.saturating_duration_since(Instant::now()) <= Duration::from_secs(1));
}

#[tokio::test]
async fn fifo_per_bucket() {
    let limiter = RateLimiter::current(true);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    for i in 0..3 {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        let work = Work::builder(
            endpoint(),
            WorkStatus::new(),
            Box::new(move |_| {
                let order = Arc::clone(&order);
                let tx = tx.clone();

                Box::pin(async move {
                    order.lock().unwrap().push(i);
                    tx.send(()).unwrap();

                    None
                })
            }),
        )
        .build();

        limiter.queue(work).unwrap();
    }

    for _ in 0..3 {
        rx.recv().await.unwrap();
    }

    assert_eq!(vec![0, 1, 2], *order.lock().unwrap());
}

#[tokio::test(start_paused = true)]
async fn ratelimited_request_keeps_its_slot() {
    let limiter = RateLimiter::current(true);
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();

    let first = {
        let limiter = limiter.clone();
        let attempts = Arc::clone(&attempts);
        let tx = tx.clone();

        Work::builder(
            endpoint(),
            WorkStatus::new(),
            Box::new(move |_| {
                let limiter = limiter.clone();
                let attempts = Arc::clone(&attempts);
                let tx = tx.clone();

                Box::pin(async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        let pairs = [("retry-after", "2".as_bytes())];
                        let headers = RatelimitHeaders::from_pairs(pairs.into_iter()).unwrap();

                        limiter
                            .handle_response(&endpoint(), 429, &headers, false)
                            .unwrap()
                    } else {
                        let delay = limiter
                            .handle_response(
                                &endpoint(),
                                200,
                                &present("abc", 5, 4, "1.000"),
                                false,
                            )
                            .unwrap();
                        tx.send("first").unwrap();

                        delay
                    }
                })
            }),
        )
        .build()
    };

    let second = {
        let tx = tx.clone();

        Work::builder(
            endpoint(),
            WorkStatus::new(),
            Box::new(move |_| {
                let tx = tx.clone();

                Box::pin(async move {
                    tx.send("second").unwrap();

                    None
                })
            }),
        )
        .build()
    };

    limiter.queue(first).unwrap();
    limiter.queue(second).unwrap();

    // The 429'd request keeps its slot: it completes before the second one
    // despite being retried.
    assert_eq!(Some("first"), rx.recv().await);
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "retried before the bucket delay passed",
    );
    assert_eq!(Some("second"), rx.recv().await);
    assert_eq!(2, attempts.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn queue_migrates_to_learned_bucket() {
    let limiter = RateLimiter::current(true);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let posts = || Endpoint::new(Method::Post, "channels/{channel_id}/messages", "123");

    for name in ["first", "second"] {
        let limiter2 = limiter.clone();
        let tx = tx.clone();
        let work = Work::builder(
            posts(),
            WorkStatus::new(),
            Box::new(move |_| {
                let limiter = limiter2.clone();
                let tx = tx.clone();

                Box::pin(async move {
                    let delay = limiter
                        .handle_response(&posts(), 200, &present("msg", 5, 4, "1.000"), false)
                        .unwrap();
                    tx.send(name).unwrap();

                    delay
                })
            }),
        )
        .build();

        limiter.queue(work).unwrap();
    }

    assert_eq!(Some("first"), rx.recv().await);
    assert_eq!(Some("second"), rx.recv().await);
    task::yield_now().await;

    assert_eq!(Some("msg".to_owned()), limiter.route_hash(&posts()).unwrap());
    assert!(limiter.has(&posts()).unwrap());
}

#[tokio::test(start_paused = true)]
async fn cleanup_preserves_hot_buckets() {
    let limiter = RateLimiter::current(true);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let hot = || Endpoint::new(Method::Get, "guilds/{guild_id}", "1");
    let cold = || Endpoint::new(Method::Get, "users/{user_id}", "N/A");

    let run = |ep: Endpoint, headers: RatelimitHeaders| {
        let limiter = limiter.clone();
        let tx = tx.clone();

        Work::builder(
            ep.clone(),
            WorkStatus::new(),
            Box::new(move |_| {
                let limiter = limiter.clone();
                let tx = tx.clone();
                let ep = ep.clone();
                let headers = headers.clone();

                Box::pin(async move {
                    let delay = limiter.handle_response(&ep, 200, &headers, false).unwrap();
                    tx.send(()).unwrap();

                    delay
                })
            }),
        )
        .build()
    };

    limiter
        .queue(run(hot(), present("hot", 5, 4, "3600.000")))
        .unwrap();
    limiter
        .queue(run(cold(), present("cold", 5, 4, "0.050")))
        .unwrap();

    rx.recv().await.unwrap();
    rx.recv().await.unwrap();
    task::yield_now().await;

    assert!(limiter.has(&hot()).unwrap());
    assert!(limiter.has(&cold()).unwrap());

    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..8 {
        task::yield_now().await;
    }

    assert!(limiter.has(&hot()).unwrap(), "hot bucket was swept");
    assert!(!limiter.has(&cold()).unwrap(), "expired bucket survived");
}
