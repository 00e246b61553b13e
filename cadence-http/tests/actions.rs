mod common;

use common::{client, response, Entity, MockTransport, Script};
use cadence_http::{routing::Route, ErrorType, RestAction};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

fn messages_route(channel_id: &str) -> cadence_http::routing::CompiledRoute {
    Route::get("channels/{channel_id}/messages")
        .unwrap()
        .compile(&[channel_id])
        .unwrap()
}

#[tokio::test]
async fn map_transforms_the_value() {
    let transport = MockTransport::new(vec![Script::Respond(response(200, r#"{"id":4}"#, &[]))]);
    let client = client(transport);

    let route = Route::get("users/{user_id}").unwrap().compile(&["4"]).unwrap();
    let doubled = client
        .request::<Entity>(route)
        .map(|entity| entity.id * 2)
        .submit()
        .await
        .unwrap();

    assert_eq!(8, doubled);
}

#[tokio::test]
async fn try_map_failures_become_action_failures() {
    let transport = MockTransport::new(vec![Script::Respond(response(200, r#"{"id":4}"#, &[]))]);
    let client = client(transport);

    let route = Route::get("users/{user_id}").unwrap().compile(&["4"]).unwrap();
    let error = client
        .request::<Entity>(route)
        .try_map(|_| Err::<u64, _>(cadence_http::Error::invalid_argument("nope")))
        .submit()
        .await
        .unwrap_err();

    assert!(matches!(error.kind(), ErrorType::InvalidArgument { .. }));
}

#[tokio::test]
async fn flat_map_chains_requests_in_order() {
    let transport = MockTransport::new(vec![
        Script::Respond(response(200, r#"{"id":1}"#, &[])),
        Script::Respond(response(200, r#"{"id":2}"#, &[])),
    ]);
    let client = client(Arc::clone(&transport));

    let first = messages_route("10");
    let chained_client = client.clone();

    let sum = client
        .request::<Entity>(first)
        .flat_map(move |entity| {
            chained_client
                .request::<Entity>(messages_route("10"))
                .map(move |second| entity.id + second.id)
        })
        .submit()
        .await
        .unwrap();

    assert_eq!(3, sum);
    assert_eq!(2, transport.sent());
}

#[tokio::test]
async fn zip_completes_with_both_values() {
    let transport = MockTransport::new(vec![
        Script::Respond(response(200, r#"{"id":1}"#, &[])),
        Script::Respond(response(200, r#"{"id":2}"#, &[])),
    ]);
    let client = client(Arc::clone(&transport));

    // Same route, so the two requests share a bucket and dispatch in
    // queue order.
    let left = client.request::<Entity>(messages_route("77"));
    let right = client.request::<Entity>(messages_route("77"));

    let (first, second) = left.zip(right).submit().await.unwrap();
    assert_eq!(1, first.id);
    assert_eq!(2, second.id);
}

#[tokio::test]
async fn zip_failure_cancels_the_sibling() {
    let transport = MockTransport::new(vec![Script::Respond(response(
        404,
        r#"{"code": 10003, "message": "Unknown Channel"}"#,
        &[],
    ))]);
    let client = client(Arc::clone(&transport));

    let left = client.request::<Entity>(messages_route("404"));
    let right = client.request::<Entity>(messages_route("404"));

    let error = left.zip(right).submit().await.unwrap_err();
    assert!(matches!(error.kind(), ErrorType::Response { .. }));

    // The sibling was cancelled before it could dispatch.
    tokio::task::yield_now().await;
    assert_eq!(1, transport.sent());
}

#[tokio::test]
async fn on_error_map_recovers_matching_failures() {
    let transport = MockTransport::new(vec![Script::Respond(response(
        404,
        r#"{"code": 10003, "message": "Unknown Channel"}"#,
        &[],
    ))]);
    let client = client(transport);

    let entity = client
        .request::<Entity>(messages_route("404"))
        .on_error_map(
            |error| matches!(error.kind(), ErrorType::Response { .. }),
            |_| Entity { id: 0 },
        )
        .submit()
        .await
        .unwrap();

    assert_eq!(Entity { id: 0 }, entity);
}

#[tokio::test]
async fn failed_check_cancels_before_transport() {
    let transport = MockTransport::new(Vec::new());
    let client = client(Arc::clone(&transport));

    let error = client
        .request::<Entity>(messages_route("1"))
        .check(|| false)
        .submit()
        .await
        .unwrap_err();

    assert!(matches!(error.kind(), ErrorType::Cancelled));
    assert_eq!(0, transport.sent());
}

#[tokio::test(start_paused = true)]
async fn passed_deadline_times_out_before_transport() {
    let transport = MockTransport::new(Vec::new());
    let client = client(Arc::clone(&transport));

    let action = client
        .request::<Entity>(messages_route("1"))
        .timeout(Duration::from_millis(10));

    tokio::time::advance(Duration::from_millis(20)).await;

    let error = action.submit().await.unwrap_err();
    assert!(matches!(error.kind(), ErrorType::Timeout));
    assert_eq!(0, transport.sent());
}

#[tokio::test]
async fn cancelled_action_never_dispatches() {
    let transport = MockTransport::new(Vec::new());
    let client = client(Arc::clone(&transport));

    let action = client.request::<Entity>(messages_route("1"));
    action.cancel();

    let error = action.submit().await.unwrap_err();
    assert!(matches!(error.kind(), ErrorType::Cancelled));
    assert_eq!(0, transport.sent());
}

#[tokio::test]
async fn queue_fires_success_exactly_once() {
    let transport = MockTransport::new(vec![Script::Respond(response(200, r#"{"id":6}"#, &[]))]);
    let client = client(transport);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);

    client.request::<Entity>(messages_route("6")).queue(
        Some(Box::new(move |entity: Entity| {
            counted.fetch_add(1, Ordering::SeqCst);
            tx.send(entity).unwrap();
        })),
        Some(Box::new(|error| panic!("unexpected failure: {error}"))),
    );

    let entity = rx.recv().await.unwrap();
    assert_eq!(6, entity.id);

    tokio::task::yield_now().await;
    assert_eq!(1, calls.load(Ordering::SeqCst));
}

#[tokio::test]
async fn completed_actions_short_circuit() {
    let transport = MockTransport::new(Vec::new());
    let client = client(Arc::clone(&transport));

    let value = RestAction::completed(&client, 41_u64)
        .map(|value| value + 1)
        .submit()
        .await
        .unwrap();
    assert_eq!(42, value);

    // A resolved value ignores checks and deadlines entirely.
    let value = RestAction::completed(&client, 7_u64)
        .check(|| false)
        .submit()
        .await
        .unwrap();
    assert_eq!(7, value);

    assert_eq!(0, transport.sent());
}

#[tokio::test]
async fn complete_refuses_the_async_context() {
    let transport = MockTransport::new(Vec::new());
    let client = client(transport);

    let error = client
        .request::<Entity>(messages_route("1"))
        .complete()
        .unwrap_err();

    assert!(matches!(error.kind(), ErrorType::InvalidState { .. }));
}

#[test]
fn complete_blocks_outside_the_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let transport = MockTransport::new(vec![
        Script::Respond(response(200, r#"{"id":5}"#, &[])),
        Script::Respond(response(
            429,
            r#"{"message": "You are being rate limited.", "retry_after": 2.5}"#,
            &[
                ("retry-after", "2"),
                ("via", "1.1 proxy"),
                ("content-type", "application/json"),
            ],
        )),
    ]);

    let client = {
        let _guard = runtime.enter();
        client(Arc::clone(&transport))
    };

    let entity: Entity = client
        .request(messages_route("5"))
        .complete()
        .unwrap();
    assert_eq!(5, entity.id);

    // A 429 on the blocking path is handled locally: it surfaces as a
    // ratelimited failure instead of being requeued, and the JSON body's
    // longer delay wins over the header.
    let error = client
        .request::<Entity>(messages_route("5"))
        .complete()
        .unwrap_err();

    match error.kind() {
        ErrorType::RateLimited {
            bucket_route,
            retry_after,
        } => {
            assert_eq!("GET/channels/{channel_id}/messages", bucket_route);
            assert_eq!(Duration::from_millis(2500), *retry_after);
        }
        other => panic!("unexpected error kind: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn submit_future_can_be_cancelled() {
    let transport = MockTransport::new(Vec::new());
    let client = client(Arc::clone(&transport));

    // The delay holds the dispatch long enough for the cancel to land
    // first.
    let future = client
        .request::<Entity>(messages_route("1"))
        .delay(Duration::from_secs(60))
        .submit();
    future.cancel();

    let error = future.await.unwrap_err();
    assert!(matches!(error.kind(), ErrorType::Cancelled));
    assert_eq!(0, transport.sent());
}
