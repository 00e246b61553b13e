mod common;

use common::{client, response, Entity, MockTransport, Script};
use cadence_http::{
    pagination::{PageLimits, Paginator},
    routing::Route,
    ErrorType,
};
use std::sync::Arc;

fn audit_paginator(client: cadence_http::Client) -> Paginator<Entity> {
    Paginator::new(
        client,
        PageLimits::new(1, 2, 100),
        |query| {
            let route = Route::get("guilds/{guild_id}/entries")?.compile(&["9"])?;

            match query.cursor {
                Some(cursor) => {
                    let cursor = cursor.to_string();

                    route.with_query_params(&["before", cursor.as_str()])
                }
                None => Ok(route),
            }
        },
        |entity: &Entity| entity.id,
    )
}

#[tokio::test]
async fn walks_pages_until_exhausted() {
    let transport = MockTransport::new(vec![
        Script::Respond(response(200, r#"[{"id":3},{"id":2}]"#, &[])),
        Script::Respond(response(200, r#"[{"id":1}]"#, &[])),
        Script::Respond(response(200, "[]", &[])),
    ]);
    let paginator = audit_paginator(client(Arc::clone(&transport)));
    paginator.cache(true);

    let all = paginator.take_remaining_async(10).await.unwrap();
    let ids: Vec<u64> = all.iter().map(|entity| entity.id).collect();
    assert_eq!(vec![3, 2, 1], ids);

    let cached: Vec<u64> = paginator.cached().iter().map(|entity| entity.id).collect();
    assert_eq!(vec![3, 2, 1], cached);

    assert_eq!(Some(Entity { id: 1 }), paginator.last());
    assert_eq!(Some(1), paginator.iterator_index());

    // The exhausted tail stays empty.
    let tail = paginator.next_page().await.unwrap();
    assert!(tail.is_empty());

    // Cursor advanced page by page.
    let urls: Vec<String> = transport
        .requests()
        .iter()
        .map(|request| request.url.clone())
        .collect();
    assert!(urls[0].ends_with("/guilds/9/entries"));
    assert!(urls[1].ends_with("/guilds/9/entries?before=2"));
    assert!(urls[2].ends_with("/guilds/9/entries?before=1"));
}

#[tokio::test]
async fn cache_suppresses_repeated_keys() {
    let transport = MockTransport::new(vec![
        Script::Respond(response(200, r#"[{"id":3},{"id":2}]"#, &[])),
        Script::Respond(response(200, r#"[{"id":2},{"id":1}]"#, &[])),
    ]);
    let paginator = audit_paginator(client(transport));
    paginator.cache(true);

    let first = paginator.next_page().await.unwrap();
    assert_eq!(2, first.len());

    // The overlapping entry was already seen and is not yielded again.
    let second = paginator.next_page().await.unwrap();
    let ids: Vec<u64> = second.iter().map(|entity| entity.id).collect();
    assert_eq!(vec![1], ids);

    let cached: Vec<u64> = paginator.cached().iter().map(|entity| entity.id).collect();
    assert_eq!(vec![3, 2, 1], cached);
}

#[tokio::test]
async fn cache_suppresses_duplicates_within_a_page() {
    let transport = MockTransport::new(vec![Script::Respond(response(
        200,
        r#"[{"id":3},{"id":3},{"id":2}]"#,
        &[],
    ))]);
    let paginator = audit_paginator(client(transport));
    paginator.cache(true);

    let page = paginator.next_page().await.unwrap();
    let ids: Vec<u64> = page.iter().map(|entity| entity.id).collect();
    assert_eq!(vec![3, 2], ids);

    let cached: Vec<u64> = paginator.cached().iter().map(|entity| entity.id).collect();
    assert_eq!(vec![3, 2], cached);
}

#[tokio::test]
async fn skip_to_validates_against_the_cache() {
    let transport = MockTransport::new(vec![Script::Respond(response(
        200,
        r#"[{"id":3},{"id":2}]"#,
        &[],
    ))]);
    let paginator = audit_paginator(client(transport));
    paginator.cache(true);

    paginator.next_page().await.unwrap();

    // 3 and 2 are cached; jumping back above the oldest cached key would
    // replay known entries.
    let error = paginator.skip_to(3).unwrap_err();
    assert!(matches!(error.kind(), ErrorType::InvalidArgument { .. }));

    paginator.skip_to(1).unwrap();
    assert_eq!(Some(1), paginator.iterator_index());
    assert_eq!(None, paginator.last());
}

#[tokio::test]
async fn limit_is_clamped() {
    let transport = MockTransport::new(Vec::new());
    let observed = Arc::new(std::sync::Mutex::new(Vec::new()));

    let seen = Arc::clone(&observed);
    let paginator = Paginator::new(
        client(transport),
        PageLimits::new(1, 2, 100),
        move |query| {
            seen.lock().unwrap().push(query.limit);

            Route::get("entries")?.compile(&[])
        },
        |entity: &Entity| entity.id,
    );

    paginator.next_page().await.unwrap();
    paginator.limit(1000);
    paginator.next_page().await.unwrap();

    assert_eq!(vec![2, 100], *observed.lock().unwrap());
}

#[test]
fn blocking_iterator_yields_all_entries() {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let transport = MockTransport::new(vec![
        Script::Respond(response(200, r#"[{"id":3},{"id":2}]"#, &[])),
        Script::Respond(response(200, r#"[{"id":1}]"#, &[])),
        Script::Respond(response(200, "[]", &[])),
    ]);

    let paginator = {
        let _guard = runtime.enter();
        audit_paginator(client(transport))
    };
    paginator.cache(true);

    let ids: Vec<u64> = paginator
        .iter()
        .map(|entry| entry.unwrap().id)
        .collect();

    assert_eq!(vec![3, 2, 1], ids);
}
