//! Integration tests for request slots and the execution lifecycle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert2::{check, let_assert};
use serde_json::{Value, json};
use sluice::{DataParser, Engine, Error, Fetcher, RequestOptions, lock};

fn delayed(delay: Duration) -> Fetcher<u32, u32> {
    Fetcher::new(move |n: u32| async move {
        tokio::time::sleep(delay).await;
        Ok(n)
    })
}

#[tokio::test]
async fn parser_extracts_the_payload() {
    let engine: Engine<Value, ()> = Engine::default();
    let request = engine.request(
        Fetcher::new(|()| async { Ok(json!({ "code": 200, "result": 42 })) }),
        RequestOptions::builder().data_parser(DataParser::from_fn(|raw: Value| {
            match raw.get("code").and_then(Value::as_u64) {
                Some(200) => Ok(raw["result"].clone()),
                code => Err(Error::invalid_data(format!("unexpected code {code:?}"))),
            }
        })),
    );

    let result = request.run(()).await;
    let_assert!(Ok(Some(data)) = result);
    check!(data == json!(42));
    check!(request.state().error.is_none());
    check!(request.context().raw_data() == Some(json!({ "code": 200, "result": 42 })));
}

#[tokio::test]
async fn parser_rejection_is_an_error() {
    let engine: Engine<Value, ()> = Engine::default();
    let request = engine.request(
        Fetcher::new(|()| async { Ok(json!({ "code": 500 })) }),
        RequestOptions::builder().data_parser(DataParser::from_fn(|raw: Value| {
            if raw["code"] == json!(200) {
                Ok(raw)
            } else {
                Err(Error::invalid_data("bad code"))
            }
        })),
    );

    let result = request.run(()).await;
    let_assert!(Err(error) = result);
    check!(error == Error::invalid_data("bad code"));
    check!(request.state().error == Some(Error::invalid_data("bad code")));
    check!(request.state().data.is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelled_execution_is_discarded() {
    let engine: Engine<u32, u32> = Engine::default();
    let request = engine.request(delayed(Duration::from_millis(100)), RequestOptions::builder());
    let discarded = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&discarded);
    let _ = request.hooks().discarded.on_sync(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let running = tokio::spawn(request.context().run(7));
    tokio::time::sleep(Duration::from_millis(10)).await;
    request.cancel();

    let joined = running.await;
    let_assert!(Ok(Ok(data)) = joined);
    check!(data == None);
    tokio::time::sleep(Duration::from_millis(200)).await;
    check!(discarded.load(Ordering::SeqCst) == 1);
    check!(request.state().data == None);
    check!(!request.has_pending());
}

#[tokio::test(start_paused = true)]
async fn dropped_run_releases_the_slot() {
    let engine: Engine<u32, u32> = Engine::default();
    let request = engine.request(
        delayed(Duration::from_millis(100)),
        RequestOptions::builder()
            .single(|_, _| true)
            .loading_delay(Duration::ZERO),
    );
    let finished = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&finished);
    let _ = request.hooks().finally.on_sync(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let timed_out = tokio::time::timeout(Duration::from_millis(10), request.run(1)).await;
    check!(timed_out.is_err());
    check!(!request.has_pending());
    check!(!request.state().loading);
    check!(finished.load(Ordering::SeqCst) == 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    check!(request.state().data == None);
    let next = request.run(2).await;
    check!(next == Ok(Some(2)));
    check!(finished.load(Ordering::SeqCst) == 2);
}

#[tokio::test(start_paused = true)]
async fn latest_execution_wins() {
    let engine: Engine<u32, u32> = Engine::default();
    let request = engine.request(
        Fetcher::new(|n: u32| async move {
            tokio::time::sleep(Duration::from_millis(u64::from(n))).await;
            Ok(n)
        }),
        RequestOptions::builder(),
    );

    let slow = tokio::spawn(request.context().run(100));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let fast = request.run(10).await;
    check!(fast == Ok(Some(10)));
    let slow = slow.await;
    let_assert!(Ok(Ok(_)) = slow);
    check!(request.state().params == 10);
}

#[tokio::test(start_paused = true)]
async fn latest_pointer_moves_to_the_newest_execution() {
    let engine: Engine<u32, u32> = Engine::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let request = engine.request(
        Fetcher::new(|n: u32| async move {
            tokio::time::sleep(Duration::from_millis(u64::from(n))).await;
            Ok(n)
        }),
        RequestOptions::builder().hooks(move |hooks| {
            let log = Arc::clone(&log);
            let _ = hooks.success.on_sync(move |(data, ctx)| {
                lock(&log).push((*data, ctx.is_latest_execution()));
            });
        }),
    );

    let slow = tokio::spawn(request.context().run(100));
    tokio::time::sleep(Duration::from_millis(5)).await;
    request.run(10).await.expect("fast");
    slow.await.expect("join").expect("slow");

    check!(*lock(&seen) == vec![(Some(10), true), (Some(100), false)]);
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let engine: Engine<u32, u32> = Engine::default();
    let request = engine.request(delayed(Duration::ZERO), RequestOptions::builder());
    let disposed = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&disposed);
    let _ = request.hooks().dispose.on_sync(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    request.dispose().await;
    request.dispose().await;

    check!(disposed.load(Ordering::SeqCst) == 1);
    check!(request.is_disposed());
    let after_dispose = request.run(1).await;
    check!(after_dispose == Err(Error::Disposed));
}

#[tokio::test]
async fn state_changes_are_broadcast() {
    let engine: Engine<u32, u32> = Engine::new(RequestOptions::builder().init_data(|| Some(1)));
    let changes = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&changes);
    let request = engine.request(
        delayed(Duration::ZERO),
        RequestOptions::builder().hooks(move |hooks| {
            let log = Arc::clone(&log);
            let _ = hooks.state_change.on_sync(move |(patch, _)| {
                if let Some(data) = &patch.data {
                    lock(&log).push(data.clone());
                }
            });
        }),
    );

    check!(request.state().data == Some(1));
    request.run(1).await.expect("same data");
    request.run(2).await.expect("new data");

    check!(*lock(&changes) == vec![Some(2)]);
}

#[tokio::test]
async fn hooks_fire_in_lifecycle_order() {
    let engine: Engine<u32, u32> = Engine::default();
    let events = Arc::new(Mutex::new(Vec::new()));
    let request = engine.request(delayed(Duration::ZERO), RequestOptions::builder());
    let hooks = request.hooks();

    let log = Arc::clone(&events);
    let _ = hooks.preface.on_sync(move |_| lock(&log).push("preface"));
    let log = Arc::clone(&events);
    let _ = hooks.before.on_sync(move |_| lock(&log).push("before"));
    let log = Arc::clone(&events);
    let _ = hooks.success.on_sync(move |_| lock(&log).push("success"));
    let log = Arc::clone(&events);
    let _ = hooks.after.on_sync(move |_| lock(&log).push("after"));
    let log = Arc::clone(&events);
    let _ = hooks.finally.on_sync(move |_| lock(&log).push("finally"));

    request.run(3).await.expect("run");
    check!(*lock(&events) == vec!["preface", "before", "success", "after", "finally"]);
}
