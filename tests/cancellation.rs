use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use orchestra_rs::errors::CancelledError;
use orchestra_rs::{Cancellation, Endpoint, HttpRequest, Pipeline, Registry};
use serde_json::{json, Value};

fn registry() -> Registry {
    let mut builder = Registry::builder();
    builder.register("item", Endpoint::new("http://api.local/items/{{ .params.id }}"));
    builder.build()
}

fn pipeline(value: Value) -> Pipeline {
    serde_json::from_value(value).expect("pipeline definition")
}

#[test]
fn raising_the_flag_stops_the_run() {
    let flag = Arc::new(AtomicBool::new(false));
    let signal = flag.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let ctx = registry()
        .context_with_cancellation(Cancellation::from_flag(flag))
        .with_transport(move |_: &HttpRequest| -> Result<Value> {
            counter.fetch_add(1, Ordering::SeqCst);
            signal.store(true, Ordering::SeqCst);
            Ok(json!("done"))
        });
    let p = pipeline(json!({
        "steps": [
            { "target": "first", "query": { "endpoint": "item" } },
            { "target": "second", "query": { "endpoint": "item" } }
        ]
    }));

    let failure = p.query(&ctx, None).unwrap_err();
    assert!(failure.downcast_ref::<CancelledError>().is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn transport_errors_after_cancellation_report_the_cancellation() {
    let ctx = registry().context();
    let cancel = ctx.cancellation().clone();
    let ctx = ctx.with_transport(move |_: &HttpRequest| -> Result<Value> {
        cancel.cancel();
        Err(anyhow!("timed out reading response"))
    });
    let p = pipeline(json!({
        "steps": [{ "optional": true, "query": { "endpoint": "item" } }]
    }));

    let failure = p.query(&ctx, None).unwrap_err();
    assert!(failure.downcast_ref::<CancelledError>().is_some());
}

#[test]
fn parallel_failures_wait_for_every_iteration() {
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    let ctx = registry()
        .context()
        .with_transport(move |request: &HttpRequest| -> Result<Value> {
            if request.url.path().ends_with("/b") {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
                return Err(anyhow!("b is broken"));
            }
            thread::sleep(Duration::from_millis(30));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(request.url.path()))
        });
    let p = pipeline(json!({
        "variables": { "ids": ["a", "b", "c"] },
        "steps": [{
            "target": "items",
            "parallel": true,
            "query": { "endpoint": "item", "foreach": "$ids", "params_json": { "id": "item" } }
        }]
    }));

    let failure = p.query(&ctx, None).unwrap_err();
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert!(failure.to_string().contains("b is broken"));
}

#[test]
fn optional_parallel_failures_drop_their_slot() -> Result<()> {
    let ctx = registry()
        .context()
        .with_transport(|request: &HttpRequest| -> Result<Value> {
            if request.url.path().ends_with("/b") {
                Err(anyhow!("b is broken"))
            } else {
                Ok(json!(request.url.path()))
            }
        });
    let p = pipeline(json!({
        "variables": { "ids": ["a", "b", "c"] },
        "steps": [{
            "target": "items",
            "parallel": true,
            "optional": true,
            "query": { "endpoint": "item", "foreach": "$ids", "params_json": { "id": "item" } }
        }]
    }));

    let response = p.query(&ctx, None).map_err(|failure| failure.into_error())?;
    assert_eq!(response.result, json!({ "items": ["/items/a", "/items/c"] }));
    Ok(())
}
