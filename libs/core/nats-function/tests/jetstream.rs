//! Integration tests against a real JetStream server.
//!
//! Run with `cargo test -p nats-function -- --ignored` (requires Docker).

use nats_function::{
    handler_fn, AckPolicy, ConnectionManager, FunctionConfig, FunctionMetrics, FunctionRuntime,
    NatsConnector, Provisioned, ReconnectPolicy, Request, Responder, StreamProvisioner,
};
use serde_json::{json, Value};
use std::time::Duration;
use test_utils::assertions::assert_same_items;
use test_utils::{TestDataBuilder, TestNats};

fn config(nats: &TestNats, names: &TestDataBuilder) -> FunctionConfig {
    FunctionConfig::builder()
        .server(nats.connection_string())
        .function_name(names.function("rules"))
        .producer_stream(names.stream("out"))
        .consumer_stream(names.stream("in"))
        .ack_policy(AckPolicy::Explicit)
        .build()
        .expect("valid config")
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_provisioning_is_idempotent_and_additive() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_provisioning_is_idempotent_and_additive");
    let stream = names.stream("orders");

    let (manager, _events) = ConnectionManager::new(
        NatsConnector::new(nats.connection_string(), "provisioning-test"),
        ReconnectPolicy::default(),
        FunctionMetrics::new("provisioning-test"),
    );
    let handle = manager.connect().await.expect("connect");
    let session = handle.session().expect("live session");
    let provisioner = StreamProvisioner::new(Default::default(), Default::default());

    let first = provisioner
        .ensure_stream(session, &stream, None)
        .await
        .expect("create");
    assert_eq!(first, Provisioned::Created);

    let second = provisioner
        .ensure_stream(session, &stream, None)
        .await
        .expect("no-op");
    assert_eq!(second, Provisioned::Unchanged);

    let extra = vec![format!("{stream}.eu"), format!("{stream}.eu")];
    let third = provisioner
        .ensure_stream(session, &stream, Some(&extra))
        .await
        .expect("merge");
    assert_eq!(third, Provisioned::Extended(vec![format!("{stream}.eu")]));

    let subjects = nats.stream_subjects(&stream).await.expect("stream exists");
    let eu = format!("{stream}.eu");
    assert_same_items(&subjects, &[stream.as_str(), eu.as_str()], "merged subjects");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_rule_request_is_answered_on_producer_stream() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_rule_request_is_answered_on_producer_stream");
    let config = config(&nats, &names);
    let input = config.consumer_streams[0].clone();
    let output = config.producer_stream.clone();

    let runtime = FunctionRuntime::start(config.clone(), NatsConnector::from_config(&config))
        .await
        .expect("runtime starts");
    runtime
        .consume(handler_fn(|request: Request, responder: Responder| async move {
            let amt = request.body["amt"].as_u64().unwrap_or(u64::MAX);
            let result = if amt <= 1000 { "pass" } else { "fail" };
            responder.respond(&json!({ "result": result })).await?;
            Ok::<(), eyre::Report>(())
        }))
        .await
        .expect("consume");

    nats.publish_json(&input, &json!({"amt": 100})).await;

    let responses = nats.read_stream(&output, 1, Duration::from_secs(10)).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].0, output);
    let body: Value = serde_json::from_slice(&responses[0].1).expect("json");
    assert_eq!(body, json!({"result": "pass"}));

    let state = runtime.stream_state(&input).await.expect("state");
    assert_eq!(state.consumer_count, 1);

    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_fan_out_to_explicit_subjects() {
    let nats = TestNats::new().await;
    let names = TestDataBuilder::from_test_name("test_fan_out_to_explicit_subjects");
    let config = config(&nats, &names);
    let output = config.producer_stream.clone();

    let runtime = FunctionRuntime::start(config.clone(), NatsConnector::from_config(&config))
        .await
        .expect("runtime starts");

    let audit = names.stream("audit");
    nats.jetstream()
        .create_stream(async_nats::jetstream::stream::Config {
            name: audit.clone(),
            subjects: vec![audit.clone()],
            ..Default::default()
        })
        .await
        .expect("audit stream");

    runtime
        .publish(&json!({"n": 1}), Some(&[output.clone(), audit.clone()]))
        .await
        .expect("fan-out");

    assert_eq!(nats.read_stream(&output, 1, Duration::from_secs(5)).await.len(), 1);
    assert_eq!(nats.read_stream(&audit, 1, Duration::from_secs(5)).await.len(), 1);

    runtime.shutdown().await.expect("shutdown");
}
