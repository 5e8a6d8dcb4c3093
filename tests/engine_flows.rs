use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use volley::{
    Config, DelegateEngine, Engine, EngineEvent, EventSink, SimBehavior, SimRule, SimTransport,
    Step, StepFn, StepSpec, UnsupportedDelegate, VolleyError, VolleyResult, VuContext,
};

fn test_config(timeout: u64) -> Arc<Config> {
    Arc::new(Config {
        target: Some("wss://sim".to_string()),
        timeout,
        ..Config::default()
    })
}

fn engine_with(
    behavior: SimBehavior,
    timeout: u64,
) -> (Engine, mpsc::UnboundedReceiver<EngineEvent>) {
    let (sink, rx) = EventSink::channel();
    let engine = Engine::new(
        test_config(timeout),
        Arc::new(SimTransport::new(behavior)),
        Arc::new(UnsupportedDelegate),
        sink,
    );
    (engine, rx)
}

fn rules(rules: Vec<SimRule>) -> SimBehavior {
    SimBehavior {
        rules,
        connect_errors: Vec::new(),
    }
}

fn flow(value: Value) -> Vec<StepSpec> {
    serde_json::from_value(value).expect("parse flow")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn ack_rule(event: &str, args: Vec<Value>) -> SimRule {
    serde_json::from_value(json!({"event": event, "ack": args})).expect("rule")
}

#[tokio::test]
async fn acknowledge_flow_captures_into_the_context() {
    let (engine, mut rx) = engine_with(
        rules(vec![
            ack_rule("authenticate", vec![json!(null), json!({"token": "tok-1"})]),
            ack_rule("user::create", vec![json!(null), json!({"_id": "u77"})]),
        ]),
        10,
    );
    let scenario = engine
        .compile_scenario(&flow(json!([
            {"create": {"service": "authenticate", "data": {"strategy": "local"},
                        "acknowledge": {"capture": {"json": "$[1].token", "as": "token"}}}},
            {"create": {"service": "user", "data": {"name": "ada", "token": "{{ token }}"},
                        "acknowledge": {"capture": {"json": "$[1]._id", "as": "newUserId"}}}}
        ])))
        .expect("compile");

    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    result.expect("scenario");
    assert_eq!(ctx.vars["token"], json!("tok-1"));
    assert_eq!(ctx.vars["newUserId"], json!("u77"));
    assert_eq!(ctx.success_count, 2);
    assert_eq!(ctx.pending_requests, 2);
    assert!(ctx.sockets.is_empty(), "teardown must close connections");

    let events = drain(&mut rx);
    assert!(matches!(events[0], EngineEvent::Started));
    let responses = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::Response { .. }))
        .count();
    assert_eq!(responses, 2);
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Error { .. })));
}

#[tokio::test]
async fn channel_response_flow_validates_and_matches() {
    let (engine, mut rx) = engine_with(
        rules(vec![serde_json::from_value(json!({
            "event": "room::find",
            "emits": [{"channel": "rooms", "data": {"total": 2, "rooms": ["a", "b"]}, "delay_ms": 5}]
        }))
        .expect("rule")]),
        10,
    );
    let scenario = engine
        .compile_scenario(&flow(json!([
            {"find": {"service": "room", "query": {"open": true},
                      "response": {"channel": "rooms",
                                   "capture": {"json": "$.rooms[0]", "as": "firstRoom"},
                                   "match": {"json": "$.total", "value": 2}}}}
        ])))
        .expect("compile");

    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    result.expect("scenario");
    assert_eq!(ctx.vars["firstRoom"], json!("a"));
    assert_eq!(ctx.vars["$"], json!({"total": 2, "rooms": ["a", "b"]}));
    assert_eq!(ctx.received_message_count(), 1);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::Match { success: true, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn missing_channel_response_times_out_and_tears_down() {
    let (engine, mut rx) = engine_with(rules(Vec::new()), 1);
    let scenario = engine
        .compile_scenario(&flow(json!([
            {"find": {"service": "room", "response": {"channel": "rooms"}}},
            {"get": {"service": "room", "id": "r1"}}
        ])))
        .expect("compile");

    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    let err = result.expect_err("step must time out");
    assert!(matches!(err, VolleyError::ResponseTimeout { seconds: 1, .. }));
    assert!(ctx.sockets.is_empty(), "teardown must run on failure too");

    let events = drain(&mut rx);
    // the failing step produced a request but no response measurement
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Request)));
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Response { .. })));
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Error { .. })));
}

#[tokio::test]
async fn failed_matches_commit_nothing_and_fail_the_scenario() {
    let (engine, mut rx) = engine_with(
        rules(vec![ack_rule(
            "room::patch",
            vec![json!(null), json!({"is_archived": true, "rev": 9})],
        )]),
        10,
    );
    let scenario = engine
        .compile_scenario(&flow(json!([
            {"patch": {"service": "room", "data": {"is_archived": true},
                       "acknowledge": {
                           "capture": {"json": "$[1].rev", "as": "rev"},
                           "match": [
                               {"json": "$[1].is_archived", "value": true},
                               {"json": "$[1].rev", "value": 10}
                           ]}}}
        ])))
        .expect("compile");

    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    assert!(matches!(result, Err(VolleyError::MatchFailed)));
    assert!(!ctx.vars.contains_key("rev"), "captures are all-or-nothing");
    assert_eq!(ctx.success_count, 0);

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Match { .. })));
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Error { .. })));
}

#[tokio::test]
async fn namespaces_are_acquired_once_per_context() {
    let (engine, _rx) = engine_with(
        rules(vec![
            ack_rule("room::get", vec![json!(null), json!({"_id": "r1"})]),
        ]),
        10,
    );
    let spec: StepSpec = serde_json::from_value(json!(
        {"get": {"service": "room", "id": "r1", "namespace": "/chat",
                 "acknowledge": {}}}
    ))
    .expect("spec");
    let step = engine.step(&spec).expect("step");

    let mut ctx = VuContext::new(0, 7);
    step.run(&mut ctx).await.expect("first");
    step.run(&mut ctx).await.expect("second");
    // "/chat" only; the default namespace is opened by the scenario wrapper
    assert_eq!(ctx.sockets.len(), 1);
    assert!(ctx.sockets.contains_key("/chat"));

    let mut other = VuContext::new(1, 7);
    step.run(&mut other).await.expect("other context");
    let a = ctx.sockets.get("/chat").expect("ctx conn");
    let b = other.sockets.get("/chat").expect("other conn");
    assert!(!Arc::ptr_eq(a, b), "contexts never share connections");
}

#[tokio::test]
async fn loops_iterate_over_values_with_a_shared_context() {
    let (engine, _rx) = engine_with(
        rules(vec![ack_rule(
            "room::create",
            vec![json!(null), json!({"ok": true})],
        )]),
        10,
    );
    let scenario = engine
        .compile_scenario(&flow(json!([
            {"loop": [
                {"create": {"service": "room", "data": {"name": "{{ room }}"},
                            "acknowledge": {}}}
             ],
             "over": ["lobby", "ops", "dev"],
             "loop_value": "room"}
        ])))
        .expect("compile");

    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    result.expect("scenario");
    assert_eq!(ctx.vars["room"], json!("dev"), "last iteration value");
    // acknowledge with no expectations does not bump success_count
    assert_eq!(ctx.success_count, 0);
    assert_eq!(ctx.pending_requests, 1);
}

#[tokio::test]
async fn counted_loops_expose_the_iteration_index() {
    let (engine, _rx) = engine_with(rules(Vec::new()), 10);
    let scenario = engine
        .compile_scenario(&flow(json!([
            {"loop": [{"think": 0}], "count": 3, "loop_value": "i"}
        ])))
        .expect("compile");
    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    result.expect("scenario");
    assert_eq!(ctx.vars["i"], json!(2));
}

#[tokio::test(start_paused = true)]
async fn think_steps_pause_without_touching_the_protocol() {
    let (engine, mut rx) = engine_with(rules(Vec::new()), 10);
    let scenario = engine
        .compile_scenario(&flow(json!([{"think": "30s"}])))
        .expect("compile");
    let started = tokio::time::Instant::now();
    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    result.expect("scenario");
    assert_eq!(started.elapsed(), std::time::Duration::from_secs(30));
    assert_eq!(ctx.pending_requests, 0, "think steps are not requests");

    let events = drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Request)));
}

#[tokio::test]
async fn connect_errors_abort_the_scenario() {
    let (engine, mut rx) = engine_with(
        SimBehavior {
            rules: Vec::new(),
            connect_errors: vec!["/".to_string()],
        },
        10,
    );
    let scenario = engine
        .compile_scenario(&flow(json!([
            {"get": {"service": "room", "id": "r1"}}
        ])))
        .expect("compile");
    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    assert!(matches!(result, Err(VolleyError::Connection(_))));
    assert!(ctx.sockets.is_empty());
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Error { .. })));
}

struct RecordingDelegate {
    seen: Arc<Mutex<Vec<String>>>,
}

impl DelegateEngine for RecordingDelegate {
    fn step(&self, spec: &serde_json::Map<String, Value>) -> VolleyResult<StepFn> {
        self.seen
            .lock()
            .expect("lock")
            .push(spec.keys().cloned().collect::<Vec<_>>().join(","));
        Ok(Box::new(MarkStep))
    }
}

struct MarkStep;

#[async_trait]
impl Step for MarkStep {
    async fn run(&self, ctx: &mut VuContext) -> VolleyResult<()> {
        ctx.vars.insert("delegated".to_string(), json!(true));
        Ok(())
    }
}

#[tokio::test]
async fn non_service_steps_delegate_wholesale() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (sink, _rx) = EventSink::channel();
    let engine = Engine::new(
        test_config(10),
        Arc::new(SimTransport::new(SimBehavior::default())),
        Arc::new(RecordingDelegate { seen: seen.clone() }),
        sink,
    );
    let scenario = engine
        .compile_scenario(&flow(json!([
            {"url": "/health", "expect": 200}
        ])))
        .expect("compile");
    let (result, ctx) = scenario(VuContext::new(0, 7)).await;
    result.expect("delegate step");
    assert_eq!(ctx.vars["delegated"], json!(true));
    assert_eq!(seen.lock().expect("lock").as_slice(), ["expect,url"]);
}

#[tokio::test]
async fn the_default_delegate_fails_with_the_unknown_keys() {
    let (engine, _rx) = engine_with(rules(Vec::new()), 10);
    let scenario = engine
        .compile_scenario(&flow(json!([{"url": "/health"}])))
        .expect("compile");
    let (result, _ctx) = scenario(VuContext::new(0, 7)).await;
    match result {
        Err(VolleyError::UnrecognizedRequest(msg)) => assert!(msg.contains("url")),
        other => panic!("expected UnrecognizedRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn scenarios_with_multiple_method_keys_fail_to_compile() {
    let (engine, _rx) = engine_with(rules(Vec::new()), 10);
    let err = match engine.compile_scenario(&flow(json!([
        {"get": {"service": "a", "id": "1"}, "find": {"service": "a"}}
    ]))) {
        Ok(_) => panic!("compile must fail"),
        Err(e) => e,
    };
    assert!(matches!(err, VolleyError::UnrecognizedRequest(_)));
}
