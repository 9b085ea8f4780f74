
use dap_client::{LaunchFixture, TestAdapter};
use serde_json::{json, Value};
use serial_test::serial;
use tether::debugger::soft::client::{
    ClientEvent, ExceptionDescriptor, FrameDescriptor, StopKind, ValueDescriptor,
};

fn assert_success(response: &Value, command: &str) {
    assert_eq!(
        response.get("type").and_then(Value::as_str),
        Some("response"),
        "response: {response}"
    );
    assert_eq!(
        response.get("command").and_then(Value::as_str),
        Some(command)
    );
    assert_eq!(
        response.get("success").and_then(Value::as_bool),
        Some(true),
        "response: {response}"
    );
}

fn initialize(adapter: &mut TestAdapter) -> anyhow::Result<()> {
    let response = adapter
        .client
        .request("initialize", json!({ "adapterID": "tether" }))?;
    assert_success(&response, "initialize");

    let body = &response["body"];
    assert_eq!(body["supportsConfigurationDoneRequest"], false);
    assert_eq!(body["supportsFunctionBreakpoints"], false);
    assert_eq!(body["supportsProgressReporting"], true);

    let event = adapter.client.wait_for_event("initialized")?;
    assert_eq!(event.get("type").and_then(Value::as_str), Some("event"));
    Ok(())
}

fn launch(adapter: &mut TestAdapter, fixture: &LaunchFixture, port: u16) -> anyhow::Result<()> {
    let response = adapter
        .client
        .request("launch", fixture.launch_args(port, false))?;
    assert_success(&response, "launch");
    Ok(())
}

/// Stop the debuggee and consume the stopped event.
fn stop_on_breakpoint(adapter: &mut TestAdapter, thread_id: i64) -> anyhow::Result<Value> {
    adapter
        .backend
        .send_stopped(StopKind::Breakpoint, thread_id);
    adapter.client.wait_for_event("stopped")
}

fn first_frame_id(adapter: &mut TestAdapter, thread_id: i64) -> anyhow::Result<i64> {
    let response = adapter
        .client
        .request("stackTrace", json!({ "threadId": thread_id }))?;
    assert_success(&response, "stackTrace");
    Ok(response["body"]["stackFrames"][0]["id"]
        .as_i64()
        .expect("frame id"))
}

/// Execution-control responses go out before the backend call is issued, so
/// call-count assertions have to poll.
fn wait_for_call(adapter: &TestAdapter, call: &str, count: usize) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while adapter.backend.call_count(call) < count {
        assert!(
            std::time::Instant::now() < deadline,
            "backend never reached {count} '{call}' calls"
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

fn one_local(name: &str, display: &str, value_ref: u64) -> ValueDescriptor {
    ValueDescriptor {
        name: name.to_string(),
        display: display.to_string(),
        type_name: Some("System.Int32".to_string()),
        value_ref,
        ..ValueDescriptor::default()
    }
}

#[test]
#[serial]
fn test_initialize_request() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    initialize(&mut adapter)?;
    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_launch_runs_the_full_deploy_sequence() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;

    assert_eq!(
        *adapter.link_ops.lock().unwrap(),
        vec![
            "wait_attach",
            "runtime_enabled",
            "runtime_disable",
            "device_info",
            "send App.dll",
            "runtime_enable",
            "start_debug 5000",
        ]
    );
    assert_eq!(adapter.backend.call_count("connect"), 1);

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_skip_deploy_reconnects_only() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    initialize(&mut adapter)?;
    let response = adapter
        .client
        .request("launch", fixture.launch_args(5000, true))?;
    assert_success(&response, "launch");

    assert_eq!(
        *adapter.link_ops.lock().unwrap(),
        vec!["wait_attach", "start_debug 5000"]
    );

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_launch_without_debug_port_skips_the_debugger() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 1024)?;

    assert_eq!(adapter.backend.call_count("connect"), 0);
    assert!(!adapter
        .link_ops
        .lock()
        .unwrap()
        .iter()
        .any(|op| op.starts_with("start_debug")));

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_launch_validation_failure() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    initialize(&mut adapter)?;

    // serial missing: structured validation error before any device call
    let response = adapter.client.request(
        "launch",
        json!({ "projectPath": "/work/App", "msbuildPropertyFile": "/missing.props" }),
    )?;
    assert_eq!(response["success"], false);
    assert!(
        response["message"]
            .as_str()
            .unwrap()
            .contains("serial is not valid"),
        "response: {response}"
    );
    assert!(adapter.link_ops.lock().unwrap().is_empty());

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_set_breakpoints_is_idempotent() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    initialize(&mut adapter)?;

    let source = json!({ "source": { "path": "/work/App/Program.cs" },
        "breakpoints": [{ "line": 5 }, { "line": 10 }] });
    let response = adapter.client.request("setBreakpoints", source.clone())?;
    assert_success(&response, "setBreakpoints");
    let ids: Vec<i64> = response["body"]["breakpoints"]
        .as_array()
        .unwrap()
        .iter()
        .map(|bp| bp["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);

    // unchanged request: identical ids
    let response = adapter.client.request("setBreakpoints", source)?;
    let same_ids: Vec<i64> = response["body"]["breakpoints"]
        .as_array()
        .unwrap()
        .iter()
        .map(|bp| bp["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, same_ids);

    // line 5 dropped, 15 added: 10 keeps its id, 15 gets a fresh one
    let response = adapter.client.request(
        "setBreakpoints",
        json!({ "source": { "path": "/work/App/Program.cs" },
            "breakpoints": [{ "line": 10 }, { "line": 15 }] }),
    )?;
    let reconciled: Vec<(i64, i64)> = response["body"]["breakpoints"]
        .as_array()
        .unwrap()
        .iter()
        .map(|bp| (bp["line"].as_i64().unwrap(), bp["id"].as_i64().unwrap()))
        .collect();
    assert_eq!(reconciled[0], (10, ids[1]));
    assert_eq!(reconciled[1].0, 15);
    assert!(!ids.contains(&reconciled[1].1));

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_unsupported_source_files_get_zero_breakpoints() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    initialize(&mut adapter)?;

    let response = adapter.client.request(
        "setBreakpoints",
        json!({ "source": { "path": "/work/App/build.py" }, "breakpoints": [{ "line": 3 }] }),
    )?;
    assert_success(&response, "setBreakpoints");
    assert_eq!(
        response["body"]["breakpoints"].as_array().unwrap().len(),
        0
    );

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_breakpoint_stop_and_state_inspection() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    *adapter.backend.frames.lock().unwrap() = vec![FrameDescriptor {
        index: 0,
        method: "App.Main".to_string(),
        file: None,
        line: 12,
        column: 4,
    }];
    adapter.backend.slots.lock().unwrap().locals = vec![one_local("x", "42", 0)];

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;

    let stopped = stop_on_breakpoint(&mut adapter, 7)?;
    assert_eq!(stopped["body"]["threadId"], 7);
    assert_eq!(stopped["body"]["reason"], "breakpoint");

    let frame_id = first_frame_id(&mut adapter, 7)?;

    let scopes = adapter
        .client
        .request("scopes", json!({ "frameId": frame_id }))?;
    assert_success(&scopes, "scopes");
    let scope = &scopes["body"]["scopes"][0];
    assert_eq!(scope["name"], "Local");
    let variables_reference = scope["variablesReference"].as_i64().unwrap();

    let variables = adapter.client.request(
        "variables",
        json!({ "variablesReference": variables_reference }),
    )?;
    assert_success(&variables, "variables");
    let body = variables["body"]["variables"].as_array().unwrap();
    assert_eq!(body.len(), 1);
    assert_eq!(body[0]["name"], "x");
    assert_eq!(body[0]["value"], "42");

    // a second stop invalidates every handle from the previous stop
    adapter.client.request("continue", json!({ "threadId": 7 }))?;
    let _ = stop_on_breakpoint(&mut adapter, 7)?;
    let stale = adapter.client.request(
        "variables",
        json!({ "variablesReference": variables_reference }),
    )?;
    assert_success(&stale, "variables");
    assert_eq!(stale["body"]["variables"].as_array().unwrap().len(), 0);

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_variables_truncate_to_one_hundred_plus_marker() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    *adapter.backend.frames.lock().unwrap() = vec![FrameDescriptor {
        index: 0,
        method: "App.Main".to_string(),
        file: None,
        line: 1,
        column: 0,
    }];
    adapter.backend.slots.lock().unwrap().locals = vec![one_local("items", "List<int>", 42)];
    adapter.backend.children.lock().unwrap().insert(
        42,
        (0..150)
            .map(|i| one_local(&format!("[{i}]"), &i.to_string(), 0))
            .collect(),
    );

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;
    let _ = stop_on_breakpoint(&mut adapter, 1)?;
    let frame_id = first_frame_id(&mut adapter, 1)?;

    let scopes = adapter
        .client
        .request("scopes", json!({ "frameId": frame_id }))?;
    let locals_ref = scopes["body"]["scopes"][0]["variablesReference"]
        .as_i64()
        .unwrap();
    let locals = adapter
        .client
        .request("variables", json!({ "variablesReference": locals_ref }))?;
    let items_ref = locals["body"]["variables"][0]["variablesReference"]
        .as_i64()
        .unwrap();
    assert!(items_ref > 0);

    let children = adapter
        .client
        .request("variables", json!({ "variablesReference": items_ref }))?;
    let children = children["body"]["variables"].as_array().unwrap().clone();
    assert_eq!(children.len(), 101);
    assert_eq!(children[100]["name"], "...");
    assert_eq!(children[99]["name"], "[99]");

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_evaluate_classification() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    *adapter.backend.frames.lock().unwrap() = vec![FrameDescriptor {
        index: 0,
        method: "App.Main".to_string(),
        file: None,
        line: 1,
        column: 0,
    }];

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;
    let _ = stop_on_breakpoint(&mut adapter, 1)?;
    let frame_id = first_frame_id(&mut adapter, 1)?;

    *adapter.backend.eval_result.lock().unwrap() = one_local("", "44", 0);
    let response = adapter.client.request(
        "evaluate",
        json!({ "expression": "x + 2", "frameId": frame_id }),
    )?;
    assert_success(&response, "evaluate");
    assert_eq!(response["body"]["result"], "44");
    assert_eq!(response["body"]["variablesReference"], 0);

    // backend flags an evaluation error with its internal wording
    {
        let mut eval = adapter.backend.eval_result.lock().unwrap();
        eval.display = "the reference not available in the current evaluation context".to_string();
        eval.flags.error = true;
    }
    let response = adapter.client.request(
        "evaluate",
        json!({ "expression": "this.disposed", "frameId": frame_id }),
    )?;
    assert_eq!(response["success"], false);
    assert_eq!(
        response["message"].as_str().unwrap(),
        "Evaluate request failed (not available)."
    );

    // expression rejected by validation
    let response = adapter.client.request(
        "evaluate",
        json!({ "expression": "x !!", "frameId": frame_id }),
    )?;
    assert_eq!(response["success"], false);
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("invalid expression"));

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_exception_stop_captures_the_exception() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    *adapter.backend.frames.lock().unwrap() = vec![FrameDescriptor {
        index: 0,
        method: "App.Crash".to_string(),
        file: None,
        line: 30,
        column: 0,
    }];
    adapter.backend.slots.lock().unwrap().exception = Some(ExceptionDescriptor {
        type_name: "System.NullReferenceException".to_string(),
        message: "Object reference not set to an instance of an object".to_string(),
        instance: Some(one_local("exception", "NullReferenceException", 0)),
    });

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;

    adapter
        .backend
        .send_stopped(StopKind::UnhandledException, 1);
    let stopped = adapter.client.wait_for_event("stopped")?;
    assert_eq!(stopped["body"]["reason"], "exception");
    assert_eq!(
        stopped["body"]["text"],
        "Object reference not set to an instance of an object"
    );

    let frame_id = first_frame_id(&mut adapter, 1)?;
    let scopes = adapter
        .client
        .request("scopes", json!({ "frameId": frame_id }))?;
    assert_eq!(scopes["body"]["scopes"][0]["name"], "Exception");

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_exception_options_round_trip() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;

    let options = |mode: &str| {
        json!({ "exceptionOptions": [
            { "path": [{ "names": ["System.NullReferenceException"] }], "breakMode": mode }
        ]})
    };

    let response = adapter
        .client
        .request("setExceptionBreakpoints", options("always"))?;
    assert_success(&response, "setExceptionBreakpoints");
    assert_eq!(
        adapter
            .backend
            .call_count("set_catchpoint System.NullReferenceException"),
        1
    );

    let response = adapter
        .client
        .request("setExceptionBreakpoints", options("never"))?;
    assert_success(&response, "setExceptionBreakpoints");
    assert_eq!(adapter.backend.call_count("clear_breakpoint"), 1);

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_threads_merge_seen_and_live() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;

    adapter.backend.send_event(ClientEvent::ThreadStarted {
        id: 9,
        name: "worker".to_string(),
    });
    let event = adapter.client.wait_for_event("thread")?;
    assert_eq!(event["body"]["reason"], "started");
    assert_eq!(event["body"]["threadId"], 9);

    let response = adapter.client.request("threads", json!({}))?;
    assert_success(&response, "threads");
    let threads = response["body"]["threads"].as_array().unwrap();
    assert!(threads.iter().any(|t| t["id"] == 9 && t["name"] == "worker"));
    assert!(threads
        .iter()
        .any(|t| t["id"] == 1 && t["name"] == "Main Thread"));

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_continue_resumes_after_stop() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;

    let _ = stop_on_breakpoint(&mut adapter, 1)?;
    let response = adapter.client.request("continue", json!({ "threadId": 1 }))?;
    assert_success(&response, "continue");
    wait_for_call(&adapter, "resume", 1);

    let _ = stop_on_breakpoint(&mut adapter, 1)?;
    let response = adapter.client.request("next", json!({ "threadId": 1 }))?;
    assert_success(&response, "next");
    wait_for_call(&adapter, "step_over", 1);

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_target_exit_terminates_the_session() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;

    adapter.backend.send_event(ClientEvent::Exited { code: 3 });
    let terminated = adapter.client.wait_for_event("terminated")?;
    assert_eq!(
        terminated.get("type").and_then(Value::as_str),
        Some("event")
    );
    let exited = adapter.client.wait_for_event("exited")?;
    assert_eq!(exited["body"]["exitCode"], 3);

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_unrecognized_request() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    initialize(&mut adapter)?;

    let response = adapter.client.request("customNonsense", json!({}))?;
    assert_eq!(response["success"], false);
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("unrecognized request: customNonsense"));

    adapter.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_disconnect_in_attach_mode_resumes_the_target() -> anyhow::Result<()> {
    let mut adapter = TestAdapter::start()?;
    let fixture = LaunchFixture::create()?;

    initialize(&mut adapter)?;
    launch(&mut adapter, &fixture, 5000)?;
    let _ = stop_on_breakpoint(&mut adapter, 1)?;

    let response = adapter.client.request("disconnect", json!({}))?;
    assert_success(&response, "disconnect");
    assert_eq!(adapter.backend.call_count("resume"), 1);
    assert_eq!(adapter.backend.call_count("exit"), 0);

    adapter.shutdown();
    Ok(())
}
