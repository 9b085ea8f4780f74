//! Production soft-debug channel client over TCP.

use crate::debugger::soft::client::{
    ClientEvent, EventSender, FrameDescriptor, FrameSlots, ProcessDescriptor, SoftClient,
    SoftConnector, StopKind, ThreadDescriptor, ValueDescriptor,
};
use crate::debugger::Error;
use crate::rpc::{ConnectOptions, RpcClient, RpcEvent};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};

/// [`SoftClient`] implementation speaking the framed soft-debug channel.
pub struct WireClient {
    rpc: RpcClient,
}

impl WireClient {
    pub fn connect(
        addr: SocketAddr,
        options: &ConnectOptions,
        assembly_names: &[String],
        events: EventSender,
    ) -> Result<WireClient, Error> {
        let rpc = RpcClient::connect(addr, options, move |event| {
            // A misbehaving or disconnecting target must never take down the
            // adapter: translation failures end up in debug logs only.
            if let Some(event) = translate_event(event) {
                let _ = events.send(event);
            }
        })?;

        rpc.call("handshake", json!({ "assemblies": assembly_names }))?;
        Ok(WireClient { rpc })
    }

    fn call(&self, command: &str, args: Value) -> Result<Value, Error> {
        Ok(self.rpc.call(command, args)?)
    }

    fn call_as<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        args: Value,
    ) -> Result<T, Error> {
        Ok(self.rpc.call_as(command, args)?)
    }
}

fn translate_event(event: RpcEvent) -> Option<ClientEvent> {
    let body = &event.body;
    let thread_id = body.get("threadId").and_then(Value::as_i64);

    let translated = match event.event.as_str() {
        "started" => ClientEvent::Started,
        "ready" => ClientEvent::Ready,
        "stopped" => {
            let kind = match body.get("reason").and_then(Value::as_str) {
                Some("step") => StopKind::Step,
                Some("breakpoint") => StopKind::Breakpoint,
                Some("exception") => StopKind::Exception,
                Some("unhandledException") => StopKind::UnhandledException,
                Some("interrupt") => StopKind::Interrupt,
                other => {
                    log::debug!(target: "debugger", "unknown stop reason: {other:?}");
                    return None;
                }
            };
            ClientEvent::Stopped {
                kind,
                thread_id: thread_id?,
                message: body
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }
        "threadStarted" => ClientEvent::ThreadStarted {
            id: body.get("id").and_then(Value::as_i64)?,
            name: body
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "threadExited" => ClientEvent::ThreadExited {
            id: body.get("id").and_then(Value::as_i64)?,
        },
        "exited" => ClientEvent::Exited {
            code: body.get("code").and_then(Value::as_i64).unwrap_or(0) as i32,
        },
        other => {
            log::debug!(target: "debugger", "unknown wire event: {other}");
            return None;
        }
    };
    Some(translated)
}

impl SoftClient for WireClient {
    fn resume(&mut self) -> Result<(), Error> {
        self.call("resume", json!({})).map(|_| ())
    }

    fn step_over(&mut self) -> Result<(), Error> {
        self.call("stepOver", json!({})).map(|_| ())
    }

    fn step_into(&mut self) -> Result<(), Error> {
        self.call("stepInto", json!({})).map(|_| ())
    }

    fn step_out(&mut self) -> Result<(), Error> {
        self.call("stepOut", json!({})).map(|_| ())
    }

    fn interrupt(&mut self) -> Result<(), Error> {
        self.call("interrupt", json!({})).map(|_| ())
    }

    fn exit(&mut self) -> Result<(), Error> {
        self.call("exit", json!({})).map(|_| ())
    }

    fn processes(&mut self) -> Result<Vec<ProcessDescriptor>, Error> {
        self.call_as("processes", json!({}))
    }

    fn threads(&mut self, process_id: i64) -> Result<Vec<ThreadDescriptor>, Error> {
        self.call_as("threads", json!({ "processId": process_id }))
    }

    fn set_active_thread(&mut self, thread_id: i64) -> Result<(), Error> {
        self.call("setActiveThread", json!({ "threadId": thread_id }))
            .map(|_| ())
    }

    fn backtrace(&mut self, thread_id: i64) -> Result<Vec<FrameDescriptor>, Error> {
        self.call_as("backtrace", json!({ "threadId": thread_id }))
    }

    fn frame_slots(&mut self, thread_id: i64, frame_index: usize) -> Result<FrameSlots, Error> {
        self.call_as(
            "frameSlots",
            json!({ "threadId": thread_id, "frameIndex": frame_index }),
        )
    }

    fn children(&mut self, value_ref: u64) -> Result<Vec<ValueDescriptor>, Error> {
        self.call_as("children", json!({ "valueRef": value_ref }))
    }

    fn validate_expression(
        &mut self,
        thread_id: i64,
        frame_index: usize,
        expression: &str,
    ) -> Result<bool, Error> {
        let body = self.call(
            "validateExpression",
            json!({ "threadId": thread_id, "frameIndex": frame_index, "expression": expression }),
        )?;
        Ok(body.get("valid").and_then(Value::as_bool).unwrap_or(false))
    }

    fn evaluate(
        &mut self,
        thread_id: i64,
        frame_index: usize,
        expression: &str,
    ) -> Result<ValueDescriptor, Error> {
        self.call_as(
            "evaluate",
            json!({ "threadId": thread_id, "frameIndex": frame_index, "expression": expression }),
        )
    }

    fn set_line_breakpoint(&mut self, file: &str, line: i64) -> Result<u64, Error> {
        let body = self.call("setBreakpoint", json!({ "file": file, "line": line }))?;
        body.get("breakpointRef")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Wire("setBreakpoint reply without breakpointRef".to_string()))
    }

    fn set_catchpoint(&mut self, exception: &str) -> Result<u64, Error> {
        let body = self.call("setCatchpoint", json!({ "exception": exception }))?;
        body.get("breakpointRef")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Wire("setCatchpoint reply without breakpointRef".to_string()))
    }

    fn clear_breakpoint(&mut self, wire_id: u64) -> Result<(), Error> {
        self.call("clearBreakpoint", json!({ "breakpointRef": wire_id }))
            .map(|_| ())
    }
}

/// Connector establishing [`WireClient`] connections with a bounded retry
/// policy (the debug listener on the device side may come up a moment after
/// deployment finishes).
pub struct WireConnector {
    options: ConnectOptions,
}

impl WireConnector {
    pub fn new(options: ConnectOptions) -> Self {
        WireConnector { options }
    }
}

impl SoftConnector for WireConnector {
    fn connect(
        &self,
        address: IpAddr,
        port: u16,
        assembly_names: &[String],
        events: EventSender,
    ) -> Result<Box<dyn SoftClient>, Error> {
        let client = WireClient::connect(
            SocketAddr::new(address, port),
            &self.options,
            assembly_names,
            events,
        )?;
        Ok(Box::new(client))
    }
}
