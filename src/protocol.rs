//! Debug Adapter Protocol message model.
//!
//! Envelope shapes and the closed set of typed response bodies the adapter
//! produces. Field names are wire-exact: clients match on them byte for
//! byte, so the serde renames here are part of the protocol contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DAP request envelope. Arguments stay schema-free at this layer; every
/// command decodes its own argument struct via [`Request::parse_args`].
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Argument decode failure for a request.
#[derive(Debug, thiserror::Error)]
#[error("invalid '{command}' arguments: {source}")]
pub struct DecodeError {
    pub command: String,
    #[source]
    pub source: serde_json::Error,
}

impl Request {
    pub fn parse_args<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.arguments.clone()).map_err(|source| DecodeError {
            command: self.command.clone(),
            source,
        })
    }
}

/// DAP response envelope.
#[derive(Debug, Serialize)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,
}

impl Response {
    pub fn success(request: &Request, body: Option<ResponseBody>) -> Self {
        Response {
            seq: 0,
            r#type: "response",
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        }
    }

    pub fn error(request: &Request, id: i64, message: String) -> Self {
        Response {
            seq: 0,
            r#type: "response",
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.clone()),
            body: Some(ResponseBody::Error(ErrorBody {
                error: Message { id, format: message },
            })),
        }
    }
}

/// DAP event envelope.
#[derive(Debug, Serialize)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    pub fn new(event: &'static str, body: Option<Value>) -> Self {
        Event {
            seq: 0,
            r#type: "event",
            event,
            body,
        }
    }
}

// ---- response bodies -------------------------------------------------------

/// Closed set of response body variants.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Capabilities(Capabilities),
    StackTrace(StackTraceBody),
    Scopes(ScopesBody),
    Variables(VariablesBody),
    Threads(ThreadsBody),
    Evaluate(EvaluateBody),
    SetBreakpoints(SetBreakpointsBody),
    Error(ErrorBody),
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub supports_configuration_done_request: bool,
    pub supports_function_breakpoints: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_evaluate_for_hovers: bool,
    pub supports_progress_reporting: bool,
    pub exception_breakpoint_filters: Vec<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceBody {
    pub stack_frames: Vec<StackFrame>,
    pub total_frames: i64,
}

#[derive(Debug, Serialize)]
pub struct ScopesBody {
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Serialize)]
pub struct VariablesBody {
    pub variables: Vec<Variable>,
}

#[derive(Debug, Serialize)]
pub struct ThreadsBody {
    pub threads: Vec<Thread>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateBody {
    pub result: String,
    pub variables_reference: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct SetBreakpointsBody {
    pub breakpoints: Vec<Breakpoint>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: Message,
}

/// Structured error payload carried inside an [`ErrorBody`].
#[derive(Debug, Serialize)]
pub struct Message {
    pub id: i64,
    pub format: String,
}

// ---- protocol types --------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub line: i64,
    pub column: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation_hint: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: &'static str,
    pub variables_reference: i64,
    pub expensive: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct Breakpoint {
    pub verified: bool,
    pub line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

// ---- request arguments -----------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchArguments {
    pub project_path: Option<String>,
    pub project_configuration: Option<String>,
    pub debug_port: Option<u16>,
    pub serial: Option<String>,
    pub msbuild_property_file: Option<String>,
    pub skip_deploy: Option<bool>,
    pub address: Option<String>,
    #[serde(rename = "__exceptionOptions")]
    pub exception_options: Option<Vec<ExceptionOption>>,
    /// Forward-compatible catch-all for keys this adapter version does not
    /// interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachArguments {
    pub address: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "__exceptionOptions")]
    pub exception_options: Option<Vec<ExceptionOption>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExceptionOption {
    pub path: Vec<ExceptionPathSegment>,
    pub break_mode: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExceptionPathSegment {
    pub names: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetExceptionBreakpointsArguments {
    pub filters: Vec<String>,
    pub exception_options: Option<Vec<ExceptionOption>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetBreakpointsArguments {
    pub source: Source,
    pub breakpoints: Option<Vec<SourceBreakpoint>>,
    pub lines: Option<Vec<i64>>,
}

impl SetBreakpointsArguments {
    /// Requested line numbers, from whichever field the client used.
    pub fn requested_lines(&self) -> Vec<i64> {
        if let Some(breakpoints) = &self.breakpoints {
            return breakpoints.iter().map(|b| b.line).collect();
        }
        self.lines.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceBreakpoint {
    pub line: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackTraceArguments {
    pub thread_id: i64,
    pub levels: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScopesArguments {
    pub frame_id: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariablesArguments {
    pub variables_reference: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluateArguments {
    pub expression: Option<String>,
    pub frame_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_bodies_serialize_with_wire_names() {
        let response = Response::success(
            &Request {
                seq: 3,
                r#type: "request".to_string(),
                command: "stackTrace".to_string(),
                arguments: Value::Null,
            },
            Some(ResponseBody::StackTrace(StackTraceBody {
                stack_frames: vec![StackFrame {
                    id: 1000,
                    name: "Main".to_string(),
                    source: None,
                    line: 12,
                    column: 0,
                    presentation_hint: Some("subtle"),
                }],
                total_frames: 24,
            })),
        );

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["request_seq"], 3);
        assert_eq!(value["body"]["totalFrames"], 24);
        assert_eq!(value["body"]["stackFrames"][0]["presentationHint"], "subtle");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn launch_arguments_keep_unknown_keys() {
        let request = Request {
            seq: 1,
            r#type: "request".to_string(),
            command: "launch".to_string(),
            arguments: json!({
                "projectPath": "/work/app",
                "debugPort": 5000,
                "serial": "tty1",
                "noLaunchBrowser": true,
            }),
        };

        let args: LaunchArguments = request.parse_args().unwrap();
        assert_eq!(args.project_path.as_deref(), Some("/work/app"));
        assert_eq!(args.debug_port, Some(5000));
        assert!(args.extra.contains_key("noLaunchBrowser"));
    }

    #[test]
    fn exception_options_decode() {
        let request = Request {
            seq: 1,
            r#type: "request".to_string(),
            command: "setExceptionBreakpoints".to_string(),
            arguments: json!({
                "exceptionOptions": [
                    {"path": [{"names": ["System.NullReferenceException"]}], "breakMode": "always"}
                ]
            }),
        };

        let args: SetExceptionBreakpointsArguments = request.parse_args().unwrap();
        let options = args.exception_options.unwrap();
        assert_eq!(options[0].break_mode, "always");
        assert_eq!(options[0].path[0].names[0], "System.NullReferenceException");
    }

    #[test]
    fn malformed_arguments_become_decode_errors() {
        let request = Request {
            seq: 1,
            r#type: "request".to_string(),
            command: "stackTrace".to_string(),
            arguments: json!({"threadId": "seven"}),
        };

        let err = request.parse_args::<StackTraceArguments>().unwrap_err();
        assert_eq!(err.command, "stackTrace");
    }
}
