//! Abstraction over a remote-debugging backend.
//!
//! The session never talks to a concrete debugging engine: everything goes
//! through [`Debugger`] and the entity traits below, so another backend can
//! be slotted in without touching the session. Today one backend exists, the
//! soft-debug adapter in [`soft`].

pub mod error;
pub mod soft;

pub use error::Error;

use std::net::IpAddr;
use strum_macros::{Display, EnumString};

/// Session-local opaque breakpoint id. Monotonically increasing, never
/// reused within a process lifetime, meaningless to the remote target.
pub type BreakpointId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExceptionBreakMode {
    Never,
    Always,
    Unhandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerEventKind {
    SessionStarted,
    SessionReady,
    SessionExited,
    StepCompleted,
    BreakpointHit,
    ExceptionThrown,
    UnhandledException,
    Paused,
    ThreadStarted,
    ThreadExited,
}

/// Plain-data record of a backend lifecycle event. No live entity references
/// cross the listener-thread boundary.
#[derive(Debug, Clone)]
pub struct DebuggerEvent {
    pub kind: DebuggerEventKind,
    pub thread_id: Option<i64>,
    pub message: Option<String>,
    pub exit_code: Option<i32>,
}

impl DebuggerEvent {
    pub fn new(kind: DebuggerEventKind) -> Self {
        DebuggerEvent {
            kind,
            thread_id: None,
            message: None,
            exit_code: None,
        }
    }

    pub fn with_thread(kind: DebuggerEventKind, thread_id: i64) -> Self {
        DebuggerEvent {
            kind,
            thread_id: Some(thread_id),
            message: None,
            exit_code: None,
        }
    }
}

/// Receiver for backend lifecycle events.
///
/// Invoked from the backend listener thread; implementations synchronize
/// internally and must not call back into the raising [`Debugger`] while
/// holding locks the debugger also takes.
pub trait EventHook: Send + Sync {
    fn on_event(&self, event: DebuggerEvent);
}

/// Classification flags attached to an evaluation result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValueFlags {
    pub error: bool,
    pub not_supported: bool,
    pub unknown: bool,
    pub object: bool,
    pub namespace: bool,
}

/// Result of evaluating an expression in a frame context.
pub struct EvalOutcome {
    pub flags: ValueFlags,
    pub variable: Box<dyn DebugVariable>,
}

pub trait DebugVariable: Send + Sync {
    fn name(&self) -> String;
    fn display_value(&self) -> String;
    fn type_name(&self) -> Option<String>;
    fn has_children(&self) -> bool;
    /// Lazily fetched, unordered-but-stable set of child members.
    fn children(&self) -> Result<Vec<Box<dyn DebugVariable>>, Error>;
}

pub trait DebugException: Send + Sync {
    fn message(&self) -> String;
    fn type_name(&self) -> String;
    fn instance(&self) -> Option<Box<dyn DebugVariable>>;
}

pub trait DebugStackFrame: Send + Sync {
    /// Index in the backtrace, 0 = innermost.
    fn index(&self) -> usize;
    fn method_name(&self) -> String;
    fn file_name(&self) -> Option<String>;
    fn line(&self) -> i64;
    fn column(&self) -> i64;
    fn this_reference(&self) -> Option<Box<dyn DebugVariable>>;
    fn parameters(&self) -> Vec<Box<dyn DebugVariable>>;
    fn local_variables(&self) -> Vec<Box<dyn DebugVariable>>;
    fn exception(&self) -> Option<Box<dyn DebugException>>;
    fn validate_expression(&self, expression: &str) -> bool;
    fn evaluate(&self, expression: &str) -> Result<EvalOutcome, Error>;
}

pub trait DebugThread: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> String;
    /// Full backtrace, ordered, index 0 = innermost.
    fn stack_frames(&self) -> Result<Vec<Box<dyn DebugStackFrame>>, Error>;
    fn set_active(&self) -> Result<(), Error>;
}

pub trait DebugProcess: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> String;
    fn threads(&self) -> Result<Vec<Box<dyn DebugThread>>, Error>;
}

/// Line breakpoints and catchpoints are mutually exclusive variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointSpec {
    Line { file: String, line: i64 },
    Catch { exception: String },
}

#[derive(Debug, Clone)]
pub struct BreakpointRef {
    pub id: BreakpointId,
    pub spec: BreakpointSpec,
    pub verified: bool,
}

/// A remote-debugging backend.
///
/// Implementations use interior locking: every mutating operation holds one
/// exclusive lock around the underlying connection and breakpoint table,
/// because the backend object is not safe for concurrent wire access. The
/// lock is never held across a wait that depends on the dispatch side.
pub trait Debugger: Send + Sync {
    /// Connect to the remote target and start the debuggee. Breakpoints
    /// registered before the connection are applied as part of it.
    fn connect(&self, address: IpAddr, port: u16, assembly_names: &[String]) -> Result<(), Error>;

    fn is_running(&self) -> bool;
    fn has_exited(&self) -> bool;
    fn active_thread(&self) -> Option<Box<dyn DebugThread>>;

    // Execution control. Resume/step are no-ops unless the debuggee is
    // currently suspended; pause is a no-op unless it is running.
    fn resume(&self) -> Result<(), Error>;
    fn step_over(&self) -> Result<(), Error>;
    fn step_into(&self) -> Result<(), Error>;
    fn step_out(&self) -> Result<(), Error>;
    fn pause(&self) -> Result<(), Error>;
    fn exit(&self) -> Result<(), Error>;

    fn processes(&self) -> Result<Vec<Box<dyn DebugProcess>>, Error>;

    fn add_line_breakpoint(&self, file: &str, line: i64) -> Result<BreakpointRef, Error>;
    fn add_catchpoint(&self, exception: &str) -> Result<BreakpointRef, Error>;
    fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), Error>;
    fn clear_breakpoints(&self);
    fn breakpoints(&self) -> Vec<BreakpointRef>;

    /// `Never` removes any existing catchpoint for the exact type name, any
    /// other mode creates one if absent. At most one catchpoint per type.
    fn set_exception_break_mode(&self, exception: &str, mode: ExceptionBreakMode)
        -> Result<(), Error>;
}
