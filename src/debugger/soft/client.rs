//! Narrow interface to the soft-debugger wire client.
//!
//! The wire protocol itself is an external concern: this module only fixes
//! the command surface and the plain-data descriptor shapes the adapter
//! consumes. [`super::wire`] provides the production TCP client.

use crate::debugger::{Error, ValueFlags};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::mpsc;

pub type EventSender = mpsc::Sender<ClientEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Step,
    Breakpoint,
    Exception,
    UnhandledException,
    Interrupt,
}

/// Unsolicited notification raised by the wire client's listener thread.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Started,
    Ready,
    Stopped {
        kind: StopKind,
        thread_id: i64,
        message: Option<String>,
    },
    ThreadStarted {
        id: i64,
        name: String,
    },
    ThreadExited {
        id: i64,
    },
    Exited {
        code: i32,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessDescriptor {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadDescriptor {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameDescriptor {
    pub index: usize,
    pub method: String,
    pub file: Option<String>,
    pub line: i64,
    pub column: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValueDescriptor {
    pub name: String,
    pub display: String,
    pub type_name: Option<String>,
    /// Non-zero when the value has lazily fetchable children.
    pub value_ref: u64,
    pub flags: ValueFlags,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameSlots {
    pub this: Option<ValueDescriptor>,
    pub parameters: Vec<ValueDescriptor>,
    pub locals: Vec<ValueDescriptor>,
    pub exception: Option<ExceptionDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDescriptor {
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub instance: Option<ValueDescriptor>,
}

/// Command surface of the soft-debug channel.
///
/// Not safe for concurrent calls; [`super::SoftDebugger`] serializes access
/// behind its connection lock.
pub trait SoftClient: Send {
    fn resume(&mut self) -> Result<(), Error>;
    fn step_over(&mut self) -> Result<(), Error>;
    fn step_into(&mut self) -> Result<(), Error>;
    fn step_out(&mut self) -> Result<(), Error>;
    fn interrupt(&mut self) -> Result<(), Error>;
    fn exit(&mut self) -> Result<(), Error>;

    fn processes(&mut self) -> Result<Vec<ProcessDescriptor>, Error>;
    fn threads(&mut self, process_id: i64) -> Result<Vec<ThreadDescriptor>, Error>;
    fn set_active_thread(&mut self, thread_id: i64) -> Result<(), Error>;
    fn backtrace(&mut self, thread_id: i64) -> Result<Vec<FrameDescriptor>, Error>;
    fn frame_slots(&mut self, thread_id: i64, frame_index: usize) -> Result<FrameSlots, Error>;
    fn children(&mut self, value_ref: u64) -> Result<Vec<ValueDescriptor>, Error>;
    fn validate_expression(
        &mut self,
        thread_id: i64,
        frame_index: usize,
        expression: &str,
    ) -> Result<bool, Error>;
    fn evaluate(
        &mut self,
        thread_id: i64,
        frame_index: usize,
        expression: &str,
    ) -> Result<ValueDescriptor, Error>;

    fn set_line_breakpoint(&mut self, file: &str, line: i64) -> Result<u64, Error>;
    fn set_catchpoint(&mut self, exception: &str) -> Result<u64, Error>;
    fn clear_breakpoint(&mut self, wire_id: u64) -> Result<(), Error>;
}

/// Factory establishing the wire connection for [`super::SoftDebugger`].
pub trait SoftConnector: Send + Sync {
    fn connect(
        &self,
        address: IpAddr,
        port: u16,
        assembly_names: &[String],
        events: EventSender,
    ) -> Result<Box<dyn SoftClient>, Error>;
}
