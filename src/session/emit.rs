//! Canonical debug events and their translation to DAP wire events.
//!
//! The session never builds wire events directly: it goes through
//! [`EventEmitter`] so an IDE integration with different event shapes can
//! swap in its own implementation.

use crate::protocol::Event;
use crate::transport::DapOutput;
use serde_json::json;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputCategory {
    Console,
    Stdout,
    Stderr,
    Device,
    Telemetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StopReason {
    Step,
    Breakpoint,
    Exception,
    Pause,
    Entry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ThreadReason {
    Started,
    Exited,
}

/// User-facing output channel an [`OutputCategory`] lands on.
///
/// Routing is policy, not mechanism: this table is the single place an
/// alternate IDE integration remaps categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    /// Device-originated text (runtime stdout/stderr included).
    Device,
    /// Adapter diagnostics.
    Console,
}

impl OutputChannel {
    pub fn for_category(category: OutputCategory) -> OutputChannel {
        match category {
            OutputCategory::Device | OutputCategory::Stdout | OutputCategory::Stderr => {
                OutputChannel::Device
            }
            OutputCategory::Console | OutputCategory::Telemetry => OutputChannel::Console,
        }
    }

    fn wire_category(self) -> &'static str {
        match self {
            OutputChannel::Device => "device",
            OutputChannel::Console => "console",
        }
    }
}

/// Abstraction for emitting debug events to the IDE.
pub trait EventEmitter: Send + Sync {
    fn emit_output(&self, category: OutputCategory, message: &str);
    fn emit_deployment_progress(&self, file_name: &str, percentage: u32);
    fn emit_device_message(&self, source: &str, message: &str);
    fn emit_stopped(&self, thread_id: i64, reason: StopReason, text: Option<&str>);
    fn emit_thread(&self, thread_id: i64, reason: ThreadReason);
    fn emit_initialized(&self);
    fn emit_terminated(&self);
    fn emit_exited(&self, exit_code: i32);
}

/// DAP implementation of [`EventEmitter`].
pub struct DapEmitter {
    out: DapOutput,
}

impl DapEmitter {
    pub fn new(out: DapOutput) -> DapEmitter {
        DapEmitter { out }
    }

    fn send(&self, event: Event) {
        if let Err(err) = self.out.send_event(event) {
            log::error!(target: "dap", "event not sent: {err:#}");
        }
    }
}

impl EventEmitter for DapEmitter {
    fn emit_output(&self, category: OutputCategory, message: &str) {
        let mut output = message.to_string();
        if !output.ends_with('\n') {
            output.push('\n');
        }
        self.send(Event::new(
            "output",
            Some(json!({
                "category": OutputChannel::for_category(category).wire_category(),
                "output": output,
            })),
        ));
    }

    fn emit_deployment_progress(&self, file_name: &str, percentage: u32) {
        self.send(Event::new(
            "tether/deployProgress",
            Some(json!({
                "fileName": file_name,
                "percentage": percentage,
            })),
        ));
    }

    fn emit_device_message(&self, source: &str, message: &str) {
        let source_lower = source.to_ascii_lowercase();
        let category = if source_lower.starts_with("stdout") || source_lower.starts_with("info") {
            OutputCategory::Device
        } else {
            OutputCategory::Console
        };
        self.emit_output(category, message);
    }

    fn emit_stopped(&self, thread_id: i64, reason: StopReason, text: Option<&str>) {
        self.send(Event::new(
            "stopped",
            Some(json!({
                "threadId": thread_id,
                "reason": reason.to_string(),
                "text": text,
            })),
        ));
    }

    fn emit_thread(&self, thread_id: i64, reason: ThreadReason) {
        self.send(Event::new(
            "thread",
            Some(json!({
                "reason": reason.to_string(),
                "threadId": thread_id,
            })),
        ));
    }

    fn emit_initialized(&self) {
        self.send(Event::new("initialized", None));
    }

    fn emit_terminated(&self) {
        self.send(Event::new("terminated", None));
    }

    fn emit_exited(&self, exit_code: i32) {
        self.send(Event::new("exited", Some(json!({ "exitCode": exit_code }))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_routing_table() {
        assert_eq!(
            OutputChannel::for_category(OutputCategory::Stdout),
            OutputChannel::Device
        );
        assert_eq!(
            OutputChannel::for_category(OutputCategory::Stderr),
            OutputChannel::Device
        );
        assert_eq!(
            OutputChannel::for_category(OutputCategory::Device),
            OutputChannel::Device
        );
        assert_eq!(
            OutputChannel::for_category(OutputCategory::Console),
            OutputChannel::Console
        );
        assert_eq!(
            OutputChannel::for_category(OutputCategory::Telemetry),
            OutputChannel::Console
        );
    }
}
