//! Logger forwarding adapter diagnostics to the connected client.

use crate::session::emit::{EventEmitter, OutputCategory};
use log::LevelFilter;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

/// Routes log records to DAP `output` events on the console channel.
///
/// Filtering follows `env_logger` semantics (`RUST_LOG`). Consecutive
/// identical messages are emitted once; device chatter tends to repeat the
/// same line many times per second.
pub struct DapLogger {
    inner: env_logger::Logger,
    emitter: Arc<dyn EventEmitter>,
    previous: Mutex<String>,
}

impl DapLogger {
    pub fn new(emitter: Arc<dyn EventEmitter>) -> DapLogger {
        DapLogger {
            inner: env_logger::Logger::from_default_env(),
            emitter,
            previous: Mutex::new(String::new()),
        }
    }

    pub fn filter(&self) -> LevelFilter {
        self.inner.filter()
    }
}

impl log::Log for DapLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut output = String::new();
        write!(output, "[{}] ", record.level()).expect("write to string");
        if let Some(module) = record.module_path() {
            write!(output, "{module} ").expect("write to string");
        }
        write!(output, "{}", record.args()).expect("write to string");

        {
            let mut previous = self.previous.lock().expect("should not be poisoned");
            if *previous == output {
                return;
            }
            previous.clone_from(&output);
        }

        self.emitter.emit_output(OutputCategory::Console, &output);
    }

    fn flush(&self) {}
}
