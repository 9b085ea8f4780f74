//! Diagnostic tracing for the adapter process.

use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// What part of the DAP traffic is traced into the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceLevel {
    #[default]
    Off,
    /// Incoming requests only (`--trace`).
    Requests,
    /// Requests plus outgoing responses and events (`--trace=response`).
    Responses,
}

impl TraceLevel {
    pub fn requests(self) -> bool {
        self != TraceLevel::Off
    }

    pub fn responses(self) -> bool {
        self == TraceLevel::Responses
    }
}

/// Simple file-based tracer for adapter diagnostics.
///
/// Never writes to stdout: in stdio mode that stream belongs to the DAP
/// client.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let stamp = chrono::Utc::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "{stamp} {text}");
        }
    }
}
