//! Global logger plumbing.
//!
//! The adapter starts with a plain `env_logger` sink writing to stderr. Once
//! a DAP session takes over the process output, the session swaps in a logger
//! that forwards records as DAP `output` events. The switcher keeps the
//! `log::set_logger` registration stable across that swap.

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::sync::RwLock;

pub static LOGGER_SWITCHER: Lazy<LoggerSwitcher> = Lazy::new(LoggerSwitcher::default);

#[derive(Default)]
pub struct LoggerSwitcher {
    inner: RwLock<Option<Box<dyn Log>>>,
}

impl LoggerSwitcher {
    pub fn switch(&self, logger: impl Log + 'static, filter: LevelFilter) {
        *self.inner.write().expect("should not be poisoned") = Some(Box::new(logger));
        log::set_max_level(filter);
    }
}

impl Log for LoggerSwitcher {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match self.inner.read().expect("should not be poisoned").as_ref() {
            Some(logger) => logger.enabled(metadata),
            None => false,
        }
    }

    fn log(&self, record: &Record) {
        if let Some(logger) = self.inner.read().expect("should not be poisoned").as_ref() {
            logger.log(record);
        }
    }

    fn flush(&self) {
        if let Some(logger) = self.inner.read().expect("should not be poisoned").as_ref() {
            logger.flush();
        }
    }
}

/// Install the switcher as the process logger with `env_logger` behind it.
pub fn init() {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    LOGGER_SWITCHER.switch(logger, filter);
    let logger: &dyn Log = &*LOGGER_SWITCHER;
    let _ = log::set_logger(logger);
    log::set_max_level(filter);
}
