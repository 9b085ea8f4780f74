//! Callbacks from the deployment process to the debug session.

use crate::session::emit::{EventEmitter, OutputCategory};
use std::sync::{Arc, Mutex};

/// Interface the deployment collaborators report through.
pub trait DeploymentCallbacks: Send + Sync {
    fn on_file_progress(&self, file_name: &str, completed: u64, total: u64);
    fn on_device_message(&self, source: &str, message: &str);
    fn on_log_message(&self, message: &str);
    fn on_error(&self, message: &str, cause: Option<&dyn std::error::Error>);
}

/// Bridges deployment callbacks to debug event emission.
///
/// Progress callbacks fire on every chunk boundary, so the same
/// (fileName, percentage) pair arrives repeatedly; repeats are non-events,
/// which also makes the terminal 100% notification fire exactly once per
/// file.
pub struct CallbackAdapter {
    emitter: Arc<dyn EventEmitter>,
    last_progress: Mutex<(String, u32)>,
}

impl CallbackAdapter {
    pub fn new(emitter: Arc<dyn EventEmitter>) -> CallbackAdapter {
        CallbackAdapter {
            emitter,
            last_progress: Mutex::new((String::new(), 0)),
        }
    }
}

impl DeploymentCallbacks for CallbackAdapter {
    fn on_file_progress(&self, file_name: &str, completed: u64, total: u64) {
        let percentage = if total == 0 {
            100
        } else {
            (completed * 100 / total) as u32
        };

        let mut last = self.last_progress.lock().expect("should not be poisoned");
        if last.0 == file_name && last.1 == percentage {
            return;
        }
        *last = (file_name.to_string(), percentage);

        self.emitter.emit_deployment_progress(file_name, percentage);
        if percentage >= 100 {
            self.emitter.emit_output(
                OutputCategory::Console,
                &format!("100% of '{file_name}' sent\n"),
            );
        }
    }

    fn on_device_message(&self, source: &str, message: &str) {
        self.emitter.emit_device_message(source, message);
    }

    fn on_log_message(&self, message: &str) {
        self.emitter.emit_output(OutputCategory::Console, message);
    }

    fn on_error(&self, message: &str, cause: Option<&dyn std::error::Error>) {
        match cause {
            Some(cause) => log::error!(target: "deploy", "{message}: {cause}"),
            None => log::error!(target: "deploy", "{message}"),
        }
        self.emitter
            .emit_output(OutputCategory::Console, &format!("ERROR: {message}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::emit::{StopReason, ThreadReason};

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<(String, u32)>>,
        output: Mutex<Vec<String>>,
    }

    impl EventEmitter for Recorder {
        fn emit_output(&self, _category: OutputCategory, message: &str) {
            self.output.lock().unwrap().push(message.to_string());
        }

        fn emit_deployment_progress(&self, file_name: &str, percentage: u32) {
            self.progress
                .lock()
                .unwrap()
                .push((file_name.to_string(), percentage));
        }

        fn emit_device_message(&self, _source: &str, _message: &str) {}
        fn emit_stopped(&self, _thread_id: i64, _reason: StopReason, _text: Option<&str>) {}
        fn emit_thread(&self, _thread_id: i64, _reason: ThreadReason) {}
        fn emit_initialized(&self) {}
        fn emit_terminated(&self) {}
        fn emit_exited(&self, _exit_code: i32) {}
    }

    #[test]
    fn progress_is_non_decreasing_and_dedups_repeats() {
        let recorder = Arc::new(Recorder::default());
        let adapter = CallbackAdapter::new(recorder.clone());

        for completed in [0u64, 100, 100, 512, 1024, 1024, 1024] {
            adapter.on_file_progress("App.dll", completed, 1024);
        }

        let progress = recorder.progress.lock().unwrap();
        assert_eq!(
            *progress,
            vec![
                ("App.dll".to_string(), 0),
                ("App.dll".to_string(), 9),
                ("App.dll".to_string(), 50),
                ("App.dll".to_string(), 100),
            ]
        );
        assert!(progress.windows(2).all(|w| w[0].1 <= w[1].1));

        // terminal notification fired exactly once despite three 100% callbacks
        let output = recorder.output.lock().unwrap();
        let completions = output.iter().filter(|m| m.contains("100% of")).count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn new_file_resets_the_dedup_pair() {
        let recorder = Arc::new(Recorder::default());
        let adapter = CallbackAdapter::new(recorder.clone());

        adapter.on_file_progress("a.dll", 10, 10);
        adapter.on_file_progress("b.dll", 10, 10);

        let output = recorder.output.lock().unwrap();
        assert_eq!(output.iter().filter(|m| m.contains("100% of")).count(), 2);
    }
}
