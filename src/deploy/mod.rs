//! Deployment orchestrator.
//!
//! Drives the strict step order required before debugging can begin:
//! connect, wait-attach, runtime disable, device info, package, transfer,
//! runtime re-enable, settle. Deploying onto a live runtime is never
//! attempted.

pub mod callbacks;
pub mod link;
pub mod package;

use crate::deploy::callbacks::DeploymentCallbacks;
use crate::deploy::link::{ConnectionManager, DeviceLink, LinkObserver};
use crate::deploy::package::Packager;
use crate::rpc::RpcError;
use crate::util::{CancelToken, Canceled};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Canceled(#[from] Canceled),
    #[error("no device connection available on '{0}'")]
    NoConnection(String),
    #[error("device link: {0}")]
    Link(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("application binary not found at {0}")]
    AppBinaryNotFound(PathBuf),
}

impl From<RpcError> for DeployError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Closed => DeployError::Link("connection closed".to_string()),
            RpcError::Remote(message) => DeployError::Link(message),
            RpcError::Io(err) => DeployError::IO(err),
            RpcError::Json(err) => DeployError::Link(err.to_string()),
        }
    }
}

/// Empirical timing constants of the device boot sequence, exposed as
/// tunables.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Settle window between runtime enable and any debug-listener start.
    /// The device firmware needs it to finish booting; shortening it causes
    /// flaky connects.
    pub settle_delay: Duration,
    /// Window between starting the debug listener and the client connect
    /// attempt, so the listener is bound first.
    pub listener_grace: Duration,
    pub link_retries: u32,
    pub link_retry_delay: Duration,
}

impl Default for DeployOptions {
    fn default() -> Self {
        DeployOptions {
            settle_delay: Duration::from_millis(1500),
            listener_grace: Duration::from_millis(250),
            link_retries: 10,
            link_retry_delay: Duration::from_millis(500),
        }
    }
}

struct ForwardObserver {
    callbacks: Arc<dyn DeploymentCallbacks>,
}

impl LinkObserver for ForwardObserver {
    fn on_file_progress(&self, file_name: &str, completed: u64, total: u64) {
        self.callbacks.on_file_progress(file_name, completed, total);
    }

    fn on_device_message(&self, source: &str, message: &str) {
        self.callbacks.on_device_message(source, message);
    }
}

/// Deploys applications to the device and hands a live link back for the
/// later debug-session start.
pub struct Deployer {
    callbacks: Arc<dyn DeploymentCallbacks>,
    packager: Box<dyn Packager>,
    port_id: String,
    options: DeployOptions,
    token: CancelToken,
}

impl Deployer {
    pub fn new(
        callbacks: Arc<dyn DeploymentCallbacks>,
        packager: Box<dyn Packager>,
        port_id: impl Into<String>,
        options: DeployOptions,
        token: CancelToken,
    ) -> Deployer {
        Deployer {
            callbacks,
            packager,
            port_id: port_id.into(),
            options,
            token,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_id
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    /// Full deploy. Returns the link a debugging session can be started on.
    pub fn deploy(
        &self,
        manager: &mut ConnectionManager,
        folder: &Path,
        debugging: bool,
    ) -> Result<Arc<dyn DeviceLink>, DeployError> {
        self.token.checkpoint()?;
        self.callbacks.on_log_message("Connecting to device...");

        let link = match manager.connect(&self.port_id) {
            Ok(link) => link,
            Err(err) => {
                self.callbacks.on_error("No device connection available.", Some(&err));
                return Err(err);
            }
        };

        let _subscription = link.subscribe(Arc::new(ForwardObserver {
            callbacks: self.callbacks.clone(),
        }));

        let mut past_runtime_gate = false;
        let result = self.run_steps(&link, folder, debugging, &mut past_runtime_gate);

        if let Err(err) = result {
            self.callbacks
                .on_error(&format!("Deployment failed: {err}"), Some(&err));
            if past_runtime_gate {
                // best-effort re-enable; never masks the original error
                if let Err(enable_err) = link.runtime_enable(&self.token) {
                    log::warn!(target: "deploy", "runtime re-enable after failure: {enable_err:#}");
                }
            }
            return Err(err);
        }

        Ok(link)
    }

    fn run_steps(
        &self,
        link: &Arc<dyn DeviceLink>,
        folder: &Path,
        debugging: bool,
        past_runtime_gate: &mut bool,
    ) -> Result<(), DeployError> {
        self.callbacks.on_log_message("Checking runtime state...");
        link.wait_attach(&self.token)?;

        if link.runtime_enabled(&self.token)? {
            self.callbacks.on_log_message("Disabling runtime...");
            link.runtime_disable(&self.token)?;
        }
        *past_runtime_gate = true;

        let info = link.device_info(&self.token)?;
        self.callbacks
            .on_log_message(&format!("Found device with OS v{}", info.os_version));

        let files = self
            .packager
            .prepare(folder, &info.os_version, debugging, &self.token)?;

        for file in &files {
            link.send_file(file, &self.token)?;
        }

        self.callbacks.on_log_message("Enabling runtime...");
        link.runtime_enable(&self.token)?;

        // Settle window before anything tries to bind the debug listener.
        self.token.sleep(self.options.settle_delay)?;
        Ok(())
    }

    /// Reconnect-only path for `skipDeploy` launches.
    pub fn connect_for_debugging(
        &self,
        manager: &mut ConnectionManager,
    ) -> Result<Arc<dyn DeviceLink>, DeployError> {
        self.token.checkpoint()?;
        self.callbacks.on_log_message("Connecting to device...");
        let link = manager.connect(&self.port_id)?;
        link.wait_attach(&self.token)?;
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::link::{DeviceInfo, Subscription};
    use super::package::APP_BINARY;
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct NullCallbacks;

    impl DeploymentCallbacks for NullCallbacks {
        fn on_file_progress(&self, _file_name: &str, _completed: u64, _total: u64) {}
        fn on_device_message(&self, _source: &str, _message: &str) {}
        fn on_log_message(&self, _message: &str) {}
        fn on_error(&self, _message: &str, _cause: Option<&dyn std::error::Error>) {}
    }

    struct RecordingLink {
        ops: Arc<Mutex<Vec<String>>>,
        runtime_enabled: bool,
        fail_on_transfer: bool,
    }

    impl DeviceLink for RecordingLink {
        fn name(&self) -> String {
            "mock".to_string()
        }

        fn subscribe(&self, _observer: Arc<dyn LinkObserver>) -> Subscription {
            let ops = self.ops.clone();
            ops.lock().unwrap().push("subscribe".to_string());
            Subscription::new(move || ops.lock().unwrap().push("unsubscribe".to_string()))
        }

        fn wait_attach(&self, _token: &CancelToken) -> Result<(), DeployError> {
            self.ops.lock().unwrap().push("wait_attach".to_string());
            Ok(())
        }

        fn runtime_enabled(&self, _token: &CancelToken) -> Result<bool, DeployError> {
            self.ops.lock().unwrap().push("runtime_enabled".to_string());
            Ok(self.runtime_enabled)
        }

        fn runtime_disable(&self, _token: &CancelToken) -> Result<(), DeployError> {
            self.ops.lock().unwrap().push("runtime_disable".to_string());
            Ok(())
        }

        fn runtime_enable(&self, _token: &CancelToken) -> Result<(), DeployError> {
            self.ops.lock().unwrap().push("runtime_enable".to_string());
            Ok(())
        }

        fn device_info(&self, _token: &CancelToken) -> Result<DeviceInfo, DeployError> {
            self.ops.lock().unwrap().push("device_info".to_string());
            Ok(DeviceInfo {
                device_name: "devkit".to_string(),
                os_version: "1.8.0".to_string(),
                serial: "mock".to_string(),
            })
        }

        fn send_file(&self, local: &Path, _token: &CancelToken) -> Result<(), DeployError> {
            if self.fail_on_transfer {
                return Err(DeployError::Link("write failed".to_string()));
            }
            self.ops
                .lock()
                .unwrap()
                .push(format!("send {}", local.file_name().unwrap().to_string_lossy()));
            Ok(())
        }

        fn start_debug_session(&self, _port: u16, _token: &CancelToken) -> Result<(), DeployError> {
            self.ops.lock().unwrap().push("start_debug".to_string());
            Ok(())
        }
    }

    struct SingleFilePackager;

    impl Packager for SingleFilePackager {
        fn prepare(
            &self,
            _folder: &Path,
            os_version: &str,
            _debugging: bool,
            _token: &CancelToken,
        ) -> Result<Vec<PathBuf>, DeployError> {
            assert_eq!(os_version, "1.8.0");
            Ok(vec![PathBuf::from(APP_BINARY)])
        }
    }

    fn deployer(token: CancelToken) -> Deployer {
        Deployer::new(
            Arc::new(NullCallbacks),
            Box::new(SingleFilePackager),
            "mock",
            DeployOptions {
                settle_delay: Duration::ZERO,
                ..DeployOptions::default()
            },
            token,
        )
    }

    fn manager_for(link: Arc<dyn DeviceLink>) -> ConnectionManager {
        ConnectionManager::new(Arc::new(move |_: &str| Ok(link.clone())))
            .with_retry(0, Duration::ZERO)
    }

    #[test]
    fn deploy_steps_run_in_strict_order() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let link: Arc<dyn DeviceLink> = Arc::new(RecordingLink {
            ops: ops.clone(),
            runtime_enabled: true,
            fail_on_transfer: false,
        });

        deployer(CancelToken::new())
            .deploy(&mut manager_for(link), Path::new("/out"), true)
            .unwrap();

        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                "subscribe",
                "wait_attach",
                "runtime_enabled",
                "runtime_disable",
                "device_info",
                "send App.dll",
                "runtime_enable",
                "unsubscribe",
            ]
        );
    }

    #[test]
    fn disabled_runtime_is_not_disabled_again() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let link: Arc<dyn DeviceLink> = Arc::new(RecordingLink {
            ops: ops.clone(),
            runtime_enabled: false,
            fail_on_transfer: false,
        });

        deployer(CancelToken::new())
            .deploy(&mut manager_for(link), Path::new("/out"), false)
            .unwrap();

        assert!(!ops.lock().unwrap().iter().any(|op| op == "runtime_disable"));
    }

    #[test]
    fn transfer_failure_still_reenables_runtime_and_unsubscribes() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let link: Arc<dyn DeviceLink> = Arc::new(RecordingLink {
            ops: ops.clone(),
            runtime_enabled: true,
            fail_on_transfer: true,
        });

        let err = deployer(CancelToken::new())
            .deploy(&mut manager_for(link), Path::new("/out"), true)
            .unwrap_err();
        assert!(matches!(err, DeployError::Link(_)));

        let ops = ops.lock().unwrap();
        assert!(ops.iter().any(|op| op == "runtime_enable"));
        assert_eq!(ops.last().unwrap(), "unsubscribe");
    }

    #[test]
    fn canceled_token_stops_before_any_device_interaction() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let link: Arc<dyn DeviceLink> = Arc::new(RecordingLink {
            ops: ops.clone(),
            runtime_enabled: true,
            fail_on_transfer: false,
        });

        let token = CancelToken::new();
        token.cancel();
        let err = deployer(token)
            .deploy(&mut manager_for(link), Path::new("/out"), true)
            .unwrap_err();
        assert!(matches!(err, DeployError::Canceled(_)));
        assert!(ops.lock().unwrap().is_empty());
    }
}
