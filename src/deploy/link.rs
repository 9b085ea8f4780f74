//! Device link: the narrow interface to the device deployment channel.
//!
//! The packaging/firmware pipeline and serial enumeration live outside this
//! crate; the orchestrator reaches the device exclusively through
//! [`DeviceLink`]. The production implementation talks to the local device
//! bridge daemon (or directly over `tcp:<addr>` port ids).

use crate::deploy::DeployError;
use crate::rpc::{ConnectOptions, RpcClient, RpcEvent};
use crate::util::CancelToken;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default address of the local device bridge daemon.
pub const BRIDGE_ADDR: &str = "127.0.0.1:4712";

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub device_name: String,
    pub os_version: String,
    pub serial: String,
}

/// Receiver of unsolicited device-channel notifications.
pub trait LinkObserver: Send + Sync {
    fn on_file_progress(&self, file_name: &str, completed: u64, total: u64);
    fn on_device_message(&self, source: &str, message: &str);
}

/// RAII subscription guard: unsubscribes on drop, on every exit path.
pub struct Subscription(Option<Box<dyn FnOnce() + Send>>);

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Subscription {
        Subscription(Some(Box::new(unsubscribe)))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}

/// A live connection to one device.
pub trait DeviceLink: Send + Sync {
    /// The port identifier this link was opened for.
    fn name(&self) -> String;

    fn subscribe(&self, observer: Arc<dyn LinkObserver>) -> Subscription;

    fn wait_attach(&self, token: &CancelToken) -> Result<(), DeployError>;
    fn runtime_enabled(&self, token: &CancelToken) -> Result<bool, DeployError>;
    fn runtime_disable(&self, token: &CancelToken) -> Result<(), DeployError>;
    fn runtime_enable(&self, token: &CancelToken) -> Result<(), DeployError>;
    fn device_info(&self, token: &CancelToken) -> Result<DeviceInfo, DeployError>;

    /// Transfer one file, reporting progress on every chunk boundary.
    fn send_file(&self, local: &Path, token: &CancelToken) -> Result<(), DeployError>;

    /// Bind the debug listener on `port`, hand the device over to debug mode
    /// and block until a debugger client has connected.
    fn start_debug_session(&self, port: u16, token: &CancelToken) -> Result<(), DeployError>;
}

impl std::fmt::Debug for dyn DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceLink").field(&self.name()).finish()
    }
}

pub type LinkFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn DeviceLink>, DeployError> + Send + Sync>;

/// Owns the "current connection" for a session and reuses it while the port
/// id stays the same. Explicitly owned by the orchestrator side; nothing
/// process-global.
pub struct ConnectionManager {
    dial: LinkFactory,
    retries: u32,
    retry_delay: Duration,
    current: Option<Arc<dyn DeviceLink>>,
}

impl ConnectionManager {
    pub fn new(dial: LinkFactory) -> ConnectionManager {
        ConnectionManager {
            dial,
            retries: 10,
            retry_delay: Duration::from_millis(500),
            current: None,
        }
    }

    pub fn with_retry(mut self, retries: u32, retry_delay: Duration) -> ConnectionManager {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn connect(&mut self, port_id: &str) -> Result<Arc<dyn DeviceLink>, DeployError> {
        if let Some(link) = &self.current {
            if link.name() == port_id {
                return Ok(link.clone());
            }
            self.current = None;
        }

        let mut attempt = 0;
        let link = loop {
            match (self.dial)(port_id) {
                Ok(link) => break link,
                Err(err) => {
                    attempt += 1;
                    if attempt > self.retries {
                        log::error!(target: "deploy", "device dial failed: {err:#}");
                        return Err(DeployError::NoConnection(port_id.to_string()));
                    }
                    std::thread::sleep(self.retry_delay);
                }
            }
        };
        self.current = Some(link.clone());
        Ok(link)
    }

    pub fn drop_current(&mut self) {
        self.current = None;
    }
}

type ObserverSlot = Arc<Mutex<Option<Arc<dyn LinkObserver>>>>;

/// Production [`DeviceLink`] over the framed device channel.
pub struct BridgeLink {
    port_id: String,
    rpc: RpcClient,
    observer: ObserverSlot,
}

impl BridgeLink {
    /// Open a link for a port identifier.
    ///
    /// `tcp:<host>:<port>` ids connect straight to a networked device;
    /// anything else (a serial port name) is opened through the local bridge
    /// daemon, which owns the physical transports.
    pub fn dial(port_id: &str) -> Result<Arc<dyn DeviceLink>, DeployError> {
        let (addr, open_via_bridge) = match port_id.strip_prefix("tcp:") {
            Some(rest) => (resolve(rest)?, false),
            None => (resolve(BRIDGE_ADDR)?, true),
        };

        let observer: ObserverSlot = Arc::new(Mutex::new(None));
        let rpc = RpcClient::connect(
            addr,
            &ConnectOptions {
                attempts: 1,
                retry_delay: Duration::ZERO,
            },
            {
                let observer = observer.clone();
                move |event| dispatch_event(&observer, event)
            },
        )
        .map_err(|err| DeployError::Link(format!("dial {port_id}: {err}")))?;

        if open_via_bridge {
            rpc.call("open", json!({ "port": port_id }))?;
        }

        Ok(Arc::new(BridgeLink {
            port_id: port_id.to_string(),
            rpc,
            observer,
        }))
    }

    fn call(&self, token: &CancelToken, command: &str, args: Value) -> Result<Value, DeployError> {
        token.checkpoint()?;
        let reply = self.rpc.call(command, args)?;
        token.checkpoint()?;
        Ok(reply)
    }

    fn notify_progress(&self, file_name: &str, completed: u64, total: u64) {
        let observer = self.observer.lock().expect("should not be poisoned").clone();
        if let Some(observer) = observer {
            observer.on_file_progress(file_name, completed, total);
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, DeployError> {
    addr.to_socket_addrs()
        .map_err(|err| DeployError::Link(format!("bad address '{addr}': {err}")))?
        .next()
        .ok_or_else(|| DeployError::Link(format!("bad address '{addr}'")))
}

fn dispatch_event(observer: &ObserverSlot, event: RpcEvent) {
    let Some(observer) = observer.lock().expect("should not be poisoned").clone() else {
        return;
    };
    let body = &event.body;
    match event.event.as_str() {
        "deviceMessage" => {
            observer.on_device_message(
                body.get("source").and_then(Value::as_str).unwrap_or("unknown"),
                body.get("message").and_then(Value::as_str).unwrap_or_default(),
            );
        }
        "fileProgress" => {
            if let (Some(name), Some(completed), Some(total)) = (
                body.get("fileName").and_then(Value::as_str),
                body.get("completed").and_then(Value::as_u64),
                body.get("total").and_then(Value::as_u64),
            ) {
                observer.on_file_progress(name, completed, total);
            }
        }
        other => log::debug!(target: "deploy", "unknown device event: {other}"),
    }
}

impl DeviceLink for BridgeLink {
    fn name(&self) -> String {
        self.port_id.clone()
    }

    fn subscribe(&self, observer: Arc<dyn LinkObserver>) -> Subscription {
        *self.observer.lock().expect("should not be poisoned") = Some(observer);
        let slot = self.observer.clone();
        Subscription::new(move || {
            *slot.lock().expect("should not be poisoned") = None;
        })
    }

    fn wait_attach(&self, token: &CancelToken) -> Result<(), DeployError> {
        self.call(token, "waitAttach", json!({})).map(|_| ())
    }

    fn runtime_enabled(&self, token: &CancelToken) -> Result<bool, DeployError> {
        let body = self.call(token, "runtimeState", json!({}))?;
        Ok(body.get("enabled").and_then(Value::as_bool).unwrap_or(false))
    }

    fn runtime_disable(&self, token: &CancelToken) -> Result<(), DeployError> {
        self.call(token, "runtimeDisable", json!({})).map(|_| ())
    }

    fn runtime_enable(&self, token: &CancelToken) -> Result<(), DeployError> {
        self.call(token, "runtimeEnable", json!({})).map(|_| ())
    }

    fn device_info(&self, token: &CancelToken) -> Result<DeviceInfo, DeployError> {
        let body = self.call(token, "deviceInfo", json!({}))?;
        serde_json::from_value(body)
            .map_err(|err| DeployError::Link(format!("bad deviceInfo reply: {err}")))
    }

    fn send_file(&self, local: &Path, token: &CancelToken) -> Result<(), DeployError> {
        let data = std::fs::read(local)?;
        let total = data.len() as u64;
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| local.display().to_string());

        self.call(
            token,
            "beginFile",
            json!({ "name": file_name, "size": total }),
        )?;
        self.notify_progress(&file_name, 0, total);

        let mut completed = 0u64;
        for chunk in data.chunks(CHUNK_SIZE) {
            self.call(
                token,
                "writeChunk",
                json!({
                    "name": file_name,
                    "offset": completed,
                    "data": base64::engine::general_purpose::STANDARD.encode(chunk),
                }),
            )?;
            completed += chunk.len() as u64;
            self.notify_progress(&file_name, completed, total);
        }

        self.call(token, "endFile", json!({ "name": file_name }))
            .map(|_| ())
    }

    fn start_debug_session(&self, port: u16, token: &CancelToken) -> Result<(), DeployError> {
        self.call(token, "startDebugSession", json!({ "port": port }))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscription_unsubscribes_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            let _subscription = Subscription::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manager_reuses_link_for_same_port() {
        struct NullLink(String);
        impl DeviceLink for NullLink {
            fn name(&self) -> String {
                self.0.clone()
            }
            fn subscribe(&self, _observer: Arc<dyn LinkObserver>) -> Subscription {
                Subscription::new(|| {})
            }
            fn wait_attach(&self, _token: &CancelToken) -> Result<(), DeployError> {
                Ok(())
            }
            fn runtime_enabled(&self, _token: &CancelToken) -> Result<bool, DeployError> {
                Ok(false)
            }
            fn runtime_disable(&self, _token: &CancelToken) -> Result<(), DeployError> {
                Ok(())
            }
            fn runtime_enable(&self, _token: &CancelToken) -> Result<(), DeployError> {
                Ok(())
            }
            fn device_info(&self, _token: &CancelToken) -> Result<DeviceInfo, DeployError> {
                Ok(DeviceInfo::default())
            }
            fn send_file(&self, _local: &Path, _token: &CancelToken) -> Result<(), DeployError> {
                Ok(())
            }
            fn start_debug_session(
                &self,
                _port: u16,
                _token: &CancelToken,
            ) -> Result<(), DeployError> {
                Ok(())
            }
        }

        let dials = Arc::new(AtomicUsize::new(0));
        let mut manager = ConnectionManager::new({
            let dials = dials.clone();
            Arc::new(move |port_id: &str| {
                dials.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(NullLink(port_id.to_string())) as Arc<dyn DeviceLink>)
            })
        })
        .with_retry(0, Duration::ZERO);

        manager.connect("ttyACM0").unwrap();
        manager.connect("ttyACM0").unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        // a different port id drops the old link and dials again
        manager.connect("ttyACM1").unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }
}
