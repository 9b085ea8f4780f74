//! Small shared helpers: cancellation, address resolution, message templates.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Operation was canceled through a [`CancelToken`].
#[derive(Debug, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Cooperative cancellation flag.
///
/// A fresh token is created for every deploy/launch attempt; canceling it
/// makes every subsequent [`CancelToken::checkpoint`] in the running
/// operation fail with [`Canceled`]. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            return Err(Canceled);
        }
        Ok(())
    }

    /// Sleep in small slices so cancellation interrupts the wait.
    pub fn sleep(&self, duration: Duration) -> Result<(), Canceled> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(());
            };
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(Duration::from_millis(50)));
        }
    }
}

/// Resolve a host string to an IP address.
///
/// Accepts dotted-quad/colon-hex literals or a hostname; for hostnames an
/// IPv4 address is preferred when several are available. `None` means the
/// name could not be resolved.
pub fn resolve_address(host: &str) -> Option<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Some(addr);
    }

    let addrs: Vec<_> = (host, 0u16).to_socket_addrs().ok()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
}

pub fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Normalize path separators for the host platform.
pub fn fix_path_separators(path: &str) -> String {
    if cfg!(windows) {
        path.replace('/', "\\")
    } else {
        path.replace('\\', "/")
    }
}

/// Expand `{name}` placeholders in an error message template.
///
/// Unknown names expand to `{name: not found}` so a bad template is visible
/// instead of silently dropped.
pub fn expand_variables(format: &str, variables: &HashMap<&str, String>) -> String {
    static PLACEHOLDER: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("must compile"));

    PLACEHOLDER
        .replace_all(format, |caps: &regex::Captures| {
            let name = &caps[1];
            match variables.get(name) {
                Some(value) => value.clone(),
                None => format!("{{{name}: not found}}"),
            }
        })
        .into_owned()
}

// ---- `util` subcommand -----------------------------------------------------

/// Envelope of a `util` subcommand reply, JSON-encoded to stdout.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct DeviceData {
    pub name: String,
    pub serial: String,
}

/// Run one `util` command and print its JSON response.
pub fn run_util(command: &str, id: Option<String>) -> anyhow::Result<()> {
    let command = command.trim().to_lowercase();
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut response = CommandResponse {
        id,
        command: command.clone(),
        response: None,
        error: None,
    };

    let result = match command.as_str() {
        "devices" => serial_ports().and_then(|devices| Ok(serde_json::to_value(devices)?)),
        _ => Ok(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") })),
    };
    match result {
        Ok(value) => response.response = Some(value),
        Err(err) => response.error = Some(format!("{err:#}")),
    }

    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

/// Enumerate candidate device serial ports. Thin discovery only; anything
/// smarter belongs to the device bridge.
fn serial_ports() -> anyhow::Result<Vec<DeviceData>> {
    let mut devices = Vec::new();
    if cfg!(unix) {
        for entry in std::fs::read_dir("/dev")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("ttyACM") || name.starts_with("ttyUSB") || name.starts_with("cu.usb")
            {
                let path = format!("/dev/{name}");
                devices.push(DeviceData {
                    name: path.clone(),
                    serial: path,
                });
            }
        }
    }
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_checkpoint() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.checkpoint().is_err());
        assert!(token.sleep(Duration::from_secs(10)).is_err());
    }

    #[test]
    fn expand_known_and_unknown_variables() {
        let mut vars = HashMap::new();
        vars.insert("reason", "busy".to_string());

        assert_eq!(
            expand_variables("failed ({reason})", &vars),
            "failed (busy)"
        );
        assert_eq!(
            expand_variables("failed ({other})", &vars),
            "failed ({other: not found})"
        );
    }

    #[test]
    fn resolve_literal_address() {
        assert_eq!(
            resolve_address("127.0.0.1"),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert!(resolve_address("256.0.0.1.invalid.").is_none());
    }
}
