//! Framed command/reply/event client shared by the device channels.
//!
//! Both the soft-debug channel and the device deployment channel speak the
//! same envelope: `Content-Length`-framed JSON objects, requests carrying an
//! `id` that the reply echoes, and unsolicited `event` objects interleaved
//! by the remote side. Payload shapes are opaque at this layer.

use crate::transport::{read_frame, write_frame};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::BufReader;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connection closed")]
    Closed,
    #[error("remote error: {0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Bounded connection retry policy.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            attempts: 20,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Unsolicited message from the remote side.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcEvent {
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    id: u64,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    body: Value,
}

type Pending = Arc<Mutex<Option<HashMap<u64, SyncSender<RpcReply>>>>>;

pub struct RpcClient {
    stream: Mutex<TcpStream>,
    next_id: AtomicU64,
    pending: Pending,
}

impl RpcClient {
    /// Connect with the bounded retry policy and start the reader thread.
    ///
    /// `events` is invoked from the reader thread for every unsolicited
    /// message; it must never panic.
    pub fn connect(
        addr: SocketAddr,
        options: &ConnectOptions,
        events: impl Fn(RpcEvent) + Send + 'static,
    ) -> Result<RpcClient, RpcError> {
        let mut attempt = 0;
        let stream = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(err) => {
                    attempt += 1;
                    if attempt >= options.attempts {
                        return Err(err.into());
                    }
                    thread::sleep(options.retry_delay);
                }
            }
        };
        stream.set_nodelay(true)?;

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader_stream = stream.try_clone()?;
        thread::spawn({
            let pending = pending.clone();
            move || reader_loop(reader_stream, pending, events)
        });

        Ok(RpcClient {
            stream: Mutex::new(stream),
            next_id: AtomicU64::new(1),
            pending,
        })
    }

    /// Issue a command and block until its reply arrives.
    pub fn call(&self, command: &str, args: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = sync_channel(1);

        {
            let mut pending = self.pending.lock().expect("should not be poisoned");
            let Some(map) = pending.as_mut() else {
                return Err(RpcError::Closed);
            };
            map.insert(id, reply_tx);
        }

        let payload = serde_json::to_vec(&serde_json::json!({
            "id": id,
            "command": command,
            "args": args,
        }))?;

        let write_result = {
            let mut stream = self.stream.lock().expect("should not be poisoned");
            write_frame(&mut *stream, &payload)
        };
        if let Err(err) = write_result {
            if let Some(map) = self
                .pending
                .lock()
                .expect("should not be poisoned")
                .as_mut()
            {
                map.remove(&id);
            }
            return Err(err.into());
        }

        let reply = reply_rx.recv().map_err(|_| RpcError::Closed)?;
        if reply.ok {
            Ok(reply.body)
        } else {
            Err(RpcError::Remote(
                reply.error.unwrap_or_else(|| "unspecified remote error".to_string()),
            ))
        }
    }

    /// Issue a command and decode the reply body.
    pub fn call_as<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        args: Value,
    ) -> Result<T, RpcError> {
        let body = self.call(command, args)?;
        Ok(serde_json::from_value(body)?)
    }

    pub fn shutdown(&self) {
        let stream = self.stream.lock().expect("should not be poisoned");
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reader_loop(stream: TcpStream, pending: Pending, events: impl Fn(RpcEvent)) {
    let mut reader = BufReader::new(stream);
    loop {
        let payload = match read_frame(&mut reader) {
            Ok(payload) => payload,
            Err(err) => {
                log::debug!(target: "rpc", "reader stopped: {err:#}");
                break;
            }
        };

        let msg: Value = match serde_json::from_slice(&payload) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!(target: "rpc", "unparsable frame: {err}");
                continue;
            }
        };

        if msg.get("event").is_some() {
            match serde_json::from_value::<RpcEvent>(msg) {
                Ok(event) => events(event),
                Err(err) => log::debug!(target: "rpc", "bad event shape: {err}"),
            }
            continue;
        }

        match serde_json::from_value::<RpcReply>(msg) {
            Ok(reply) => {
                let sender = pending
                    .lock()
                    .expect("should not be poisoned")
                    .as_mut()
                    .and_then(|map| map.remove(&reply.id));
                match sender {
                    Some(sender) => {
                        let _ = sender.send(reply);
                    }
                    None => log::debug!(target: "rpc", "reply for unknown id {}", reply.id),
                }
            }
            Err(err) => log::debug!(target: "rpc", "bad reply shape: {err}"),
        }
    }

    // Fail every caller still waiting, and refuse new ones.
    if let Some(map) = pending.lock().expect("should not be poisoned").take() {
        drop(map);
    }
}
