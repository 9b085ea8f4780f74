//! Soft-debugger backend adapter.
//!
//! Bridges the [`crate::debugger::Debugger`] seam onto the soft-debug wire
//! client. Breakpoints may be registered before the connection exists; they
//! are applied to the wire as part of [`SoftDebugger::connect`].

mod entities;

pub mod client;
pub mod wire;

use crate::debugger::soft::client::{
    ClientEvent, SoftClient, SoftConnector, StopKind,
};
use crate::debugger::{
    BreakpointId, BreakpointRef, BreakpointSpec, DebugProcess, DebugThread, Debugger,
    DebuggerEvent, DebuggerEventKind, Error, EventHook, ExceptionBreakMode,
};
use entities::{SoftProcess, SoftThread};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;

struct BreakpointEntry {
    id: BreakpointId,
    spec: BreakpointSpec,
    wire_id: Option<u64>,
}

#[derive(Default)]
struct ClientState {
    client: Option<Box<dyn SoftClient>>,
    breakpoints: Vec<BreakpointEntry>,
}

/// State shared between the adapter, its entity wrappers and the event pump.
pub(super) struct SoftShared {
    /// The single lock guarding the wire connection and breakpoint table.
    state: Mutex<ClientState>,
    running: AtomicBool,
    exited: AtomicBool,
    active_thread: Mutex<Option<i64>>,
}

impl SoftShared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().expect("should not be poisoned")
    }

    pub(super) fn with_client<T>(
        &self,
        f: impl FnOnce(&mut dyn SoftClient) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut state = self.lock();
        let client = state.client.as_mut().ok_or(Error::NotConnected)?;
        f(client.as_mut())
    }

    pub(super) fn set_active_thread(&self, thread_id: i64) {
        *self.active_thread.lock().expect("should not be poisoned") = Some(thread_id);
    }
}

pub struct SoftDebugger {
    shared: Arc<SoftShared>,
    connector: Box<dyn SoftConnector>,
    events_tx: Mutex<mpsc::Sender<ClientEvent>>,
    next_breakpoint_id: AtomicU64,
}

impl SoftDebugger {
    pub fn new(connector: Box<dyn SoftConnector>, hook: Arc<dyn EventHook>) -> SoftDebugger {
        let shared = Arc::new(SoftShared {
            state: Mutex::new(ClientState::default()),
            running: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            active_thread: Mutex::new(None),
        });

        let (events_tx, events_rx) = mpsc::channel();
        thread::spawn({
            let shared = shared.clone();
            move || event_pump(events_rx, shared, hook)
        });

        SoftDebugger {
            shared,
            connector,
            events_tx: Mutex::new(events_tx),
            next_breakpoint_id: AtomicU64::new(1),
        }
    }

    fn alloc_breakpoint_id(&self) -> BreakpointId {
        self.next_breakpoint_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Resume/step are meaningful only while suspended at a stop.
    fn can_resume(&self) -> bool {
        !self.shared.running.load(Ordering::SeqCst) && !self.shared.exited.load(Ordering::SeqCst)
    }
}

/// Translate listener notifications into debugger events for the hook.
/// Runs on its own thread for the lifetime of the adapter.
fn event_pump(
    events: mpsc::Receiver<ClientEvent>,
    shared: Arc<SoftShared>,
    hook: Arc<dyn EventHook>,
) {
    while let Ok(event) = events.recv() {
        let event = match event {
            ClientEvent::Started => DebuggerEvent::new(DebuggerEventKind::SessionStarted),
            ClientEvent::Ready => DebuggerEvent::new(DebuggerEventKind::SessionReady),
            ClientEvent::Stopped {
                kind,
                thread_id,
                message,
            } => {
                shared.running.store(false, Ordering::SeqCst);
                shared.set_active_thread(thread_id);
                let kind = match kind {
                    StopKind::Step => DebuggerEventKind::StepCompleted,
                    StopKind::Breakpoint => DebuggerEventKind::BreakpointHit,
                    StopKind::Exception => DebuggerEventKind::ExceptionThrown,
                    StopKind::UnhandledException => DebuggerEventKind::UnhandledException,
                    StopKind::Interrupt => DebuggerEventKind::Paused,
                };
                DebuggerEvent {
                    kind,
                    thread_id: Some(thread_id),
                    message,
                    exit_code: None,
                }
            }
            ClientEvent::ThreadStarted { id, name } => DebuggerEvent {
                kind: DebuggerEventKind::ThreadStarted,
                thread_id: Some(id),
                message: Some(name),
                exit_code: None,
            },
            ClientEvent::ThreadExited { id } => {
                DebuggerEvent::with_thread(DebuggerEventKind::ThreadExited, id)
            }
            ClientEvent::Exited { code } => {
                shared.running.store(false, Ordering::SeqCst);
                shared.exited.store(true, Ordering::SeqCst);
                DebuggerEvent {
                    kind: DebuggerEventKind::SessionExited,
                    thread_id: None,
                    message: None,
                    exit_code: Some(code),
                }
            }
        };
        hook.on_event(event);
    }
    log::debug!(target: "debugger", "event pump exiting");
}

impl Debugger for SoftDebugger {
    fn connect(&self, address: IpAddr, port: u16, assembly_names: &[String]) -> Result<(), Error> {
        let mut state = self.shared.lock();
        if state.client.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let mut client =
            self.connector.connect(
                address,
                port,
                assembly_names,
                self.events_tx.lock().expect("should not be poisoned").clone(),
            )?;

        // Breakpoints registered before the connection go to the wire now.
        for entry in &mut state.breakpoints {
            if entry.wire_id.is_some() {
                continue;
            }
            let wired = match &entry.spec {
                BreakpointSpec::Line { file, line } => client.set_line_breakpoint(file, *line),
                BreakpointSpec::Catch { exception } => client.set_catchpoint(exception),
            };
            match wired {
                Ok(wire_id) => entry.wire_id = Some(wire_id),
                Err(err) => {
                    log::warn!(target: "debugger", "breakpoint {} not applied: {err:#}", entry.id)
                }
            }
        }

        state.client = Some(client);
        self.shared.exited.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn has_exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    fn active_thread(&self) -> Option<Box<dyn DebugThread>> {
        let id = (*self
            .shared
            .active_thread
            .lock()
            .expect("should not be poisoned"))?;
        Some(Box::new(SoftThread {
            shared: self.shared.clone(),
            id,
            name: String::new(),
        }))
    }

    fn resume(&self) -> Result<(), Error> {
        if !self.can_resume() {
            return Ok(());
        }
        self.shared.with_client(|c| c.resume())?;
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn step_over(&self) -> Result<(), Error> {
        if !self.can_resume() {
            return Ok(());
        }
        self.shared.with_client(|c| c.step_over())?;
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn step_into(&self) -> Result<(), Error> {
        if !self.can_resume() {
            return Ok(());
        }
        self.shared.with_client(|c| c.step_into())?;
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn step_out(&self) -> Result<(), Error> {
        if !self.can_resume() {
            return Ok(());
        }
        self.shared.with_client(|c| c.step_out())?;
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) -> Result<(), Error> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.with_client(|c| c.interrupt())
    }

    fn exit(&self) -> Result<(), Error> {
        if self.shared.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.shared.with_client(|c| c.exit());
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.exited.store(true, Ordering::SeqCst);
        result
    }

    fn processes(&self) -> Result<Vec<Box<dyn DebugProcess>>, Error> {
        let descriptors = self.shared.with_client(|c| c.processes())?;
        Ok(descriptors
            .into_iter()
            .map(|desc| {
                Box::new(SoftProcess {
                    shared: self.shared.clone(),
                    desc,
                }) as Box<dyn DebugProcess>
            })
            .collect())
    }

    fn add_line_breakpoint(&self, file: &str, line: i64) -> Result<BreakpointRef, Error> {
        let mut state = self.shared.lock();
        let wire_id = match state.client.as_mut() {
            Some(client) => Some(client.set_line_breakpoint(file, line)?),
            None => None,
        };

        let id = self.alloc_breakpoint_id();
        let spec = BreakpointSpec::Line {
            file: file.to_string(),
            line,
        };
        state.breakpoints.push(BreakpointEntry {
            id,
            spec: spec.clone(),
            wire_id,
        });
        Ok(BreakpointRef {
            id,
            spec,
            verified: true,
        })
    }

    fn add_catchpoint(&self, exception: &str) -> Result<BreakpointRef, Error> {
        let mut state = self.shared.lock();
        let wire_id = match state.client.as_mut() {
            Some(client) => Some(client.set_catchpoint(exception)?),
            None => None,
        };

        let id = self.alloc_breakpoint_id();
        let spec = BreakpointSpec::Catch {
            exception: exception.to_string(),
        };
        state.breakpoints.push(BreakpointEntry {
            id,
            spec: spec.clone(),
            wire_id,
        });
        Ok(BreakpointRef {
            id,
            spec,
            verified: true,
        })
    }

    fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        let mut state = self.shared.lock();
        let Some(position) = state.breakpoints.iter().position(|e| e.id == id) else {
            return Err(Error::BreakpointNotFound(id));
        };

        let entry = state.breakpoints.remove(position);
        if let (Some(wire_id), Some(client)) = (entry.wire_id, state.client.as_mut()) {
            client.clear_breakpoint(wire_id)?;
        }
        Ok(())
    }

    fn clear_breakpoints(&self) {
        let mut state = self.shared.lock();
        let entries = std::mem::take(&mut state.breakpoints);
        if let Some(client) = state.client.as_mut() {
            for entry in entries {
                if let Some(wire_id) = entry.wire_id {
                    if let Err(err) = client.clear_breakpoint(wire_id) {
                        log::warn!(target: "debugger", "breakpoint {} not cleared: {err:#}", entry.id);
                    }
                }
            }
        }
    }

    fn breakpoints(&self) -> Vec<BreakpointRef> {
        self.shared
            .lock()
            .breakpoints
            .iter()
            .map(|entry| BreakpointRef {
                id: entry.id,
                spec: entry.spec.clone(),
                verified: entry.wire_id.is_some(),
            })
            .collect()
    }

    fn set_exception_break_mode(
        &self,
        exception: &str,
        mode: ExceptionBreakMode,
    ) -> Result<(), Error> {
        let mut state = self.shared.lock();

        // Catchpoint counts are small, a linear scan is fine.
        let existing = state.breakpoints.iter().position(|entry| {
            matches!(&entry.spec, BreakpointSpec::Catch { exception: e } if e == exception)
        });

        match (existing, mode) {
            (Some(position), ExceptionBreakMode::Never) => {
                let entry = state.breakpoints.remove(position);
                if let (Some(wire_id), Some(client)) = (entry.wire_id, state.client.as_mut()) {
                    client.clear_breakpoint(wire_id)?;
                }
            }
            (None, ExceptionBreakMode::Always | ExceptionBreakMode::Unhandled) => {
                let wire_id = match state.client.as_mut() {
                    Some(client) => Some(client.set_catchpoint(exception)?),
                    None => None,
                };
                let id = self.alloc_breakpoint_id();
                state.breakpoints.push(BreakpointEntry {
                    id,
                    spec: BreakpointSpec::Catch {
                        exception: exception.to_string(),
                    },
                    wire_id,
                });
            }
            _ => {}
        }
        Ok(())
    }
}
