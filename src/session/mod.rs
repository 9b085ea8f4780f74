//! Debug session state machine.
//!
//! Owns the debugger abstraction, the deployment orchestrator and the handle
//! tables, translates DAP commands into backend calls and emits events. One
//! session serves one client connection; requests are dispatched one at a
//! time from the transport reader loop, while backend events arrive on the
//! listener thread and synchronize through [`SessionShared`].

pub mod emit;
pub mod handles;
pub mod launch;
pub mod logger;

use crate::debugger::{
    BreakpointSpec, DebugStackFrame, DebugThread, DebugVariable, Debugger, DebuggerEvent,
    DebuggerEventKind, Error as DebuggerError, EventHook, ExceptionBreakMode,
};
use crate::deploy::callbacks::CallbackAdapter;
use crate::deploy::link::{ConnectionManager, LinkFactory};
use crate::deploy::package::Packager;
use crate::deploy::{DeployOptions, Deployer};
use crate::protocol::{
    self, AttachArguments, EvaluateArguments, LaunchArguments, Request, Response, ResponseBody,
    ScopesArguments, SetBreakpointsArguments, SetExceptionBreakpointsArguments,
    StackTraceArguments, VariablesArguments,
};
use crate::rpc::ConnectOptions;
use crate::session::emit::{DapEmitter, EventEmitter, StopReason, ThreadReason};
use crate::session::handles::Handles;
use crate::session::launch::LaunchData;
use crate::session::logger::DapLogger;
use crate::transport::{DapInput, DapOutput};
use crate::util::{expand_variables, fix_path_separators, loopback, resolve_address, CancelToken};
use crate::weak_error;
use anyhow::{anyhow, bail, Context};
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

const MAX_CHILDREN: usize = 100;
const DEFAULT_STACK_LEVELS: usize = 10;
const KILL_POLL: Duration = Duration::from_millis(10);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Files the managed runtime can host breakpoints in. Anything else gets an
/// empty (but successful) setBreakpoints response.
const SOURCE_EXTENSIONS: &[&str] = &[
    ".cs", ".csx", ".cake", ".fs", ".fsi", ".ml", ".mli", ".fsx", ".fsscript", ".hx",
];

/// Auto-reset resume gate: set by every stop event, consumed by the next
/// suspend-wait on the dispatch thread.
struct Gate {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            opened: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut opened = self.opened.lock().expect("should not be poisoned");
        *opened = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut opened = self.opened.lock().expect("should not be poisoned");
        while !*opened {
            opened = self.cond.wait(opened).expect("should not be poisoned");
        }
        *opened = false;
    }
}

/// Per-stop snapshot state. All of it is invalidated on every stop.
struct StopState {
    variable_handles: Handles<Vec<Arc<dyn DebugVariable>>>,
    frame_handles: Handles<Box<dyn DebugStackFrame>>,
    exception: Option<Box<dyn crate::debugger::DebugException>>,
}

/// State shared between the dispatch loop and the backend event thread.
struct SessionShared {
    gate: Gate,
    /// True while no live debuggee connection exists; never report a
    /// successful launch-mode disconnect while this is false.
    debuggee_killed: AtomicBool,
    terminated: AtomicBool,
    stop: Mutex<StopState>,
    seen_threads: Mutex<IndexMap<i64, String>>,
    debugger: Mutex<Option<Weak<dyn Debugger>>>,
    emitter: Arc<dyn EventEmitter>,
}

impl SessionShared {
    fn new(emitter: Arc<dyn EventEmitter>) -> SessionShared {
        SessionShared {
            gate: Gate::new(),
            debuggee_killed: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            stop: Mutex::new(StopState {
                variable_handles: Handles::new(),
                frame_handles: Handles::new(),
                exception: None,
            }),
            seen_threads: Mutex::new(IndexMap::new()),
            debugger: Mutex::new(None),
            emitter,
        }
    }

    fn set_debugger(&self, debugger: Weak<dyn Debugger>) {
        *self.debugger.lock().expect("should not be poisoned") = Some(debugger);
    }

    fn debugger(&self) -> Option<Arc<dyn Debugger>> {
        self.debugger
            .lock()
            .expect("should not be poisoned")
            .as_ref()?
            .upgrade()
    }

    /// Handle-table reset on a stopped transition. Must complete before the
    /// `stopped` event goes out.
    fn stopped(&self) {
        let mut stop = self.stop.lock().expect("should not be poisoned");
        stop.exception = None;
        stop.variable_handles.reset();
        stop.frame_handles.reset();
    }

    /// Capture the active exception object for the current stop, returning
    /// its message for the `stopped` event text.
    fn capture_exception(&self) -> Option<String> {
        let debugger = self.debugger()?;
        let thread = debugger.active_thread()?;
        let frames = weak_error!(thread.stack_frames())?;
        let exception = frames.first()?.exception()?;

        let message = exception.message();
        self.stop.lock().expect("should not be poisoned").exception = Some(exception);
        Some(message)
    }

    fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.emitter.emit_terminated();
        }
    }
}

impl EventHook for SessionShared {
    fn on_event(&self, event: DebuggerEvent) {
        let thread_id = event.thread_id.unwrap_or_default();
        match event.kind {
            DebuggerEventKind::StepCompleted => {
                self.stopped();
                self.emitter.emit_stopped(thread_id, StopReason::Step, None);
                self.gate.open();
            }
            DebuggerEventKind::BreakpointHit => {
                self.stopped();
                self.emitter
                    .emit_stopped(thread_id, StopReason::Breakpoint, None);
                self.gate.open();
            }
            DebuggerEventKind::ExceptionThrown | DebuggerEventKind::UnhandledException => {
                self.stopped();
                let text = self.capture_exception().or(event.message);
                self.emitter
                    .emit_stopped(thread_id, StopReason::Exception, text.as_deref());
                self.gate.open();
            }
            DebuggerEventKind::Paused => {
                self.gate.open();
            }
            DebuggerEventKind::SessionStarted | DebuggerEventKind::SessionReady => {}
            DebuggerEventKind::SessionExited => {
                if let Some(debugger) = self.debugger() {
                    weak_error!(debugger.exit());
                }
                self.debuggee_killed.store(true, Ordering::SeqCst);
                self.terminate();
                if let Some(code) = event.exit_code {
                    self.emitter.emit_exited(code);
                }
                self.gate.open();
            }
            DebuggerEventKind::ThreadStarted => {
                let name = event.message.unwrap_or_default();
                self.seen_threads
                    .lock()
                    .expect("should not be poisoned")
                    .insert(thread_id, name);
                self.emitter.emit_thread(thread_id, ThreadReason::Started);
            }
            DebuggerEventKind::ThreadExited => {
                self.seen_threads
                    .lock()
                    .expect("should not be poisoned")
                    .shift_remove(&thread_id);
                self.emitter.emit_thread(thread_id, ThreadReason::Exited);
            }
        }
    }
}

pub type DebuggerFactory = Box<dyn Fn(Arc<dyn EventHook>) -> Arc<dyn Debugger> + Send>;
pub type PackagerFactory = Box<dyn Fn() -> Box<dyn Packager> + Send>;

/// Collaborator wiring for a session. Production wiring lives in
/// [`SessionOptions::production`]; tests inject mocks.
pub struct SessionOptions {
    pub deploy: DeployOptions,
    pub connect: ConnectOptions,
    pub debugger_factory: DebuggerFactory,
    pub link_factory: LinkFactory,
    pub packager_factory: PackagerFactory,
}

impl SessionOptions {
    pub fn production(deploy: DeployOptions, connect: ConnectOptions) -> SessionOptions {
        use crate::debugger::soft::wire::WireConnector;
        use crate::debugger::soft::SoftDebugger;
        use crate::deploy::link::BridgeLink;
        use crate::deploy::package::AppPackager;

        let connect_for_factory = connect.clone();
        SessionOptions {
            deploy,
            connect,
            debugger_factory: Box::new(move |hook| {
                Arc::new(SoftDebugger::new(
                    Box::new(WireConnector::new(connect_for_factory.clone())),
                    hook,
                ))
            }),
            link_factory: Arc::new(BridgeLink::dial),
            packager_factory: Box::new(|| Box::new(AppPackager)),
        }
    }
}

/// One DAP debug session over one client connection.
pub struct DebugSession {
    input: DapInput,
    out: DapOutput,
    emitter: Arc<dyn EventEmitter>,
    shared: Arc<SessionShared>,
    debugger: Arc<dyn Debugger>,
    connections: ConnectionManager,
    packager_factory: PackagerFactory,
    deploy_options: DeployOptions,
    /// Set on each execution-control dispatch, consumed by suspend-waits.
    debuggee_executing: bool,
    attach_mode: bool,
    deployer: Option<Deployer>,
    deploy_token: Option<CancelToken>,
}

impl DebugSession {
    pub fn new(input: DapInput, out: DapOutput, options: SessionOptions) -> DebugSession {
        let emitter: Arc<dyn EventEmitter> = Arc::new(DapEmitter::new(out.clone()));
        let shared = Arc::new(SessionShared::new(emitter.clone()));
        let debugger = (options.debugger_factory)(shared.clone());
        shared.set_debugger(Arc::downgrade(&debugger));

        let connections = ConnectionManager::new(options.link_factory).with_retry(
            options.deploy.link_retries,
            options.deploy.link_retry_delay,
        );

        DebugSession {
            input,
            out,
            emitter,
            shared,
            debugger,
            connections,
            packager_factory: options.packager_factory,
            deploy_options: options.deploy,
            debuggee_executing: false,
            attach_mode: false,
            deployer: None,
            deploy_token: None,
        }
    }

    /// Serve requests until the client disconnects or the stream closes.
    pub fn run(mut self) -> anyhow::Result<()> {
        // From here on stdout may belong to the protocol; adapter
        // diagnostics travel as console output events.
        let logger = DapLogger::new(self.emitter.clone());
        let filter = logger.filter();
        crate::log::LOGGER_SWITCHER.switch(logger, filter);

        loop {
            let req = match self.input.read_request() {
                Ok(req) => req,
                Err(err) => {
                    log::debug!(target: "session", "request stream ended: {err:#}");
                    break;
                }
            };

            log::debug!(target: "session", "{}: {}", req.seq, req.command);

            match self.handle_request(&req) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    log::error!(target: "session", "{err:#}");
                }
            }
        }
        Ok(())
    }

    fn handle_request(&mut self, req: &Request) -> anyhow::Result<bool> {
        match req.command.as_str() {
            "initialize" => self.cmd_initialize(req)?,
            "launch" => self.cmd_launch(req)?,
            "attach" => self.cmd_attach(req)?,
            "disconnect" => return self.cmd_disconnect(req),
            "continue" => self.cmd_execution_control(req, ExecutionControl::Continue)?,
            "next" => self.cmd_execution_control(req, ExecutionControl::StepOver)?,
            "stepIn" => self.cmd_execution_control(req, ExecutionControl::StepInto)?,
            "stepOut" => self.cmd_execution_control(req, ExecutionControl::StepOut)?,
            "pause" => self.cmd_pause(req)?,
            "setBreakpoints" => self.cmd_set_breakpoints(req)?,
            "setExceptionBreakpoints" => self.cmd_set_exception_breakpoints(req)?,
            "threads" => self.cmd_threads(req)?,
            "stackTrace" => self.cmd_stack_trace(req)?,
            "scopes" => self.cmd_scopes(req)?,
            "variables" => self.cmd_variables(req)?,
            "evaluate" => self.cmd_evaluate(req)?,
            "source" => self.respond_error(req, 1020, "No source available", HashMap::new())?,
            _ => {
                let mut vars = HashMap::new();
                vars.insert("_request", req.command.clone());
                self.respond_error(req, 1014, "unrecognized request: {_request}", vars)?;
            }
        }
        Ok(true)
    }

    // ---- responses ---------------------------------------------------------

    fn respond_success(&self, req: &Request, body: Option<ResponseBody>) -> anyhow::Result<()> {
        self.out.respond(Response::success(req, body))
    }

    fn respond_error(
        &self,
        req: &Request,
        id: i64,
        format: &str,
        vars: HashMap<&str, String>,
    ) -> anyhow::Result<()> {
        let message = expand_variables(format, &vars);
        self.out.respond(Response::error(req, id, message))
    }

    fn respond_decode_error(
        &self,
        req: &Request,
        err: crate::protocol::DecodeError,
    ) -> anyhow::Result<()> {
        self.respond_error(req, 1001, &err.to_string(), HashMap::new())
    }

    // ---- lifecycle ---------------------------------------------------------

    fn cmd_initialize(&mut self, req: &Request) -> anyhow::Result<()> {
        if !cfg!(any(target_os = "linux", target_os = "macos", target_os = "windows")) {
            let mut vars = HashMap::new();
            vars.insert("_platform", std::env::consts::OS.to_string());
            return self.respond_error(
                req,
                3000,
                "Debugging is not supported on this platform ({_platform}).",
                vars,
            );
        }

        self.respond_success(
            req,
            Some(ResponseBody::Capabilities(protocol::Capabilities {
                supports_configuration_done_request: false,
                supports_function_breakpoints: false,
                supports_conditional_breakpoints: false,
                supports_evaluate_for_hovers: false,
                supports_progress_reporting: true,
                exception_breakpoint_filters: vec![],
            })),
        )?;

        // breakpoints are accepted immediately, no configuration phase
        self.emitter.emit_initialized();
        Ok(())
    }

    fn cmd_launch(&mut self, req: &Request) -> anyhow::Result<()> {
        let args: LaunchArguments = match req.parse_args() {
            Ok(args) => args,
            Err(err) => return self.respond_decode_error(req, err),
        };

        self.attach_mode = false;
        self.apply_exception_options(args.exception_options.as_deref());

        let mut data = LaunchData::parse(&args);
        if let Err(err) = data.validate() {
            return self.respond_error(req, 3002, &err.to_string(), HashMap::new());
        }

        let address = match &args.address {
            Some(host) if !host.trim().is_empty() => match resolve_address(host.trim()) {
                Some(address) => address,
                None => {
                    let mut vars = HashMap::new();
                    vars.insert("address", host.clone());
                    return self.respond_error(req, 3013, "Invalid address '{address}'.", vars);
                }
            },
            _ => loopback(),
        };

        // at most one deployment in flight per session
        if let Some(previous) = &self.deploy_token {
            if !previous.is_canceled() {
                previous.cancel();
            }
        }
        let token = CancelToken::new();
        self.deploy_token = Some(token.clone());

        match self.launch_session(&data, address, token) {
            Ok(()) => self.respond_success(req, None),
            Err(err) => {
                log::error!(target: "session", "launch failed: {err:#}");
                let mut vars = HashMap::new();
                vars.insert("_reason", format!("{err:#}"));
                self.respond_error(req, 3002, "Launch failed: {_reason}", vars)?;
                self.do_disconnect();
                self.shared.terminate();
                Ok(())
            }
        }
    }

    fn launch_session(
        &mut self,
        data: &LaunchData,
        address: IpAddr,
        token: CancelToken,
    ) -> anyhow::Result<()> {
        let output_path = data.build_property("OutputPath").ok_or_else(|| {
            anyhow!(
                "MSBuild property 'OutputPath' not found or empty. Check the property file at: {}",
                data.msbuild_property_file.display()
            )
        })?;
        let folder = PathBuf::from(fix_path_separators(output_path));
        if !folder.is_dir() {
            bail!("output path does not exist: {}", folder.display());
        }

        let debugging = data.debug_port > 1024;
        let callbacks = Arc::new(CallbackAdapter::new(self.emitter.clone()));
        let deployer = Deployer::new(
            callbacks,
            (self.packager_factory)(),
            data.serial.clone(),
            self.deploy_options.clone(),
            token.clone(),
        );

        let link = if data.skip_deploy {
            deployer.connect_for_debugging(&mut self.connections)?
        } else {
            deployer.deploy(&mut self.connections, &folder, debugging)?
        };
        self.deployer = Some(deployer);

        if debugging {
            // The device side is not a process we own; tearing the session
            // down must leave it running.
            self.attach_mode = true;

            // The device binds the debug listener, waits for our client to
            // connect, then starts the runtime's debug session. Connect only
            // after the listener had its grace window to bind.
            let listener = thread::spawn({
                let link = link.clone();
                let token = token.clone();
                let port = data.debug_port;
                move || link.start_debug_session(port, &token)
            });

            token
                .sleep(self.deploy_options.listener_grace)
                .map_err(|_| anyhow!("launch canceled"))?;

            let assemblies = data
                .build_property("AssemblyName")
                .map(|name| vec![name.to_string()])
                .unwrap_or_default();

            self.shared.debuggee_killed.store(false, Ordering::SeqCst);
            self.debugger
                .connect(address, data.debug_port, &assemblies)
                .context("failed to connect to debugger")?;
            self.debuggee_executing = true;

            match listener.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => bail!("debug session start failed: {err}"),
                Err(_) => bail!("debug listener thread panicked"),
            }
        }
        Ok(())
    }

    fn cmd_attach(&mut self, req: &Request) -> anyhow::Result<()> {
        let args: AttachArguments = match req.parse_args() {
            Ok(args) => args,
            Err(err) => return self.respond_decode_error(req, err),
        };

        self.attach_mode = true;
        self.apply_exception_options(args.exception_options.as_deref());

        let Some(host) = args.address.as_deref().map(str::trim).filter(|h| !h.is_empty()) else {
            return self.respond_error(
                req,
                3007,
                "Property 'address' is missing or empty.",
                HashMap::new(),
            );
        };
        let Some(port) = args.port else {
            return self.respond_error(req, 3008, "Property 'port' is missing.", HashMap::new());
        };
        let Some(address) = resolve_address(host) else {
            let mut vars = HashMap::new();
            vars.insert("address", host.to_string());
            return self.respond_error(req, 3013, "Invalid address '{address}'.", vars);
        };

        self.shared.debuggee_killed.store(false, Ordering::SeqCst);
        if let Err(err) = self.debugger.connect(address, port, &[]) {
            let mut vars = HashMap::new();
            vars.insert("_reason", err.to_string());
            return self.respond_error(req, 3002, "Attach failed: {_reason}", vars);
        }
        self.debuggee_executing = true;

        self.respond_success(req, None)
    }

    fn cmd_disconnect(&mut self, req: &Request) -> anyhow::Result<bool> {
        self.do_disconnect();
        self.respond_success(req, None)?;
        Ok(false)
    }

    fn do_disconnect(&mut self) {
        self.deployer = None;
        if let Some(token) = self.deploy_token.take() {
            if !token.is_canceled() {
                token.cancel();
            }
        }
        self.connections.drop_current();

        if self.attach_mode {
            // leave the target alive: drop our breakpoints and resume it
            self.debugger.clear_breakpoints();
            self.debuggee_executing = true;
            weak_error!(self.debugger.resume());
        } else {
            weak_error!(self.debugger.pause());
            weak_error!(self.debugger.exit());

            let deadline = Instant::now() + KILL_WAIT;
            while !self.shared.debuggee_killed.load(Ordering::SeqCst)
                && Instant::now() < deadline
            {
                thread::sleep(KILL_POLL);
            }
        }
        self.debuggee_executing = false;
    }

    // ---- execution control -------------------------------------------------

    fn cmd_execution_control(
        &mut self,
        req: &Request,
        control: ExecutionControl,
    ) -> anyhow::Result<()> {
        self.wait_for_suspend();
        self.respond_success(req, None)?;

        let result = match control {
            ExecutionControl::Continue => self.debugger.resume(),
            ExecutionControl::StepOver => self.debugger.step_over(),
            ExecutionControl::StepInto => self.debugger.step_into(),
            ExecutionControl::StepOut => self.debugger.step_out(),
        };
        weak_error!(result);
        self.debuggee_executing = true;
        Ok(())
    }

    fn cmd_pause(&mut self, req: &Request) -> anyhow::Result<()> {
        self.respond_success(req, None)?;
        weak_error!(self.debugger.pause());
        Ok(())
    }

    fn wait_for_suspend(&mut self) {
        if self.debuggee_executing {
            self.shared.gate.wait();
            self.debuggee_executing = false;
        }
    }

    // ---- breakpoints -------------------------------------------------------

    fn cmd_set_breakpoints(&mut self, req: &Request) -> anyhow::Result<()> {
        let args: SetBreakpointsArguments = match req.parse_args() {
            Ok(args) => args,
            Err(err) => return self.respond_decode_error(req, err),
        };

        let Some(path) = args
            .source
            .path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
        else {
            return self.respond_error(
                req,
                3010,
                "setBreakpoints: property 'source' is empty or misformed",
                HashMap::new(),
            );
        };

        if !has_source_extension(&path) {
            // only files the runtime understands can hold real breakpoints
            return self.respond_success(
                req,
                Some(ResponseBody::SetBreakpoints(
                    protocol::SetBreakpointsBody::default(),
                )),
            );
        }

        let requested = args.requested_lines();
        let requested_set: HashSet<i64> = requested.iter().copied().collect();

        // set-based reconciliation: keep still-requested lines (same id),
        // drop the rest, allocate ids only for new lines
        let mut line_ids: HashMap<i64, u64> = HashMap::new();
        for bp in self.debugger.breakpoints() {
            let BreakpointSpec::Line { file, line } = &bp.spec else {
                continue;
            };
            if *file != path {
                continue;
            }
            if requested_set.contains(line) {
                line_ids.insert(*line, bp.id);
            } else {
                weak_error!(self.debugger.remove_breakpoint(bp.id));
            }
        }

        for line in requested_set {
            if line_ids.contains_key(&line) {
                continue;
            }
            match self.debugger.add_line_breakpoint(&path, line) {
                Ok(bp) => {
                    line_ids.insert(line, bp.id);
                }
                Err(err) => {
                    log::warn!(target: "session", "breakpoint at {path}:{line} not set: {err:#}")
                }
            }
        }

        let breakpoints = requested
            .iter()
            .map(|line| protocol::Breakpoint {
                verified: line_ids.contains_key(line),
                line: *line,
                id: line_ids.get(line).map(|id| *id as i64),
            })
            .collect_vec();

        self.respond_success(
            req,
            Some(ResponseBody::SetBreakpoints(protocol::SetBreakpointsBody {
                breakpoints,
            })),
        )
    }

    fn cmd_set_exception_breakpoints(&mut self, req: &Request) -> anyhow::Result<()> {
        let args: SetExceptionBreakpointsArguments = match req.parse_args() {
            Ok(args) => args,
            Err(err) => return self.respond_decode_error(req, err),
        };
        self.apply_exception_options(args.exception_options.as_deref());
        self.respond_success(req, None)
    }

    fn apply_exception_options(&self, options: Option<&[protocol::ExceptionOption]>) {
        let Some(options) = options else {
            return;
        };
        for option in options {
            let Some(name) = option.path.first().and_then(|segment| segment.names.first())
            else {
                continue;
            };
            let mode = match option.break_mode.as_str() {
                "never" => ExceptionBreakMode::Never,
                "unhandled" | "userUnhandled" => ExceptionBreakMode::Unhandled,
                _ => ExceptionBreakMode::Always,
            };
            weak_error!(self.debugger.set_exception_break_mode(name, mode));
        }
    }

    // ---- state inspection --------------------------------------------------

    fn cmd_threads(&mut self, req: &Request) -> anyhow::Result<()> {
        let mut table: IndexMap<i64, String> = self
            .shared
            .seen_threads
            .lock()
            .expect("should not be poisoned")
            .clone();

        match self.debugger.processes() {
            Ok(processes) => {
                for process in processes {
                    for thread in weak_error!(process.threads()).unwrap_or_default() {
                        table.insert(thread.id(), thread.name());
                    }
                }
            }
            Err(DebuggerError::NotConnected) => {}
            Err(err) => log::warn!(target: "session", "thread enumeration: {err:#}"),
        }

        let threads = table
            .into_iter()
            .map(|(id, name)| protocol::Thread {
                id,
                name: if name.is_empty() {
                    format!("Thread #{id}")
                } else {
                    name
                },
            })
            .collect_vec();

        self.respond_success(
            req,
            Some(ResponseBody::Threads(protocol::ThreadsBody { threads })),
        )
    }

    fn cmd_stack_trace(&mut self, req: &Request) -> anyhow::Result<()> {
        let args: StackTraceArguments = match req.parse_args() {
            Ok(args) => args,
            Err(err) => return self.respond_decode_error(req, err),
        };
        let max_levels = args
            .levels
            .filter(|levels| *levels > 0)
            .map(|levels| levels as usize)
            .unwrap_or(DEFAULT_STACK_LEVELS);

        self.wait_for_suspend();

        let mut stack_frames = Vec::new();
        let mut total_frames = 0i64;

        if let Some(thread) = self.thread_by_id(args.thread_id) {
            match thread.stack_frames() {
                Ok(frames) => {
                    total_frames = frames.len() as i64;
                    let mut stop = self.shared.stop.lock().expect("should not be poisoned");
                    for frame in frames.into_iter().take(max_levels) {
                        stack_frames.push(make_stack_frame(&mut stop.frame_handles, frame));
                    }
                }
                Err(err) => log::warn!(target: "session", "backtrace: {err:#}"),
            }
        }

        self.respond_success(
            req,
            Some(ResponseBody::StackTrace(protocol::StackTraceBody {
                stack_frames,
                total_frames,
            })),
        )
    }

    /// The active thread if it matches, otherwise look the thread up and
    /// make it active for the coming frame operations.
    fn thread_by_id(&self, thread_id: i64) -> Option<Box<dyn DebugThread>> {
        if let Some(active) = self.debugger.active_thread() {
            if active.id() == thread_id {
                return Some(active);
            }
        }

        let processes = weak_error!(self.debugger.processes())?;
        for process in processes {
            for thread in weak_error!(process.threads())? {
                if thread.id() == thread_id {
                    weak_error!(thread.set_active());
                    return Some(thread);
                }
            }
        }
        None
    }

    fn cmd_scopes(&mut self, req: &Request) -> anyhow::Result<()> {
        let args: ScopesArguments = match req.parse_args() {
            Ok(args) => args,
            Err(err) => return self.respond_decode_error(req, err),
        };

        let mut scopes = Vec::new();
        {
            let mut stop = self.shared.stop.lock().expect("should not be poisoned");
            let StopState {
                variable_handles,
                frame_handles,
                exception,
            } = &mut *stop;

            if let Some(frame) = frame_handles.get(args.frame_id) {
                if frame.index() == 0 {
                    if let Some(instance) = exception.as_ref().and_then(|e| e.instance()) {
                        scopes.push(protocol::Scope {
                            name: "Exception",
                            variables_reference: variable_handles
                                .create(vec![Arc::from(instance)]),
                            expensive: false,
                        });
                    }
                }

                let locals: Vec<Arc<dyn DebugVariable>> = frame
                    .this_reference()
                    .into_iter()
                    .chain(frame.parameters())
                    .chain(frame.local_variables())
                    .map(Arc::from)
                    .collect();
                if !locals.is_empty() {
                    scopes.push(protocol::Scope {
                        name: "Local",
                        variables_reference: variable_handles.create(locals),
                        expensive: false,
                    });
                }
            }
        }

        self.respond_success(req, Some(ResponseBody::Scopes(protocol::ScopesBody { scopes })))
    }

    fn cmd_variables(&mut self, req: &Request) -> anyhow::Result<()> {
        let args: VariablesArguments = match req.parse_args() {
            Ok(args) => args,
            Err(err) => return self.respond_decode_error(req, err),
        };
        let Some(reference) = args.variables_reference else {
            return self.respond_error(
                req,
                3009,
                "variables: property 'variablesReference' is missing",
                HashMap::new(),
            );
        };

        self.wait_for_suspend();

        let group = {
            let stop = self.shared.stop.lock().expect("should not be poisoned");
            stop.variable_handles.get(reference).cloned()
        };

        let mut variables = Vec::new();
        if let Some(mut children) = group {
            let truncated = children.len() > MAX_CHILDREN;
            if truncated {
                children.truncate(MAX_CHILDREN);
            }

            // child values arrive materialized from the wire, so one batched
            // fetch per parent already covers the small-set fast path
            for child in &children {
                variables.push(self.make_variable(child));
            }

            if truncated {
                variables.push(protocol::Variable {
                    name: "...".to_string(),
                    value: String::new(),
                    type_name: None,
                    variables_reference: 0,
                });
            }
        }

        self.respond_success(
            req,
            Some(ResponseBody::Variables(protocol::VariablesBody { variables })),
        )
    }

    fn make_variable(&self, variable: &Arc<dyn DebugVariable>) -> protocol::Variable {
        let mut value = variable.display_value();
        if value.len() > 1 && value.starts_with('{') && value.ends_with('}') {
            value = value[1..value.len() - 1].to_string();
        }

        let variables_reference = if variable.has_children() {
            match variable.children() {
                Ok(children) => {
                    let children: Vec<Arc<dyn DebugVariable>> =
                        children.into_iter().map(Arc::from).collect();
                    self.shared
                        .stop
                        .lock()
                        .expect("should not be poisoned")
                        .variable_handles
                        .create(children)
                }
                Err(err) => {
                    log::warn!(target: "session", "child fetch: {err:#}");
                    0
                }
            }
        } else {
            0
        };

        protocol::Variable {
            name: variable.name(),
            value,
            type_name: variable.type_name(),
            variables_reference,
        }
    }

    fn cmd_evaluate(&mut self, req: &Request) -> anyhow::Result<()> {
        let args: EvaluateArguments = match req.parse_args() {
            Ok(args) => args,
            Err(err) => return self.respond_decode_error(req, err),
        };

        let error = match self.evaluate_expression(&args) {
            Ok(body) => return self.respond_success(req, Some(ResponseBody::Evaluate(body))),
            Err(error) => error,
        };

        let mut vars = HashMap::new();
        vars.insert("_reason", error);
        self.respond_error(req, 3014, "Evaluate request failed ({_reason}).", vars)
    }

    /// `Err` carries the user-facing classification, not a protocol failure.
    fn evaluate_expression(
        &mut self,
        args: &EvaluateArguments,
    ) -> Result<protocol::EvaluateBody, String> {
        let Some(expression) = args
            .expression
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        else {
            return Err("expression missing".to_string());
        };

        self.wait_for_suspend();

        let outcome = {
            let stop = self.shared.stop.lock().expect("should not be poisoned");
            let Some(frame) = stop.frame_handles.get(args.frame_id.unwrap_or(-1)) else {
                return Err("no active stackframe".to_string());
            };
            if !frame.validate_expression(expression) {
                return Err("invalid expression".to_string());
            }
            frame.evaluate(expression).map_err(|err| err.to_string())?
        };

        let flags = outcome.flags;
        if flags.error || flags.not_supported {
            let mut error = outcome.variable.display_value();
            if error.contains("reference not available in the current evaluation context") {
                error = "not available".to_string();
            }
            return Err(error);
        }
        if flags.unknown {
            return Err("invalid expression".to_string());
        }
        if flags.object && flags.namespace {
            return Err("not available".to_string());
        }

        let variable: Arc<dyn DebugVariable> = Arc::from(outcome.variable);
        let variables_reference = if variable.has_children() {
            match variable.children() {
                Ok(children) => {
                    let children: Vec<Arc<dyn DebugVariable>> =
                        children.into_iter().map(Arc::from).collect();
                    self.shared
                        .stop
                        .lock()
                        .expect("should not be poisoned")
                        .variable_handles
                        .create(children)
                }
                Err(err) => return Err(err.to_string()),
            }
        } else {
            0
        };

        Ok(protocol::EvaluateBody {
            result: variable.display_value(),
            variables_reference,
        })
    }
}

enum ExecutionControl {
    Continue,
    StepOver,
    StepInto,
    StepOut,
}

fn has_source_extension(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    SOURCE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn make_stack_frame(
    frame_handles: &mut Handles<Box<dyn DebugStackFrame>>,
    frame: Box<dyn DebugStackFrame>,
) -> protocol::StackFrame {
    let mut presentation_hint = "subtle";
    let mut source = None;

    if let Some(path) = frame.file_name().filter(|p| !p.is_empty()) {
        let name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        if Path::new(&path).exists() {
            source = Some(protocol::Source {
                name,
                path: Some(path),
                source_reference: Some(0),
                presentation_hint: Some("normal".to_string()),
            });
            presentation_hint = "normal";
        } else {
            source = Some(protocol::Source {
                name,
                path: None,
                source_reference: Some(1000),
                presentation_hint: Some("deemphasize".to_string()),
            });
        }
    }

    let name = frame.method_name();
    let line = frame.line();
    let column = frame.column();
    let id = frame_handles.create(frame);

    protocol::StackFrame {
        id,
        name,
        source,
        line,
        column,
        presentation_hint: Some(presentation_hint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_extension_allowlist() {
        assert!(has_source_extension("/work/app/Program.cs"));
        assert!(has_source_extension("C:\\work\\APP\\PROGRAM.CS"));
        assert!(has_source_extension("lib/module.fs"));
        assert!(!has_source_extension("/work/app/main.rs"));
        assert!(!has_source_extension("/work/app/script.py"));
    }

    #[test]
    fn gate_auto_resets() {
        let gate = Gate::new();
        gate.open();
        gate.wait();

        // consumed: a second wait would block until the next open
        assert!(!*gate.opened.lock().unwrap());
    }
}
