use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use tether::deploy::DeployOptions;
use tether::rpc::ConnectOptions;
use tether::session::{DebugSession, SessionOptions};
use tether::trace::{FileTracer, TraceLevel};
use tether::transport::{stdio_channel, tcp_channel, DapInput, DapOutput};
use tether::util::run_util;

const DEFAULT_PORT: u16 = 4711;

/// Environment variable enabling DAP tracing into a log file, for setups
/// where the IDE controls the adapter command line.
const LOGFILE_ENV: &str = "TETHER_DAP_LOGFILE";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Trace DAP requests; `--trace=response` also traces responses and events.
    #[arg(long, num_args = 0..=1, default_missing_value = "request", value_name = "WHAT")]
    trace: Option<String>,

    /// Accept DAP clients over TCP instead of stdio, optionally on a port.
    #[arg(long, num_args = 0..=1, default_missing_value = "4711", value_name = "PORT")]
    server: Option<u16>,

    /// Log file for adapter diagnostics (nothing is written to stdout).
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Emit a single JSON-encoded command response to stdout and exit.
    Util {
        /// Command to run (version, devices).
        #[arg(short, long, default_value = "version")]
        command: String,

        /// Unique identifier echoed back in the response.
        #[arg(short, long)]
        id: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();

    if let Some(Command::Util { command, id }) = args.command {
        return run_util(&command, id);
    }

    tether::log::init();

    if let Ok(path) = std::env::var(LOGFILE_ENV) {
        if !path.is_empty() {
            args.log_file = Some(PathBuf::from(path));
            args.trace = Some("response".to_string());
        }
    }

    let tracer = match &args.log_file {
        Some(path) => Some(FileTracer::new(path)?),
        None => None,
    };
    let trace = match args.trace.as_deref() {
        None => TraceLevel::Off,
        Some("response") => TraceLevel::Responses,
        Some(_) => TraceLevel::Requests,
    };
    if trace != TraceLevel::Off && tracer.is_none() {
        warn!(target: "dap", "--trace requires --log-file; tracing disabled");
    }

    match args.server {
        Some(port) => run_server(if port == 0 { DEFAULT_PORT } else { port }, trace, tracer),
        None => {
            info!(target: "dap", "waiting for debug protocol on stdin/stdout");
            let (input, out) = stdio_channel(trace, tracer);
            run_session(input, out)
        }
    }
}

fn run_session(input: DapInput, out: DapOutput) -> anyhow::Result<()> {
    let options = SessionOptions::production(DeployOptions::default(), ConnectOptions::default());
    DebugSession::new(input, out, options).run()
}

/// Server mode: accept clients sequentially, one client == one debug session.
fn run_server(port: u16, trace: TraceLevel, tracer: Option<FileTracer>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .with_context(|| format!("bind 127.0.0.1:{port}"))?;
    info!(target: "dap", "waiting for debug protocol on port {port}");

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected: {peer}");

        let (input, out) = match tcp_channel(stream, trace, tracer.clone()) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(target: "dap", "failed to init DAP I/O: {err:#}");
                continue;
            }
        };

        if let Err(err) = run_session(input, out) {
            warn!(target: "dap", "session ended with error: {err:#}");
        }
        info!(target: "dap", "client connection closed");
    }
}
