//! DAP transport abstraction layer.
//! Supports both stdio (for embedded mode) and TCP (for server mode).

use crate::protocol::{Event, Request, Response};
use crate::trace::{FileTracer, TraceLevel};
use anyhow::anyhow;
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

/// Read one `Content-Length`-framed payload.
pub(crate) fn read_frame(reader: &mut impl BufRead) -> anyhow::Result<Vec<u8>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(anyhow!("connection closed"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse()?);
        }
    }

    let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write one `Content-Length`-framed payload.
pub(crate) fn write_frame(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reading half of a DAP connection.
pub struct DapInput {
    reader: Box<dyn BufRead + Send>,
    tracer: Option<FileTracer>,
    trace: TraceLevel,
}

impl DapInput {
    /// Read the next request, skipping any non-request message a client may
    /// send. Errors only on a broken/closed connection or unparsable frame.
    pub fn read_request(&mut self) -> anyhow::Result<Request> {
        loop {
            let payload = read_frame(&mut self.reader)?;
            let msg: Value = serde_json::from_slice(&payload)?;

            if self.trace.requests() {
                if let Some(tracer) = &self.tracer {
                    tracer.line(&format!("<- {msg}"));
                }
            }

            if msg.get("type").and_then(Value::as_str) != Some("request") {
                log::warn!(target: "dap", "ignoring non-request message: {msg}");
                continue;
            }

            return Ok(serde_json::from_value(msg)?);
        }
    }
}

/// Writing half of a DAP connection.
///
/// Cheaply cloneable: responses come from the dispatch loop while events are
/// raised from backend listener threads, and both must interleave whole
/// frames with consistent sequence numbers.
#[derive(Clone)]
pub struct DapOutput {
    inner: Arc<Mutex<OutputInner>>,
}

struct OutputInner {
    writer: Box<dyn Write + Send>,
    next_seq: i64,
    tracer: Option<FileTracer>,
    trace: TraceLevel,
}

impl DapOutput {
    pub fn respond(&self, mut response: Response) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("should not be poisoned");
        response.seq = inner.next_seq;
        inner.next_seq += 1;

        let payload = serde_json::to_vec(&response)?;
        if inner.trace.responses() {
            if let Some(tracer) = &inner.tracer {
                tracer.line(&format!("-> {}", String::from_utf8_lossy(&payload)));
            }
        }
        write_frame(&mut inner.writer, &payload)?;
        Ok(())
    }

    pub fn send_event(&self, mut event: Event) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("should not be poisoned");
        event.seq = inner.next_seq;
        inner.next_seq += 1;

        let payload = serde_json::to_vec(&event)?;
        if inner.trace.responses() {
            if let Some(tracer) = &inner.tracer {
                tracer.line(&format!("-> {}", String::from_utf8_lossy(&payload)));
            }
        }
        write_frame(&mut inner.writer, &payload)?;
        Ok(())
    }
}

fn output(writer: Box<dyn Write + Send>, trace: TraceLevel, tracer: Option<FileTracer>) -> DapOutput {
    DapOutput {
        inner: Arc::new(Mutex::new(OutputInner {
            writer,
            next_seq: 1,
            tracer,
            trace,
        })),
    }
}

/// Stdio-based DAP channel (for embedded mode).
pub fn stdio_channel(trace: TraceLevel, tracer: Option<FileTracer>) -> (DapInput, DapOutput) {
    let input = DapInput {
        reader: Box::new(BufReader::new(io::stdin())),
        tracer: tracer.clone(),
        trace,
    };
    (input, output(Box::new(io::stdout()), trace, tracer))
}

/// TCP-based DAP channel (for server mode).
pub fn tcp_channel(
    stream: TcpStream,
    trace: TraceLevel,
    tracer: Option<FileTracer>,
) -> anyhow::Result<(DapInput, DapOutput)> {
    stream.set_nodelay(true)?;
    let reader = BufReader::new(stream.try_clone()?);
    let input = DapInput {
        reader: Box::new(reader),
        tracer: tracer.clone(),
        trace,
    };
    Ok((input, output(Box::new(stream), trace, tracer)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, br#"{"seq":1}"#).unwrap();

        let mut reader = io::Cursor::new(buf);
        let payload = read_frame(&mut reader).unwrap();
        assert_eq!(payload, br#"{"seq":1}"#);
    }

    #[test]
    fn missing_content_length_is_an_error() {
        let mut reader = io::Cursor::new(b"X-Other: 1\r\n\r\n".to_vec());
        assert!(read_frame(&mut reader).is_err());
    }
}
