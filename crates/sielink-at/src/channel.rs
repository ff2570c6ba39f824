//! The AT channel engine.
//!
//! [`AtChannel::start`] spawns a background task that exclusively owns the
//! transport. While running, every inbound byte is appended to a line
//! buffer; complete CRLF-terminated lines are dispatched either to the
//! current command (per its [`AtCommandKind`]) or to the unsolicited
//! broadcast. Exactly one command is in flight at a time; additional sends
//! queue behind it on the request channel.
//!
//! The task also multiplexes ownership hand-back: [`AtChannel::stop`]
//! returns the transport so a caller can switch the port to another
//! protocol (the BFC transport does exactly this when entering framed
//! mode).

use bytes::BytesMut;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use sielink_core::error::{Error, Result};
use sielink_core::transport::Transport;

use crate::command::{looks_unsolicited, AtCommand, AtCommandKind, AtResponse, AtStatus};

/// The probe command used by [`AtChannel::handshake`].
pub const HANDSHAKE_COMMAND: &str = "ATQ0 V1 E0";

/// Per-attempt timeout during handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(300);

/// How long the idle loop waits for data before re-checking for requests.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Backoff after an empty idle poll, so immediate-timeout transports do
/// not spin the loop hot.
const IDLE_BACKOFF: Duration = Duration::from_millis(5);

/// A request sent from channel methods to the engine task.
enum Request {
    /// Execute one AT command.
    Command {
        command: AtCommand,
        reply: oneshot::Sender<AtResponse>,
    },
    /// Shut down the engine and return transport ownership.
    Stop {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Handle to a running AT channel.
///
/// Dropping the handle stops the engine task and drops the transport; use
/// [`AtChannel::stop`] to recover the transport instead.
pub struct AtChannel {
    cmd_tx: mpsc::Sender<Request>,
    unsolicited_tx: broadcast::Sender<String>,
    task: JoinHandle<()>,
}

impl AtChannel {
    /// Start the engine on the given transport.
    pub fn start(transport: Box<dyn Transport>) -> AtChannel {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (unsolicited_tx, _) = broadcast::channel(64);
        let task = tokio::spawn(run_engine(transport, unsolicited_tx.clone(), cmd_rx));
        AtChannel {
            cmd_tx,
            unsolicited_tx,
            task,
        }
    }

    /// Execute one AT command and await its response.
    ///
    /// Timeout and port-closure are reported inside the response status,
    /// not as errors; `Err` means the engine itself is gone.
    pub async fn send(&self, command: AtCommand) -> Result<AtResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Request::Command {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)
    }

    /// Subscribe to unsolicited lines.
    pub fn unsolicited(&self) -> broadcast::Receiver<String> {
        self.unsolicited_tx.subscribe()
    }

    /// Probe for an AT-speaking endpoint.
    ///
    /// Repeatedly sends `ATQ0 V1 E0` with a short per-attempt timeout.
    /// Succeeds on the first `OK`; gives up after `attempts` tries.
    pub async fn handshake(&self, attempts: u32) -> Result<()> {
        for attempt in 1..=attempts {
            let response = self
                .send(
                    AtCommand::new(HANDSHAKE_COMMAND)
                        .kind(AtCommandKind::NoResponse)
                        .timeout(HANDSHAKE_TIMEOUT),
                )
                .await?;
            if response.success {
                debug!(attempt, "AT handshake succeeded");
                return Ok(());
            }
            if response.status == AtStatus::PortClosed {
                return Err(Error::ConnectionLost);
            }
            trace!(attempt, status = ?response.status, "AT handshake attempt failed");
        }
        Err(Error::Timeout)
    }

    /// Shut down the engine task and recover the transport.
    pub async fn stop(self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        // Don't care if send fails -- engine might have already exited.
        let _ = self.cmd_tx.send(Request::Stop { reply: reply_tx }).await;
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }
}

/// Outcome of waiting for one line or a raw byte run.
enum Wait<T> {
    Ready(T),
    TimedOut,
    Closed,
}

async fn run_engine(
    mut transport: Box<dyn Transport>,
    unsolicited: broadcast::Sender<String>,
    mut cmd_rx: mpsc::Receiver<Request>,
) {
    let mut buffer = BytesMut::with_capacity(1024);
    let mut closed = false;

    loop {
        if closed {
            // The port is gone; keep answering requests so callers get a
            // deterministic failure and the transport can still be
            // recovered for inspection.
            match cmd_rx.recv().await {
                None => return,
                Some(Request::Command { reply, .. }) => {
                    let _ = reply.send(AtResponse::finish(AtStatus::PortClosed, Vec::new(), None));
                }
                Some(Request::Stop { reply }) => {
                    let _ = reply.send(transport);
                    return;
                }
            }
            continue;
        }

        let mut chunk = [0u8; 512];
        tokio::select! {
            request = cmd_rx.recv() => match request {
                None => return,
                Some(Request::Command { command, reply }) => {
                    let response = run_command(
                        transport.as_mut(),
                        &mut buffer,
                        &unsolicited,
                        &command,
                        &mut closed,
                    )
                    .await;
                    let _ = reply.send(response);
                }
                Some(Request::Stop { reply }) => {
                    let _ = reply.send(transport);
                    return;
                }
            },
            received = transport.receive(&mut chunk, IDLE_POLL) => match received {
                Ok(0) => closed = true,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    drain_idle_lines(&mut buffer, &unsolicited);
                }
                Err(Error::Timeout) => {
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
                Err(e) => {
                    warn!(error = %e, "AT channel lost its port");
                    closed = true;
                }
            },
        }
    }
}

/// Dispatch complete lines that arrived while no command was in flight.
fn drain_idle_lines(buffer: &mut BytesMut, unsolicited: &broadcast::Sender<String>) {
    while let Some(line) = pop_line(buffer) {
        if !line.is_empty() {
            trace!(line = %line, "unsolicited line");
            let _ = unsolicited.send(line);
        }
    }
}

/// Take one complete CRLF-terminated line off the front of the buffer.
fn pop_line(buffer: &mut BytesMut) -> Option<String> {
    let pos = buffer.iter().position(|&b| b == b'\n')?;
    let raw = buffer.split_to(pos + 1);
    let mut end = raw.len() - 1;
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    Some(String::from_utf8_lossy(&raw[..end]).into_owned())
}

async fn run_command(
    transport: &mut dyn Transport,
    buffer: &mut BytesMut,
    unsolicited: &broadcast::Sender<String>,
    command: &AtCommand,
    closed: &mut bool,
) -> AtResponse {
    let mut wire = command.text.clone().into_bytes();
    if wire.last() != Some(&b'\r') {
        wire.push(b'\r');
    }

    trace!(command = %command.text, kind = ?command.kind, "sending AT command");
    if let Err(e) = transport.send(&wire).await {
        warn!(command = %command.text, error = %e, "failed to send AT command");
        *closed = true;
        return AtResponse::finish(AtStatus::PortClosed, Vec::new(), None);
    }

    let deadline = Instant::now() + command.timeout;
    let dial = command.kind == AtCommandKind::Dial;
    let mut lines: Vec<String> = Vec::new();
    let mut binary: Option<Vec<u8>> = None;
    let mut kind = command.kind;

    if kind == AtCommandKind::Binary {
        match read_raw(transport, buffer, command.binary_size, deadline).await {
            Wait::Ready(payload) => {
                binary = Some(payload);
                // The payload is done; only the status line remains.
                kind = AtCommandKind::NoResponse;
            }
            Wait::TimedOut => return AtResponse::finish(AtStatus::Timeout, lines, None),
            Wait::Closed => {
                *closed = true;
                return AtResponse::finish(AtStatus::PortClosed, lines, None);
            }
        }
    }

    loop {
        match next_line(transport, buffer, deadline).await {
            Wait::Ready(line) => {
                if line.is_empty() {
                    continue;
                }
                if let Some(status) = AtStatus::from_line(&line, dial) {
                    return AtResponse::finish(status, lines, binary);
                }
                dispatch_line(kind, line, &command.prefix, &mut lines, unsolicited);
            }
            Wait::TimedOut => return AtResponse::finish(AtStatus::Timeout, lines, binary),
            Wait::Closed => {
                *closed = true;
                return AtResponse::finish(AtStatus::PortClosed, lines, binary);
            }
        }
    }
}

/// Route one non-status line per the command kind.
fn dispatch_line(
    kind: AtCommandKind,
    line: String,
    prefix: &str,
    lines: &mut Vec<String>,
    unsolicited: &broadcast::Sender<String>,
) {
    let eject = |line: String| {
        trace!(line = %line, "ejecting line to unsolicited path");
        let _ = unsolicited.send(line);
    };

    match kind {
        AtCommandKind::PrefixFiltered => {
            if !prefix.is_empty() && line.starts_with(prefix) {
                lines.push(line);
            } else {
                eject(line);
            }
        }
        AtCommandKind::NoPrefixAll => {
            let _ = unsolicited.send(line.clone());
            lines.push(line);
        }
        AtCommandKind::NoPrefix => {
            if looks_unsolicited(&line) {
                eject(line);
            } else {
                lines.push(line);
            }
        }
        AtCommandKind::Numeric => {
            let by_prefix = !prefix.is_empty() && line.starts_with(prefix);
            let by_digit = line.as_bytes().first().is_some_and(u8::is_ascii_digit);
            if by_prefix || by_digit {
                lines.push(line);
            } else {
                eject(line);
            }
        }
        AtCommandKind::Multiline => {
            if lines.is_empty() {
                if line.starts_with(prefix) {
                    lines.push(line);
                } else {
                    eject(line);
                }
            } else if looks_unsolicited(&line) {
                eject(line);
            } else {
                let first = &mut lines[0];
                first.push_str("\r\n");
                first.push_str(&line);
            }
        }
        AtCommandKind::Default | AtCommandKind::Dial => {
            if looks_unsolicited(&line) {
                eject(line);
            } else {
                lines.push(line);
            }
        }
        AtCommandKind::NoResponse => eject(line),
        // Rewritten to NoResponse after the payload was consumed.
        AtCommandKind::Binary => eject(line),
    }
}

/// Wait for the next complete line, reading more data as needed.
async fn next_line(
    transport: &mut dyn Transport,
    buffer: &mut BytesMut,
    deadline: Instant,
) -> Wait<String> {
    loop {
        if let Some(line) = pop_line(buffer) {
            return Wait::Ready(line);
        }
        match fill(transport, buffer, deadline).await {
            Wait::Ready(()) => {}
            Wait::TimedOut => return Wait::TimedOut,
            Wait::Closed => return Wait::Closed,
        }
    }
}

/// Consume exactly `size` raw bytes (binary command payload).
async fn read_raw(
    transport: &mut dyn Transport,
    buffer: &mut BytesMut,
    size: usize,
    deadline: Instant,
) -> Wait<Vec<u8>> {
    let mut payload = Vec::with_capacity(size);
    loop {
        let take = buffer.len().min(size - payload.len());
        payload.extend_from_slice(&buffer.split_to(take));
        if payload.len() == size {
            return Wait::Ready(payload);
        }
        match fill(transport, buffer, deadline).await {
            Wait::Ready(()) => {}
            Wait::TimedOut => return Wait::TimedOut,
            Wait::Closed => return Wait::Closed,
        }
    }
}

/// Read at least one more byte into the buffer before the deadline.
async fn fill(
    transport: &mut dyn Transport,
    buffer: &mut BytesMut,
    deadline: Instant,
) -> Wait<()> {
    let now = Instant::now();
    if now >= deadline {
        return Wait::TimedOut;
    }
    let mut chunk = [0u8; 512];
    match transport.receive(&mut chunk, deadline - now).await {
        Ok(0) => Wait::Closed,
        Ok(n) => {
            buffer.extend_from_slice(&chunk[..n]);
            Wait::Ready(())
        }
        Err(Error::Timeout) => Wait::TimedOut,
        Err(Error::NotConnected) | Err(Error::ConnectionLost) => Wait::Closed,
        Err(e) => {
            warn!(error = %e, "read failure mid-command");
            Wait::Closed
        }
    }
}
