//! The BFC bus engine.
//!
//! [`BfcBus::start`] spawns a task that exclusively owns the transport,
//! scans the inbound byte stream for frames (resynchronising across
//! noise), and routes each frame to the pending receiver slot keyed by
//! the frame's destination. At most one receiver is live per destination;
//! an exec addressed to a busy destination queues behind the current
//! slot's completion.
//!
//! Frames carrying the ACK flag are acknowledged automatically. Transport
//! loss fails every pending and queued receiver with
//! [`Error::ConnectionLost`].

use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use sielink_core::error::{Error, Result};
use sielink_core::transport::Transport;

use crate::frame::{decode_frame, BfcFrame, DecodeResult};
use crate::parser::{ParseStep, ReplyParser};

/// How long the engine waits for data before re-checking requests and
/// slot deadlines.
const POLL: Duration = Duration::from_millis(100);

/// One queued or active exec.
struct Exec {
    frame: BfcFrame,
    reply_dst: u8,
    parser: ReplyParser,
    timeout: Duration,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// A live receiver slot.
struct Slot {
    parser: ReplyParser,
    deadline: Instant,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// A request sent from bus methods to the engine task.
enum Request {
    Exec(Exec),
    SetBaud {
        baud: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    GetBaud {
        reply: oneshot::Sender<u32>,
    },
    Stop {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Handle to a running BFC bus.
pub struct BfcBus {
    cmd_tx: mpsc::Sender<Request>,
    task: JoinHandle<()>,
}

impl BfcBus {
    /// Start the engine on the given transport.
    pub fn start(transport: Box<dyn Transport>) -> BfcBus {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let task = tokio::spawn(run_engine(transport, cmd_rx));
        BfcBus { cmd_tx, task }
    }

    /// Send a frame and await the reply assembled by `parser`.
    ///
    /// `reply_dst` keys the receiver slot: inbound frames whose `dst`
    /// matches it feed the parser. Execs to a busy destination serialize
    /// behind the pending one.
    pub async fn exec(
        &self,
        frame: BfcFrame,
        reply_dst: u8,
        parser: ReplyParser,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Request::Exec(Exec {
                frame,
                reply_dst,
                parser,
                timeout,
                reply: reply_tx,
            }))
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Change the local port's baud rate (used during baud negotiation).
    pub async fn set_baud_rate(&self, baud: u32) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Request::SetBaud {
                baud,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// The local port's current baud rate.
    pub async fn baud_rate(&self) -> Result<u32> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Request::GetBaud { reply: reply_tx })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)
    }

    /// Shut down the engine and recover the transport.
    pub async fn stop(self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Request::Stop { reply: reply_tx }).await;
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }
}

struct Engine {
    transport: Box<dyn Transport>,
    buffer: BytesMut,
    slots: HashMap<u8, Slot>,
    queues: HashMap<u8, VecDeque<Exec>>,
    closed: bool,
}

async fn run_engine(transport: Box<dyn Transport>, mut cmd_rx: mpsc::Receiver<Request>) {
    let mut engine = Engine {
        transport,
        buffer: BytesMut::with_capacity(4096),
        slots: HashMap::new(),
        queues: HashMap::new(),
        closed: false,
    };

    loop {
        engine.expire_slots().await;

        if engine.closed {
            match cmd_rx.recv().await {
                None => return,
                Some(Request::Exec(exec)) => {
                    let _ = exec.reply.send(Err(Error::ConnectionLost));
                }
                Some(Request::SetBaud { reply, .. }) => {
                    let _ = reply.send(Err(Error::ConnectionLost));
                }
                Some(Request::GetBaud { reply }) => {
                    let _ = reply.send(engine.transport.baud_rate());
                }
                Some(Request::Stop { reply }) => {
                    let _ = reply.send(engine.transport);
                    return;
                }
            }
            continue;
        }

        let mut chunk = [0u8; 1024];
        tokio::select! {
            request = cmd_rx.recv() => match request {
                None => return,
                Some(Request::Exec(exec)) => engine.submit(exec).await,
                Some(Request::SetBaud { baud, reply }) => {
                    let _ = reply.send(engine.transport.set_baud_rate(baud).await);
                }
                Some(Request::GetBaud { reply }) => {
                    let _ = reply.send(engine.transport.baud_rate());
                }
                Some(Request::Stop { reply }) => {
                    engine.fail_all(Error::ConnectionLost);
                    let _ = reply.send(engine.transport);
                    return;
                }
            },
            received = engine.transport.receive(&mut chunk, POLL) => match received {
                Ok(0) => engine.lose_connection(),
                Ok(n) => {
                    engine.buffer.extend_from_slice(&chunk[..n]);
                    engine.pump().await;
                }
                Err(Error::Timeout) => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Err(e) => {
                    warn!(error = %e, "BFC bus lost its port");
                    engine.lose_connection();
                }
            },
        }
    }
}

impl Engine {
    /// Activate an exec, or queue it when its destination is busy.
    async fn submit(&mut self, exec: Exec) {
        if self.slots.contains_key(&exec.reply_dst) {
            trace!(dst = exec.reply_dst, "destination busy; queueing exec");
            self.queues.entry(exec.reply_dst).or_default().push_back(exec);
            return;
        }
        self.activate(exec).await;
    }

    async fn activate(&mut self, exec: Exec) {
        let Exec {
            frame,
            reply_dst,
            parser,
            timeout,
            reply,
        } = exec;

        trace!(dst = frame.dst, bytes = frame.payload.len(), "sending frame");
        if let Err(e) = self.transport.send(&frame.encode()).await {
            let fatal = matches!(e, Error::NotConnected | Error::ConnectionLost);
            let _ = reply.send(Err(e));
            if fatal {
                self.lose_connection();
            }
            return;
        }

        self.slots.insert(
            reply_dst,
            Slot {
                parser,
                deadline: Instant::now() + timeout,
                reply,
            },
        );
    }

    /// Decode and route every complete frame in the buffer.
    async fn pump(&mut self) {
        loop {
            match decode_frame(&self.buffer) {
                DecodeResult::Frame(frame, consumed) => {
                    let _ = self.buffer.split_to(consumed);
                    self.route(frame).await;
                }
                DecodeResult::Junk(n) => {
                    trace!(bytes = n, "discarding noise before frame");
                    let _ = self.buffer.split_to(n);
                }
                DecodeResult::Incomplete => break,
            }
        }
    }

    async fn route(&mut self, frame: BfcFrame) {
        if frame.ack {
            let ack = BfcFrame::ack_reply(&frame);
            if let Err(e) = self.transport.send(&ack.encode()).await {
                warn!(error = %e, "failed to send auto-ACK");
            }
        }

        let dst = frame.dst;
        let Some(mut slot) = self.slots.remove(&dst) else {
            trace!(dst, src = frame.src, "frame for idle destination dropped");
            return;
        };

        match slot.parser.feed(&frame) {
            Ok(ParseStep::Continue) => {
                self.slots.insert(dst, slot);
            }
            Ok(ParseStep::Done(payload)) => {
                let _ = slot.reply.send(Ok(payload));
                self.start_next(dst).await;
            }
            Err(e) => {
                let _ = slot.reply.send(Err(e));
                self.start_next(dst).await;
            }
        }
    }

    /// Activate the next queued exec for a destination, if any.
    async fn start_next(&mut self, dst: u8) {
        let next = self.queues.get_mut(&dst).and_then(VecDeque::pop_front);
        if let Some(exec) = next {
            self.activate(exec).await;
        }
    }

    /// Fail slots whose deadline has passed.
    async fn expire_slots(&mut self) {
        let now = Instant::now();
        let expired: Vec<u8> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(&dst, _)| dst)
            .collect();
        for dst in expired {
            debug!(dst, "receiver slot timed out");
            if let Some(slot) = self.slots.remove(&dst) {
                let _ = slot.reply.send(Err(Error::Timeout));
            }
            self.start_next(dst).await;
        }
    }

    fn lose_connection(&mut self) {
        if !self.closed {
            self.closed = true;
            self.fail_all(Error::ConnectionLost);
        }
    }

    fn fail_all(&mut self, _reason: Error) {
        for (_, slot) in self.slots.drain() {
            let _ = slot.reply.send(Err(Error::ConnectionLost));
        }
        for (_, queue) in self.queues.drain() {
            for exec in queue {
                let _ = exec.reply.send(Err(Error::ConnectionLost));
            }
        }
    }
}
