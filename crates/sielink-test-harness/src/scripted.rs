//! Free-running scripted transport.
//!
//! [`MockTransport`](crate::MockTransport) pairs every response with a
//! prior send, which fits strict command/response protocols. Engine tasks
//! that read continuously (the AT channel's unsolicited path, the BFC bus
//! resync scanner, the CHAOS heartbeat loop) need a transport whose
//! inbound bytes arrive independently of what was written. That is
//! [`ScriptedTransport`]: the test holds a [`ScriptHandle`] and feeds
//! bytes, inspects writes, or hangs up while the engine owns the
//! transport.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use sielink_core::error::{Error, Result};
use sielink_core::transport::{SerialSignals, Transport};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

struct State {
    inbound: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    connected: bool,
    baud: u32,
    baud_log: Vec<u32>,
    signal_log: Vec<SerialSignals>,
    responder: Option<Responder>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// A [`Transport`] whose inbound byte stream is scripted by the test.
pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

/// The test-side handle paired with a [`ScriptedTransport`].
#[derive(Clone)]
pub struct ScriptHandle {
    shared: Arc<Shared>,
}

/// Create a connected scripted transport and its test handle.
pub fn scripted_transport() -> (ScriptedTransport, ScriptHandle) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            inbound: VecDeque::new(),
            sent: Vec::new(),
            connected: true,
            baud: 115_200,
            baud_log: Vec::new(),
            signal_log: Vec::new(),
            responder: None,
        }),
        notify: Notify::new(),
    });
    (
        ScriptedTransport {
            shared: Arc::clone(&shared),
        },
        ScriptHandle { shared },
    )
}

impl ScriptHandle {
    /// Queue bytes for the engine to receive.
    pub fn push(&self, bytes: &[u8]) {
        let mut state = self.shared.state.lock().unwrap();
        state.inbound.extend(bytes.iter().copied());
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Install a responder invoked on every write; its return bytes are
    /// queued as inbound data. This is how tests stand in for the phone
    /// side of a request/response exchange.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        state.responder = Some(Box::new(responder));
    }

    /// Simulate the port going away.
    pub fn hang_up(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.connected = false;
        drop(state);
        self.shared.notify.notify_one();
    }

    /// All writes the engine performed, one entry per `send()` call.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().unwrap().sent.clone()
    }

    /// All writes flattened into one byte stream.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.shared
            .state
            .lock()
            .unwrap()
            .sent
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// Baud-rate changes applied by the engine, in order.
    pub fn baud_changes(&self) -> Vec<u32> {
        self.shared.state.lock().unwrap().baud_log.clone()
    }

    /// Signal changes applied by the engine, in order.
    pub fn signal_changes(&self) -> Vec<SerialSignals> {
        self.shared.state.lock().unwrap().signal_log.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        // Run the responder outside the lock so it may touch the handle.
        let responder = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.connected {
                return Err(Error::NotConnected);
            }
            state.sent.push(data.to_vec());
            state.responder.take()
        };
        if let Some(mut responder) = responder {
            let bytes = responder(data);
            let mut state = self.shared.state.lock().unwrap();
            state.inbound.extend(bytes.iter().copied());
            if state.responder.is_none() {
                state.responder = Some(responder);
            }
            drop(state);
            self.shared.notify.notify_one();
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if !state.inbound.is_empty() {
                    let n = state.inbound.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = state.inbound.pop_front().unwrap();
                    }
                    return Ok(n);
                }
                if !state.connected {
                    return Err(Error::ConnectionLost);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = tokio::time::sleep(deadline - now) => {}
            }
        }
    }

    async fn set_signals(&mut self, signals: SerialSignals) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        state.signal_log.push(signals);
        Ok(())
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        state.baud = baud;
        state.baud_log.push(baud);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.shared.state.lock().unwrap().baud
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.connected = false;
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.state.lock().unwrap().connected
    }
}
