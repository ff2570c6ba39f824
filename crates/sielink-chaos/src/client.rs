//! CHAOS client: loader bootstrap, heartbeat engine, flash/RAM I/O.
//!
//! The resident loader drops out of its command state when the line goes
//! quiet, so a background engine task owns the transport and writes the
//! `.` heartbeat every 250 ms whenever no request is in flight. All
//! commands flow through the task as write-then-read exchanges.
//!
//! Page failures run the recovery drill before the block engine retries:
//! busy-heartbeat through the page timeout, drain stale bytes, then up
//! to sixteen pings; a loader that answers none of them is gone.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use sielink_boot::bsl::{self, BslConfig};
use sielink_core::blockio::{
    read_blocks, write_blocks, AdaptivePolicy, BlockRead, BlockWrite, ReadOutcome, Transfer,
    TransferPolicy, WriteOutcome,
};
use sielink_core::error::{Error, Result};
use sielink_core::transport::{drain, read_byte, read_exact, Transport};

use crate::protocol::{
    check_read_reply, check_write_status, encode_read_request, encode_write_request, ChaosInfo,
    BAUDRATE_DONE, BAUDRATE_READY, CFI_LEN, CMD_GET_INFO, CMD_PING, CMD_QUIT, CMD_READ_CFI,
    CMD_SET_BAUDRATE, CMD_SET_BAUDRATE_ACK, CMD_TEST, CMD_WRITE_FLASH, CMD_WRITE_RAM, HEARTBEAT,
    HELLO, INFO_LEN, PONG, READ_TRAILER_LEN,
};

/// The loader image uploaded through BSL.
pub const LOADER_IMAGE: &[u8] = include_bytes!("loader.bin");

/// Idle keep-alive period.
const HEARTBEAT_PERIOD: Duration = Duration::from_millis(250);
/// Busy-heartbeat cadence during recovery.
const RECOVERY_TICK: Duration = Duration::from_millis(50);
/// Pings attempted after the recovery window.
const RECOVERY_PINGS: u32 = 16;
/// Per-ping timeout during recovery.
const RECOVERY_PING_TIMEOUT: Duration = Duration::from_millis(250);

/// Initial transfer page.
const INITIAL_PAGE: usize = 64 * 1024;
/// Pages never shrink below this.
const SMALL_PAGE: usize = 128;
/// Pages at or above this use the big-page retry budget.
const BIG_PAGE_THRESHOLD: usize = 16 * 1024;
const BIG_PAGE_RETRIES: u32 = 2;
const SMALL_PAGE_RETRIES: u32 = 5;

/// Boot and session tuning knobs.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// BSL scan behavior during [`ChaosClient::boot`].
    pub bsl: BslConfig,
    /// How long to wait for the loader's HELLO after the upload.
    pub hello_timeout: Duration,
    /// Response timeout for one command exchange.
    pub response_timeout: Duration,
    /// Busy-heartbeat window after a page failure.
    pub page_timeout: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            bsl: BslConfig::default(),
            hello_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(10),
            page_timeout: Duration::from_secs(2),
        }
    }
}

/// A request sent from client methods to the engine task.
enum Request {
    /// Write bytes, then read an exact-length reply (possibly empty).
    Exchange {
        write: Vec<u8>,
        read_len: usize,
        timeout: Duration,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Read and discard whatever is in flight.
    Drain {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Change the local port rate (stage two of the baud dance).
    SetBaud {
        baud: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Shut down and hand the transport back.
    Stop {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// A running CHAOS session.
pub struct ChaosClient {
    cmd_tx: mpsc::Sender<Request>,
    task: JoinHandle<()>,
    config: ChaosConfig,
}

impl ChaosClient {
    /// Bootstrap the loader through BSL and wait for its HELLO.
    pub async fn boot(
        mut transport: Box<dyn Transport>,
        config: ChaosConfig,
        cancel: &CancellationToken,
    ) -> Result<ChaosClient> {
        bsl::boot(transport.as_mut(), LOADER_IMAGE, &config.bsl, cancel).await?;

        match read_byte(transport.as_mut(), config.hello_timeout).await? {
            Some(HELLO) => {}
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "loader announced itself with {other:#04x}, expected {HELLO:#04x}"
                )))
            }
            None => return Err(Error::Timeout),
        }
        info!("CHAOS loader is up");

        Ok(Self::attach_with_config(transport, config))
    }

    /// Attach to a loader that is already running (it must be in its
    /// command state).
    pub fn attach(transport: Box<dyn Transport>) -> ChaosClient {
        Self::attach_with_config(transport, ChaosConfig::default())
    }

    /// [`ChaosClient::attach`] with explicit tuning.
    pub fn attach_with_config(transport: Box<dyn Transport>, config: ChaosConfig) -> ChaosClient {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let task = tokio::spawn(run_engine(transport, cmd_rx));
        ChaosClient {
            cmd_tx,
            task,
            config,
        }
    }

    /// The transfer policy matching the loader's paging behavior:
    /// 64 KiB pages shrinking down to 128 bytes, two retries at big
    /// pages, five at small ones.
    pub fn transfer_policy() -> TransferPolicy {
        TransferPolicy {
            align: 1,
            page_size: INITIAL_PAGE,
            max_retries: SMALL_PAGE_RETRIES,
            progress_interval: Duration::from_millis(250),
            adaptive: Some(AdaptivePolicy {
                small_page_size: SMALL_PAGE,
                big_page_threshold: BIG_PAGE_THRESHOLD,
                big_page_retries: BIG_PAGE_RETRIES,
                small_page_retries: SMALL_PAGE_RETRIES,
            }),
        }
    }

    async fn exchange(&self, write: Vec<u8>, read_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Request::Exchange {
                write,
                read_len,
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Liveness probe; expects the PONG byte.
    pub async fn ping(&self) -> Result<()> {
        self.ping_with_timeout(self.config.response_timeout).await
    }

    async fn ping_with_timeout(&self, timeout: Duration) -> Result<()> {
        let reply = self.exchange(vec![CMD_PING], 1, timeout).await?;
        if reply[0] != PONG {
            return Err(Error::Protocol(format!(
                "ping answered {:#04x}, expected {PONG:#04x}",
                reply[0]
            )));
        }
        Ok(())
    }

    /// Fetch and parse the 128-byte info record.
    pub async fn get_info(&self) -> Result<ChaosInfo> {
        let record = self
            .exchange(vec![CMD_GET_INFO], INFO_LEN, self.config.response_timeout)
            .await?;
        ChaosInfo::parse(&record)
    }

    /// Loader self-test; returns the raw status byte.
    pub async fn test(&self) -> Result<u8> {
        let reply = self
            .exchange(vec![CMD_TEST], 1, self.config.response_timeout)
            .await?;
        Ok(reply[0])
    }

    /// Raw CFI query data from the flash chip.
    pub async fn read_cfi(&self) -> Result<Vec<u8>> {
        self.exchange(vec![CMD_READ_CFI], CFI_LEN, self.config.response_timeout)
            .await
    }

    /// The two-stage baud change.
    ///
    /// Stage one asks the loader to retime; on its ready byte the local
    /// port switches and stage two confirms at the new rate.
    pub async fn set_baud_rate(&self, baud: u32) -> Result<()> {
        let mut request = vec![CMD_SET_BAUDRATE];
        request.extend_from_slice(&baud.to_le_bytes());
        let reply = self
            .exchange(request, 1, self.config.response_timeout)
            .await?;
        if reply[0] != BAUDRATE_READY {
            return Err(Error::Protocol(format!(
                "baud change refused with {:#04x}",
                reply[0]
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Request::SetBaud {
                baud,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)??;

        let reply = self
            .exchange(
                vec![CMD_SET_BAUDRATE_ACK],
                1,
                self.config.response_timeout,
            )
            .await?;
        if reply[0] != BAUDRATE_DONE {
            return Err(Error::Protocol(format!(
                "baud change not confirmed: {:#04x}",
                reply[0]
            )));
        }
        debug!(baud, "loader retimed");
        Ok(())
    }

    /// Bulk flash read through the block engine.
    pub async fn read_flash(
        &self,
        addr: u32,
        len: u32,
        transfer: &mut Transfer<'_>,
    ) -> Result<ReadOutcome> {
        let mut source = PageChannel { client: self };
        read_blocks(&mut source, addr, len, transfer).await
    }

    /// Bulk flash write through the block engine.
    pub async fn write_flash(
        &self,
        addr: u32,
        data: &[u8],
        transfer: &mut Transfer<'_>,
    ) -> Result<WriteOutcome> {
        let mut sink = PageSink {
            client: self,
            opcode: CMD_WRITE_FLASH,
        };
        write_blocks(&mut sink, addr, data, transfer).await
    }

    /// Bulk RAM write through the block engine.
    pub async fn write_ram(
        &self,
        addr: u32,
        data: &[u8],
        transfer: &mut Transfer<'_>,
    ) -> Result<WriteOutcome> {
        let mut sink = PageSink {
            client: self,
            opcode: CMD_WRITE_RAM,
        };
        write_blocks(&mut sink, addr, data, transfer).await
    }

    /// Leave the loader's command state and recover the transport.
    pub async fn quit(self) -> Result<Box<dyn Transport>> {
        let _ = self.exchange(vec![CMD_QUIT], 0, Duration::from_millis(100)).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Request::Stop { reply: reply_tx }).await;
        let transport = reply_rx.await.map_err(|_| Error::NotConnected)?;
        let _ = self.task.await;
        Ok(transport)
    }

    /// Post-failure recovery drill.
    ///
    /// Keeps the loader fed with heartbeats through the page timeout so
    /// its command parser resets, drains stale reply bytes, then probes
    /// with pings. Failure of every ping means the connection is lost.
    async fn recover(&self) -> Result<()> {
        warn!("page failed; running recovery");
        let deadline = tokio::time::Instant::now() + self.config.page_timeout;
        while tokio::time::Instant::now() < deadline {
            let _ = self
                .exchange(vec![HEARTBEAT], 0, RECOVERY_PING_TIMEOUT)
                .await;
            tokio::time::sleep(RECOVERY_TICK).await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Request::Drain { reply: reply_tx })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)??;

        for attempt in 1..=RECOVERY_PINGS {
            if self.ping_with_timeout(RECOVERY_PING_TIMEOUT).await.is_ok() {
                debug!(attempt, "loader answered; resuming");
                return Ok(());
            }
        }
        Err(Error::ConnectionLost)
    }
}

/// Chunk primitive shared by reads and writes.
struct PageChannel<'a> {
    client: &'a ChaosClient,
}

#[async_trait]
impl BlockRead for PageChannel<'_> {
    fn max_page_size(&self) -> usize {
        INITIAL_PAGE
    }

    async fn read_block(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        let request = encode_read_request(addr, buf.len() as u32);
        let reply = self
            .client
            .exchange(
                request.to_vec(),
                buf.len() + READ_TRAILER_LEN,
                self.client.config.response_timeout,
            )
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.client.recover().await?;
                return Err(e);
            }
        };
        match check_read_reply(&reply, buf.len()) {
            Ok(data) => {
                buf.copy_from_slice(data);
                Ok(())
            }
            Err(e) => {
                self.client.recover().await?;
                Err(e)
            }
        }
    }
}

/// Write-side chunk primitive; the opcode selects flash or RAM.
struct PageSink<'a> {
    client: &'a ChaosClient,
    opcode: u8,
}

#[async_trait]
impl BlockWrite for PageSink<'_> {
    fn max_page_size(&self) -> usize {
        INITIAL_PAGE
    }

    async fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let request = encode_write_request(self.opcode, addr, data);
        let reply = self
            .client
            .exchange(request, 2, self.client.config.response_timeout)
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.client.recover().await?;
                return Err(e);
            }
        };
        match check_write_status(&reply) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.client.recover().await?;
                Err(e)
            }
        }
    }
}

async fn run_engine(mut transport: Box<dyn Transport>, mut cmd_rx: mpsc::Receiver<Request>) {
    let mut closed = false;
    loop {
        if closed {
            match cmd_rx.recv().await {
                None => return,
                Some(Request::Exchange { reply, .. }) => {
                    let _ = reply.send(Err(Error::ConnectionLost));
                }
                Some(Request::Drain { reply }) => {
                    let _ = reply.send(Err(Error::ConnectionLost));
                }
                Some(Request::SetBaud { reply, .. }) => {
                    let _ = reply.send(Err(Error::ConnectionLost));
                }
                Some(Request::Stop { reply }) => {
                    let _ = reply.send(transport);
                    return;
                }
            }
            continue;
        }

        tokio::select! {
            request = cmd_rx.recv() => match request {
                None => return,
                Some(Request::Exchange { write, read_len, timeout, reply }) => {
                    let result = exchange(transport.as_mut(), &write, read_len, timeout).await;
                    if matches!(result, Err(Error::NotConnected | Error::ConnectionLost)) {
                        closed = true;
                    }
                    let _ = reply.send(result);
                }
                Some(Request::Drain { reply }) => {
                    let result = drain(transport.as_mut(), 4096, Duration::from_millis(50))
                        .await
                        .map(|_| ());
                    let _ = reply.send(result);
                }
                Some(Request::SetBaud { baud, reply }) => {
                    let _ = reply.send(transport.set_baud_rate(baud).await);
                }
                Some(Request::Stop { reply }) => {
                    let _ = reply.send(transport);
                    return;
                }
            },
            _ = tokio::time::sleep(HEARTBEAT_PERIOD) => {
                trace!("idle heartbeat");
                if let Err(e) = transport.send(&[HEARTBEAT]).await {
                    warn!(error = %e, "heartbeat failed; loader connection lost");
                    closed = true;
                }
            }
        }
    }
}

/// One write-then-read cycle on the raw transport.
async fn exchange(
    transport: &mut dyn Transport,
    write: &[u8],
    read_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    transport.send(write).await?;
    if read_len == 0 {
        return Ok(Vec::new());
    }
    let mut reply = vec![0u8; read_len];
    let got = read_exact(transport, &mut reply, timeout).await?;
    if got != read_len {
        return Err(Error::Timeout);
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{make_info_record, STATUS_BAD_CHECKSUM, STATUS_OK};
    use sielink_core::helpers::xor8;
    use sielink_test_harness::scripted_transport;

    /// The loader side of the protocol, as a scripted responder.
    struct LoaderSim {
        /// Page reads below this many attempts answer a corrupt check
        /// word.
        corrupt_reads: u32,
        read_attempts: u32,
        /// Flash writes report a checksum failure.
        reject_writes: bool,
        awaiting_baud_ack: bool,
    }

    impl LoaderSim {
        fn new() -> LoaderSim {
            LoaderSim {
                corrupt_reads: 0,
                read_attempts: 0,
                reject_writes: false,
                awaiting_baud_ack: false,
            }
        }

        fn into_responder(mut self) -> impl FnMut(&[u8]) -> Vec<u8> + Send {
            move |data: &[u8]| self.handle(data)
        }

        fn handle(&mut self, data: &[u8]) -> Vec<u8> {
            match data[0] {
                HEARTBEAT => Vec::new(),
                CMD_PING if !self.awaiting_baud_ack => vec![PONG],
                CMD_SET_BAUDRATE_ACK if self.awaiting_baud_ack => {
                    self.awaiting_baud_ack = false;
                    vec![BAUDRATE_DONE]
                }
                CMD_SET_BAUDRATE => {
                    self.awaiting_baud_ack = true;
                    vec![BAUDRATE_READY]
                }
                CMD_GET_INFO => {
                    make_info_record("S65", "SIEMENS", "490154203237518", 0xA000_0000, &[(7, 32)])
                }
                CMD_QUIT => Vec::new(),
                CMD_TEST => vec![0x00],
                CMD_READ_CFI => vec![0x51; CFI_LEN],
                CMD_READ_FLASH if data.len() == 9 => {
                    self.read_attempts += 1;
                    let addr = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
                    let size = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
                    let page: Vec<u8> = (0..size).map(|i| (addr as usize + i) as u8).collect();
                    let mut reply = page.clone();
                    reply.extend_from_slice(&STATUS_OK.to_le_bytes());
                    let chk = if self.read_attempts <= self.corrupt_reads {
                        (xor8(&page) as u16) ^ 0x00FF
                    } else {
                        xor8(&page) as u16
                    };
                    reply.extend_from_slice(&chk.to_le_bytes());
                    reply
                }
                CMD_WRITE_FLASH | CMD_WRITE_RAM => {
                    let size =
                        u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
                    let payload = &data[9..9 + size];
                    let chk = data[9 + size];
                    let status = if self.reject_writes || chk != xor8(payload) {
                        STATUS_BAD_CHECKSUM
                    } else {
                        STATUS_OK
                    };
                    status.to_le_bytes().to_vec()
                }
                _ => Vec::new(),
            }
        }
    }

    fn quick_config() -> ChaosConfig {
        ChaosConfig {
            response_timeout: Duration::from_millis(200),
            page_timeout: Duration::from_millis(100),
            ..ChaosConfig::default()
        }
    }

    #[tokio::test]
    async fn boot_uploads_loader_and_waits_for_hello() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(|data: &[u8]| {
            if data == b"AT" {
                vec![0xB0]
            } else if data.first() == Some(&0x30) {
                // Payload accepted; HELLO follows immediately.
                vec![0xB1, HELLO]
            } else if data[0] == CMD_PING {
                vec![PONG]
            } else {
                Vec::new()
            }
        });

        let cancel = CancellationToken::new();
        let client = ChaosClient::boot(Box::new(transport), quick_config(), &cancel)
            .await
            .unwrap();
        client.ping().await.unwrap();

        // The BSL payload frame carried the embedded image.
        let stream = handle.sent_bytes();
        let marker = stream.iter().position(|&b| b == 0x30).unwrap();
        let len = u16::from_le_bytes([stream[marker + 1], stream[marker + 2]]) as usize;
        assert_eq!(len, LOADER_IMAGE.len());
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn ping_and_info() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(LoaderSim::new().into_responder());

        let client = ChaosClient::attach_with_config(Box::new(transport), quick_config());
        client.ping().await.unwrap();

        let info = client.get_info().await.unwrap();
        assert_eq!(info.model, "S65");
        assert_eq!(info.regions.len(), 8);
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_flows_while_idle() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(LoaderSim::new().into_responder());

        let client = ChaosClient::attach_with_config(Box::new(transport), quick_config());
        tokio::time::sleep(Duration::from_millis(700)).await;

        let beats = handle
            .sent()
            .iter()
            .filter(|w| w.as_slice() == [HEARTBEAT])
            .count();
        assert!(beats >= 2, "expected idle heartbeats, saw {beats}");
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn flash_read_recovers_from_corrupt_pages() {
        let (transport, handle) = scripted_transport();
        let mut sim = LoaderSim::new();
        sim.corrupt_reads = 2;
        handle.respond_with(sim.into_responder());

        let client = ChaosClient::attach_with_config(Box::new(transport), quick_config());
        let mut transfer = Transfer::new(ChaosClient::transfer_policy());
        let outcome = client
            .read_flash(0xA000_0000, 512, &mut transfer)
            .await
            .unwrap();
        assert_eq!(outcome.buffer.len(), 512);
        assert_eq!(outcome.errors, 2);
        assert_eq!(outcome.buffer[5], 0x05);
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn flash_write_round_trip_and_rejection() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(LoaderSim::new().into_responder());

        let client = ChaosClient::attach_with_config(Box::new(transport), quick_config());
        let mut transfer = Transfer::new(ChaosClient::transfer_policy());
        let outcome = client
            .write_flash(0xA004_0000, &[0x42; 1024], &mut transfer)
            .await
            .unwrap();
        assert_eq!(outcome.written, 1024);
        client.quit().await.unwrap();

        // A loader that rejects every write exhausts the retry budget
        // with an integrity error.
        let (transport, handle) = scripted_transport();
        let mut sim = LoaderSim::new();
        sim.reject_writes = true;
        handle.respond_with(sim.into_responder());

        let client = ChaosClient::attach_with_config(Box::new(transport), quick_config());
        let mut transfer = Transfer::new(TransferPolicy {
            page_size: 128,
            max_retries: 1,
            ..TransferPolicy::default()
        });
        let result = client
            .write_ram(0x0010_0000, &[0x42; 128], &mut transfer)
            .await;
        assert!(matches!(result, Err(Error::Integrity { .. })));
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn baud_change_two_stage() {
        let (transport, handle) = scripted_transport();
        handle.respond_with(LoaderSim::new().into_responder());

        let client = ChaosClient::attach_with_config(Box::new(transport), quick_config());
        client.set_baud_rate(921_600).await.unwrap();
        assert_eq!(handle.baud_changes(), vec![921_600]);
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn dead_loader_is_connection_lost() {
        let (transport, _handle) = scripted_transport();

        let mut config = quick_config();
        config.response_timeout = Duration::from_millis(50);
        config.page_timeout = Duration::from_millis(50);
        let client = ChaosClient::attach_with_config(Box::new(transport), config);

        let mut transfer = Transfer::new(ChaosClient::transfer_policy());
        let result = client.read_flash(0xA000_0000, 256, &mut transfer).await;
        assert!(matches!(result, Err(Error::ConnectionLost)));
        client.quit().await.unwrap();
    }
}
