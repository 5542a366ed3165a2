//! The bus master actor.
//!
//! One task owns the [`RtuLink`]; every caller posts a [`BusRequest`] over
//! an mpsc queue and awaits the reply on a oneshot channel. Queueing is
//! FIFO, exactly one transaction is in flight at a time, and broadcast
//! writes return as soon as the frame is flushed. Retries are the caller's
//! concern.

use crate::error::{BusError, BusResult};
use crate::frame::{self, FunctionCode};
use crate::link::RtuLink;
use crate::{BROADCAST_UNIT, MAX_FRAME_LEN};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Master tuning knobs.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Depth of the request queue; callers beyond it wait on `send`.
    pub queue_depth: usize,
    /// Initial delay before a reopen attempt after the port vanishes.
    pub reopen_backoff_min: Duration,
    /// Backoff ceiling for reopen attempts.
    pub reopen_backoff_max: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            reopen_backoff_min: Duration::from_secs(1),
            reopen_backoff_max: Duration::from_secs(30),
        }
    }
}

/// Transaction counters. Readable by anyone holding a [`BusHandle`],
/// resettable by no one.
#[derive(Debug, Default)]
struct BusStats {
    tx_frames: AtomicU64,
    rx_frames_ok: AtomicU64,
    crc_errors: AtomicU64,
    timeouts: AtomicU64,
    exceptions: AtomicU64,
}

/// Point-in-time copy of the master counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStatsSnapshot {
    /// Frames transmitted.
    pub tx_frames: u64,
    /// Responses accepted.
    pub rx_frames_ok: u64,
    /// Responses rejected for framing (CRC, truncation, wrong echo).
    pub crc_errors: u64,
    /// Transactions with no response.
    pub timeouts: u64,
    /// Exception responses.
    pub exceptions: u64,
}

struct BusRequest {
    unit_id: u8,
    function: FunctionCode,
    payload: Vec<u8>,
    timeout: Duration,
    reply: oneshot::Sender<BusResult<Vec<u8>>>,
}

/// Cloneable handle for submitting transactions to the master.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<BusRequest>,
    stats: Arc<BusStats>,
    link_up: Arc<AtomicBool>,
    descriptor: Arc<str>,
    baud: u32,
}

impl BusHandle {
    /// Submit one transaction and await its outcome.
    ///
    /// # Errors
    ///
    /// Returns the transaction's [`BusError`], or [`BusError::BusClosed`]
    /// when the master task is gone.
    pub async fn request(
        &self,
        unit_id: u8,
        function: FunctionCode,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BusResult<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = BusRequest {
            unit_id,
            function,
            payload,
            timeout,
            reply: reply_tx,
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| BusError::BusClosed("bus master stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| BusError::BusClosed("bus master dropped the request".into()))?
    }

    /// Read `count` holding registers starting at `address`.
    ///
    /// # Errors
    ///
    /// Propagates the transaction's [`BusError`].
    pub async fn read_holding(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> BusResult<Vec<u16>> {
        let payload = frame::read_registers_payload(address, count);
        let resp = self
            .request(
                unit_id,
                FunctionCode::ReadHoldingRegisters,
                payload.to_vec(),
                timeout,
            )
            .await?;
        frame::parse_read_registers(&resp, count)
    }

    /// Read `count` input registers starting at `address`.
    ///
    /// # Errors
    ///
    /// Propagates the transaction's [`BusError`].
    pub async fn read_input(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> BusResult<Vec<u16>> {
        let payload = frame::read_registers_payload(address, count);
        let resp = self
            .request(
                unit_id,
                FunctionCode::ReadInputRegisters,
                payload.to_vec(),
                timeout,
            )
            .await?;
        frame::parse_read_registers(&resp, count)
    }

    /// Write one holding register. Broadcast (unit 0) flushes the frame
    /// and returns without awaiting a response.
    ///
    /// # Errors
    ///
    /// Propagates the transaction's [`BusError`].
    pub async fn write_single(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
        timeout: Duration,
    ) -> BusResult<()> {
        let payload = frame::write_single_payload(address, value);
        let resp = self
            .request(
                unit_id,
                FunctionCode::WriteSingleRegister,
                payload.to_vec(),
                timeout,
            )
            .await?;
        if unit_id == BROADCAST_UNIT {
            return Ok(());
        }
        frame::verify_write_echo(&resp, address, value)
    }

    /// Write a block of holding registers.
    ///
    /// # Errors
    ///
    /// Propagates the transaction's [`BusError`].
    pub async fn write_multiple(
        &self,
        unit_id: u8,
        address: u16,
        values: &[u16],
        timeout: Duration,
    ) -> BusResult<()> {
        let payload = frame::write_multiple_payload(address, values);
        let resp = self
            .request(
                unit_id,
                FunctionCode::WriteMultipleRegisters,
                payload,
                timeout,
            )
            .await?;
        frame::verify_write_echo(&resp, address, values.len() as u16)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            tx_frames: self.stats.tx_frames.load(Ordering::Relaxed),
            rx_frames_ok: self.stats.rx_frames_ok.load(Ordering::Relaxed),
            crc_errors: self.stats.crc_errors.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            exceptions: self.stats.exceptions.load(Ordering::Relaxed),
        }
    }

    /// Whether the physical line was usable at the last transaction.
    #[must_use]
    pub fn link_up(&self) -> bool {
        self.link_up.load(Ordering::Relaxed)
    }

    /// Identifier of the underlying line (device path or `sim://`).
    #[must_use]
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Configured baud rate.
    #[must_use]
    pub fn baud(&self) -> u32 {
        self.baud
    }
}

struct Master<L: RtuLink> {
    link: L,
    rx: mpsc::Receiver<BusRequest>,
    stats: Arc<BusStats>,
    link_up: Arc<AtomicBool>,
    backoff: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    next_reopen: Option<Instant>,
}

/// Spawn the master actor for the given link.
///
/// Returns the shared handle and the actor's join handle. The actor exits
/// when every [`BusHandle`] clone is dropped, releasing the port last.
pub fn spawn_master<L: RtuLink + 'static>(
    link: L,
    config: MasterConfig,
) -> (BusHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_depth);
    let stats = Arc::new(BusStats::default());
    let link_up = Arc::new(AtomicBool::new(link.is_open()));

    let handle = BusHandle {
        tx,
        stats: Arc::clone(&stats),
        link_up: Arc::clone(&link_up),
        descriptor: link.descriptor().into(),
        baud: link.baud(),
    };

    let master = Master {
        link,
        rx,
        stats,
        link_up,
        backoff: config.reopen_backoff_min,
        backoff_min: config.reopen_backoff_min,
        backoff_max: config.reopen_backoff_max,
        next_reopen: None,
    };

    let join = tokio::spawn(master.run());
    (handle, join)
}

impl<L: RtuLink> Master<L> {
    async fn run(mut self) {
        info!(line = %self.link.descriptor(), baud = self.link.baud(), "bus master started");
        while let Some(request) = self.rx.recv().await {
            let result = self.transact(&request).await;
            self.link_up
                .store(self.link.is_open(), Ordering::Relaxed);
            let _ = request.reply.send(result);
        }
        info!("bus master stopped, releasing line");
    }

    async fn transact(&mut self, request: &BusRequest) -> BusResult<Vec<u8>> {
        self.ensure_open().await?;

        let wire = frame::encode_request(request.unit_id, request.function, &request.payload)?;

        if let Err(e) = self.link.send_frame(&wire).await {
            warn!(error = %e, "transmit failed, marking bus closed");
            self.next_reopen = None;
            return Err(BusError::BusClosed(e.to_string()));
        }
        self.stats.tx_frames.fetch_add(1, Ordering::Relaxed);

        if request.unit_id == BROADCAST_UNIT {
            debug!(function = ?request.function, "broadcast flushed");
            return Ok(Vec::new());
        }

        let raw = match self.link.recv_frame(request.timeout, MAX_FRAME_LEN).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "receive failed, marking bus closed");
                self.next_reopen = None;
                return Err(BusError::BusClosed(e.to_string()));
            }
        };

        if raw.is_empty() {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            return Err(BusError::Timeout(request.timeout));
        }

        match frame::decode_response(&raw, request.unit_id, request.function) {
            Ok(payload) => {
                self.stats.rx_frames_ok.fetch_add(1, Ordering::Relaxed);
                Ok(payload)
            }
            Err(e @ BusError::Exception { .. }) => {
                self.stats.exceptions.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(e) => {
                // CRC mismatch, truncation, and wrong echoes all count as
                // framing damage.
                self.stats.crc_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn ensure_open(&mut self) -> BusResult<()> {
        if self.link.is_open() {
            self.backoff = self.backoff_min;
            return Ok(());
        }

        let now = Instant::now();
        if let Some(next) = self.next_reopen {
            if now < next {
                return Err(BusError::BusClosed("port reopen pending".into()));
            }
        }

        match self.link.reopen().await {
            Ok(()) => {
                info!(line = %self.link.descriptor(), "serial line reopened");
                self.backoff = self.backoff_min;
                self.next_reopen = None;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?self.backoff, "serial line reopen failed");
                self.next_reopen = Some(now + self.backoff);
                self.backoff = (self.backoff * 2).min(self.backoff_max);
                Err(BusError::BusClosed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::holding;
    use crate::sim::{SimBehavior, SimLink, SimSlave, SIM_VENDOR_ID};

    const T: Duration = Duration::from_millis(50);

    fn sim_with_slave(unit: u8) -> SimLink {
        let link = SimLink::default();
        link.add_slave(SimSlave::new(unit, 0x0003));
        link
    }

    #[tokio::test]
    async fn test_read_holding_roundtrip() {
        let (bus, _join) = spawn_master(sim_with_slave(2), MasterConfig::default());
        let regs = bus.read_holding(2, holding::VENDOR_ID, 2, T).await.unwrap();
        assert_eq!(regs[0], SIM_VENDOR_ID);

        let stats = bus.stats();
        assert_eq!(stats.tx_frames, 1);
        assert_eq!(stats.rx_frames_ok, 1);
    }

    #[tokio::test]
    async fn test_absent_unit_times_out() {
        let (bus, _join) = spawn_master(sim_with_slave(2), MasterConfig::default());
        let err = bus.read_holding(9, 0, 1, T).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        assert_eq!(bus.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_corrupt_crc_counted() {
        let link = SimLink::default();
        let mut slave = SimSlave::new(2, 0x0003);
        slave.behavior = SimBehavior::CorruptCrc;
        link.add_slave(slave);

        let (bus, _join) = spawn_master(link, MasterConfig::default());
        let err = bus.read_holding(2, 0, 1, T).await.unwrap_err();
        assert!(matches!(err, BusError::CrcMismatch { .. }));
        assert_eq!(bus.stats().crc_errors, 1);
        assert_eq!(bus.stats().rx_frames_ok, 0);
    }

    #[tokio::test]
    async fn test_exception_counted() {
        let link = SimLink::default();
        let mut slave = SimSlave::new(2, 0x0003);
        slave.behavior = SimBehavior::Exception(0x04);
        link.add_slave(slave);

        let (bus, _join) = spawn_master(link, MasterConfig::default());
        let err = bus.read_holding(2, 0, 1, T).await.unwrap_err();
        assert!(matches!(err, BusError::Exception { .. }));
        assert_eq!(bus.stats().exceptions, 1);
    }

    #[tokio::test]
    async fn test_broadcast_returns_without_response() {
        let (bus, _join) = spawn_master(sim_with_slave(2), MasterConfig::default());
        bus.write_single(BROADCAST_UNIT, holding::IDENTIFY_SECONDS, 5, T)
            .await
            .unwrap();
        let stats = bus.stats();
        assert_eq!(stats.tx_frames, 1);
        assert_eq!(stats.rx_frames_ok, 0);
        assert_eq!(stats.timeouts, 0);
    }

    #[tokio::test]
    async fn test_broadcast_read_rejected() {
        let (bus, _join) = spawn_master(sim_with_slave(2), MasterConfig::default());
        let err = bus.read_holding(BROADCAST_UNIT, 0, 1, T).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_concurrent_requests_all_complete() {
        let link = SimLink::default();
        link.add_slave(SimSlave::new(2, 0x0003));
        link.add_slave(SimSlave::new(16, 0x0003));
        let (bus, _join) = spawn_master(link, MasterConfig::default());

        let mut tasks = Vec::new();
        for i in 0..10 {
            let bus = bus.clone();
            let unit = if i % 2 == 0 { 2 } else { 16 };
            tasks.push(tokio::spawn(async move {
                bus.read_holding(unit, holding::VENDOR_ID, 1, T).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // One transaction at a time: every request produced exactly one
        // TX frame and one accepted response.
        let stats = bus.stats();
        assert_eq!(stats.tx_frames, 10);
        assert_eq!(stats.rx_frames_ok, 10);
    }

    #[tokio::test]
    async fn test_port_loss_and_reopen() {
        let link = SimLink::default();
        link.add_slave(SimSlave::new(2, 0x0003));
        let switch = link.port_switch();
        let (bus, _join) = spawn_master(
            link,
            MasterConfig {
                reopen_backoff_min: Duration::from_millis(1),
                ..MasterConfig::default()
            },
        );

        *switch.lock().unwrap() = false;
        let err = bus.read_holding(2, 0, 1, T).await.unwrap_err();
        assert!(matches!(err, BusError::BusClosed(_)));
        assert!(!bus.link_up());

        *switch.lock().unwrap() = true;
        tokio::time::sleep(Duration::from_millis(5)).await;
        // The next request reopens the line and succeeds.
        bus.read_holding(2, 0, 1, T).await.unwrap();
        assert!(bus.link_up());
    }
}
