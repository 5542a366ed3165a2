//! Simulated bus for tests and hardware-free runs.
//!
//! [`SimSlave`] implements the published register map bit-exactly, so the
//! full master → frame → CRC path is exercised in both directions.
//! [`SimLink`] plays the role of the serial line for a bank of slaves and
//! supports fault injection per slave.

use crate::crc::{append_crc, check_crc};
use crate::registers::{holding, EEPROM_SAVE_MAGIC};
use crate::{link::RtuLink, BROADCAST_UNIT};
use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Vendor id reported by simulated slaves.
pub const SIM_VENDOR_ID: u16 = 0x0042;
/// Product id reported by simulated slaves.
pub const SIM_PRODUCT_ID: u16 = 0x1001;
/// Hardware version reported by simulated slaves (1.1).
pub const SIM_HW_VERSION: u16 = 0x0101;
/// Firmware version reported by simulated slaves (2.3).
pub const SIM_FW_VERSION: u16 = 0x0203;

/// Number of holding registers a simulated slave backs (through the alias
/// block).
const HOLDING_WORDS: usize = 0x51;
/// Number of input registers a simulated slave backs.
const INPUT_WORDS: usize = 0x10;

/// Fault injection modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimBehavior {
    /// Answer normally.
    #[default]
    Normal,
    /// Never answer (timeout at the master).
    Mute,
    /// Answer with the final CRC byte flipped.
    CorruptCrc,
    /// Answer every request with the given exception code.
    Exception(u8),
}

/// One simulated Modbus RTU slave.
#[derive(Debug, Clone)]
pub struct SimSlave {
    /// Current unit id; re-keyed when a unit id change is saved to EEPROM.
    pub unit_id: u8,
    /// Fault injection mode.
    pub behavior: SimBehavior,
    holding: [u16; HOLDING_WORDS],
    input: [u16; INPUT_WORDS],
    eeprom_saves: u32,
}

impl SimSlave {
    /// Create a slave with the given unit id and capability bitmask.
    #[must_use]
    pub fn new(unit_id: u8, capabilities: u16) -> Self {
        let mut holding = [0u16; HOLDING_WORDS];
        holding[holding::VENDOR_ID as usize] = SIM_VENDOR_ID;
        holding[holding::PRODUCT_ID as usize] = SIM_PRODUCT_ID;
        holding[holding::HW_VERSION as usize] = SIM_HW_VERSION;
        holding[holding::FW_VERSION as usize] = SIM_FW_VERSION;
        holding[holding::UNIT_ID_ECHO as usize] = u16::from(unit_id);
        holding[holding::CAPABILITIES as usize] = capabilities;
        holding[holding::UNIT_ID_CONFIG as usize] = u16::from(unit_id);

        let mut slave = Self {
            unit_id,
            behavior: SimBehavior::Normal,
            holding,
            input: [0u16; INPUT_WORDS],
            eeprom_saves: 0,
        };
        slave.store_name(holding::VENDOR_STR_LEN, b"RIGSENS");
        slave.store_name(holding::PRODUCT_STR_LEN, b"TILT-1");
        slave
    }

    fn store_name(&mut self, len_addr: u16, name: &[u8]) {
        let name = &name[..name.len().min(8)];
        self.holding[len_addr as usize] = name.len() as u16;
        for (i, pair) in name.chunks(2).enumerate() {
            let hi = u16::from(pair[0]) << 8;
            let lo = pair.get(1).map_or(0, |&b| u16::from(b));
            self.holding[len_addr as usize + 1 + i] = hi | lo;
        }
    }

    /// Set an input register to a raw wire value.
    pub fn set_input(&mut self, addr: u16, raw: u16) {
        if (addr as usize) < INPUT_WORDS {
            self.input[addr as usize] = raw;
        }
    }

    /// Read back a holding register (test inspection).
    #[must_use]
    pub fn holding(&self, addr: u16) -> u16 {
        self.holding.get(addr as usize).copied().unwrap_or(0)
    }

    /// Number of EEPROM save commands accepted.
    #[must_use]
    pub fn eeprom_saves(&self) -> u32 {
        self.eeprom_saves
    }

    /// Process one request frame, returning the response frame if this
    /// slave answers.
    pub fn handle(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 4 || check_crc(frame).is_err() {
            return None;
        }

        let unit = frame[0];
        let broadcast = unit == BROADCAST_UNIT;
        if !broadcast && unit != self.unit_id {
            return None;
        }
        if self.behavior == SimBehavior::Mute {
            return None;
        }

        let function = frame[1];
        let body = &frame[2..frame.len() - 2];

        if broadcast {
            // Broadcast is write-single only; apply silently, never answer.
            if function == 0x06 && body.len() == 4 {
                let addr = u16::from_be_bytes([body[0], body[1]]);
                let value = u16::from_be_bytes([body[2], body[3]]);
                self.apply_write(addr, value);
            }
            return None;
        }

        if let SimBehavior::Exception(code) = self.behavior {
            return Some(self.exception(function, code));
        }

        let response = match function {
            0x03 => self.read_block(function, body, false),
            0x04 => self.read_block(function, body, true),
            0x06 => self.write_single(frame, body),
            0x10 => self.write_multiple(body),
            0x11 => self.report_server_id(),
            0x41 => self.identify_info(),
            _ => self.exception(function, 0x01),
        };

        Some(match self.behavior {
            SimBehavior::CorruptCrc => {
                let mut corrupted = response;
                if let Some(last) = corrupted.last_mut() {
                    *last ^= 0xFF;
                }
                corrupted
            }
            _ => response,
        })
    }

    fn read_block(&self, function: u8, body: &[u8], input: bool) -> Vec<u8> {
        if body.len() != 4 {
            return self.exception(function, 0x03);
        }
        let addr = u16::from_be_bytes([body[0], body[1]]) as usize;
        let count = u16::from_be_bytes([body[2], body[3]]) as usize;
        let bank: &[u16] = if input { &self.input } else { &self.holding };

        if count == 0 || count > 125 || addr + count > bank.len() {
            return self.exception(function, 0x02);
        }

        let mut resp = vec![self.unit_id, function, (count * 2) as u8];
        for word in &bank[addr..addr + count] {
            resp.extend_from_slice(&word.to_be_bytes());
        }
        append_crc(&mut resp);
        resp
    }

    fn write_single(&mut self, frame: &[u8], body: &[u8]) -> Vec<u8> {
        if body.len() != 4 {
            return self.exception(0x06, 0x03);
        }
        let addr = u16::from_be_bytes([body[0], body[1]]);
        let value = u16::from_be_bytes([body[2], body[3]]);
        if addr as usize >= HOLDING_WORDS {
            return self.exception(0x06, 0x02);
        }
        self.apply_write(addr, value);
        // A single write echoes the request frame byte for byte.
        frame.to_vec()
    }

    fn write_multiple(&mut self, body: &[u8]) -> Vec<u8> {
        if body.len() < 5 {
            return self.exception(0x10, 0x03);
        }
        let addr = u16::from_be_bytes([body[0], body[1]]);
        let count = u16::from_be_bytes([body[2], body[3]]) as usize;
        let byte_count = body[4] as usize;
        let data = &body[5..];
        if byte_count != data.len() || byte_count != count * 2 {
            return self.exception(0x10, 0x03);
        }
        if addr as usize + count > HOLDING_WORDS {
            return self.exception(0x10, 0x02);
        }
        for (i, pair) in data.chunks_exact(2).enumerate() {
            self.holding[addr as usize + i] = u16::from_be_bytes([pair[0], pair[1]]);
        }

        let mut resp = vec![self.unit_id, 0x10];
        resp.extend_from_slice(&addr.to_be_bytes());
        resp.extend_from_slice(&(count as u16).to_be_bytes());
        append_crc(&mut resp);
        resp
    }

    fn report_server_id(&self) -> Vec<u8> {
        let mut resp = vec![self.unit_id, 0x11, 0x02, self.unit_id, 0xFF];
        append_crc(&mut resp);
        resp
    }

    fn identify_info(&self) -> Vec<u8> {
        let mut resp = vec![self.unit_id, 0x41, 0x06];
        resp.extend_from_slice(&self.holding[holding::VENDOR_ID as usize].to_be_bytes());
        resp.extend_from_slice(&self.holding[holding::PRODUCT_ID as usize].to_be_bytes());
        resp.extend_from_slice(&self.holding[holding::CAPABILITIES as usize].to_be_bytes());
        append_crc(&mut resp);
        resp
    }

    fn apply_write(&mut self, addr: u16, value: u16) {
        self.holding[addr as usize] = value;
        if addr == holding::SAVE_COMMAND && value == EEPROM_SAVE_MAGIC {
            self.eeprom_saves += 1;
            let configured = self.holding[holding::UNIT_ID_CONFIG as usize];
            if (1..=247).contains(&configured) {
                self.unit_id = configured as u8;
                self.holding[holding::UNIT_ID_ECHO as usize] = configured;
            }
        }
    }

    fn exception(&self, function: u8, code: u8) -> Vec<u8> {
        let mut resp = vec![self.unit_id, function | 0x80, code];
        append_crc(&mut resp);
        resp
    }
}

/// Simulated line carrying a bank of [`SimSlave`]s.
pub struct SimLink {
    slaves: Arc<Mutex<Vec<SimSlave>>>,
    baud: u32,
    open: Arc<Mutex<bool>>,
    pending: Option<Vec<u8>>,
}

impl SimLink {
    /// Create an empty simulated line at the given baud rate.
    #[must_use]
    pub fn new(baud: u32) -> Self {
        Self {
            slaves: Arc::new(Mutex::new(Vec::new())),
            baud,
            open: Arc::new(Mutex::new(true)),
            pending: None,
        }
    }

    /// Attach a slave to the line.
    pub fn add_slave(&self, slave: SimSlave) {
        self.slaves.lock().expect("sim lock").push(slave);
    }

    /// Shared handle to the slave bank for test mutation.
    #[must_use]
    pub fn slaves(&self) -> Arc<Mutex<Vec<SimSlave>>> {
        Arc::clone(&self.slaves)
    }

    /// Shared handle controlling whether the line is up; set to `false` to
    /// simulate the port disappearing.
    #[must_use]
    pub fn port_switch(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.open)
    }
}

impl Default for SimLink {
    fn default() -> Self {
        Self::new(115_200)
    }
}

#[async_trait]
impl RtuLink for SimLink {
    fn baud(&self) -> u32 {
        self.baud
    }

    fn descriptor(&self) -> String {
        "sim://rs485".into()
    }

    fn is_open(&self) -> bool {
        *self.open.lock().expect("sim lock")
    }

    async fn reopen(&mut self) -> io::Result<()> {
        if *self.open.lock().expect("sim lock") {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "simulated port is down",
            ))
        }
    }

    async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "simulated port is down",
            ));
        }
        let mut slaves = self.slaves.lock().expect("sim lock");
        self.pending = None;
        for slave in slaves.iter_mut() {
            if let Some(resp) = slave.handle(frame) {
                self.pending = Some(resp);
                break;
            }
        }
        Ok(())
    }

    async fn recv_frame(
        &mut self,
        _first_byte_timeout: Duration,
        _max_len: usize,
    ) -> io::Result<Vec<u8>> {
        Ok(self.pending.take().unwrap_or_default())
    }
}
