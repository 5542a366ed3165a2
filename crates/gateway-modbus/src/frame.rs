//! Modbus RTU frame codec.
//!
//! Wire layout: `[unitId:1][function:1][payload:N][crcLo:1][crcHi:1]`.
//! Register values inside payloads are big-endian; only the CRC trailer is
//! little-endian.

use crate::crc::{append_crc, check_crc};
use crate::error::{BusError, BusResult};
use crate::{BROADCAST_UNIT, MAX_UNIT_ID};

/// Function codes the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03).
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04).
    ReadInputRegisters = 0x04,
    /// Write Single Register (0x06).
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10).
    WriteMultipleRegisters = 0x10,
    /// Report Server ID (0x11).
    ReportServerId = 0x11,
    /// Vendor-specific identify + info block (0x41).
    IdentifyInfo = 0x41,
}

impl FunctionCode {
    /// Parse a function byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x06 => Some(Self::WriteSingleRegister),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x11 => Some(Self::ReportServerId),
            0x41 => Some(Self::IdentifyInfo),
            _ => None,
        }
    }
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// Illegal function code.
    IllegalFunction,
    /// Illegal data address.
    IllegalDataAddress,
    /// Illegal data value.
    IllegalDataValue,
    /// Server device failure.
    ServerDeviceFailure,
    /// Acknowledge (request accepted, processing).
    Acknowledge,
    /// Server device busy.
    ServerDeviceBusy,
    /// Code outside the standard table.
    Other(u8),
}

impl ExceptionCode {
    /// Parse an exception code byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            other => Self::Other(other),
        }
    }

    /// The wire representation.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "Illegal Function"),
            Self::IllegalDataAddress => write!(f, "Illegal Data Address"),
            Self::IllegalDataValue => write!(f, "Illegal Data Value"),
            Self::ServerDeviceFailure => write!(f, "Server Device Failure"),
            Self::Acknowledge => write!(f, "Acknowledge"),
            Self::ServerDeviceBusy => write!(f, "Server Device Busy"),
            Self::Other(code) => write!(f, "Exception 0x{code:02X}"),
        }
    }
}

/// Minimum frame on the wire: unit id + function + CRC trailer.
const MIN_FRAME_LEN: usize = 4;

/// Build a complete request frame.
///
/// # Errors
///
/// Rejects unit ids above 247 and broadcast requests for any function
/// other than Write Single Register.
pub fn encode_request(unit_id: u8, function: FunctionCode, payload: &[u8]) -> BusResult<Vec<u8>> {
    if unit_id > MAX_UNIT_ID {
        return Err(BusError::InvalidRequest(format!(
            "unit id {unit_id} out of range 0..=247"
        )));
    }
    if unit_id == BROADCAST_UNIT && function != FunctionCode::WriteSingleRegister {
        return Err(BusError::InvalidRequest(format!(
            "broadcast is only permitted for function {:#04X}",
            FunctionCode::WriteSingleRegister as u8
        )));
    }

    let mut frame = Vec::with_capacity(2 + payload.len() + 2);
    frame.push(unit_id);
    frame.push(function as u8);
    frame.extend_from_slice(payload);
    append_crc(&mut frame);
    Ok(frame)
}

/// Validate a response frame and strip it down to the function payload.
///
/// Checks, in order: minimum length, CRC trailer, unit id echo, exception
/// flag, function echo. Returns the payload bytes after the function byte.
///
/// # Errors
///
/// Returns the matching [`BusError`] kind for each failed check.
pub fn decode_response(
    frame: &[u8],
    expect_unit: u8,
    expect_function: FunctionCode,
) -> BusResult<Vec<u8>> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(BusError::ShortFrame(frame.len()));
    }

    check_crc(frame).map_err(|(expected, actual)| BusError::CrcMismatch { expected, actual })?;

    let unit = frame[0];
    if unit != expect_unit {
        return Err(BusError::AddressMismatch {
            expected: expect_unit,
            actual: unit,
        });
    }

    let function = frame[1];
    let body = &frame[2..frame.len() - 2];

    if function == (expect_function as u8) | 0x80 {
        let code = body.first().copied().unwrap_or(0);
        return Err(BusError::Exception {
            function: expect_function as u8,
            exception: ExceptionCode::from_byte(code),
        });
    }
    if function != expect_function as u8 {
        return Err(BusError::UnexpectedFunction {
            expected: expect_function as u8,
            actual: function,
        });
    }

    Ok(body.to_vec())
}

/// Payload for a register read: start address and count, big-endian.
#[must_use]
pub fn read_registers_payload(address: u16, count: u16) -> [u8; 4] {
    let a = address.to_be_bytes();
    let c = count.to_be_bytes();
    [a[0], a[1], c[0], c[1]]
}

/// Payload for a single-register write: address and value, big-endian.
#[must_use]
pub fn write_single_payload(address: u16, value: u16) -> [u8; 4] {
    let a = address.to_be_bytes();
    let v = value.to_be_bytes();
    [a[0], a[1], v[0], v[1]]
}

/// Payload for a multiple-register write: address, quantity, byte count,
/// then the register values big-endian.
#[must_use]
pub fn write_multiple_payload(address: u16, values: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5 + values.len() * 2);
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
    payload.push((values.len() * 2) as u8);
    for value in values {
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload
}

/// Parse a register-read response payload (`[byteCount][data...]`) into
/// register words.
///
/// # Errors
///
/// Returns [`BusError::ShortFrame`] when the byte count disagrees with the
/// payload or the requested quantity.
pub fn parse_read_registers(payload: &[u8], expect_count: u16) -> BusResult<Vec<u16>> {
    if payload.is_empty() {
        return Err(BusError::ShortFrame(0));
    }
    let byte_count = payload[0] as usize;
    let data = &payload[1..];
    if byte_count != data.len() || byte_count != expect_count as usize * 2 {
        return Err(BusError::ShortFrame(payload.len()));
    }

    let mut registers = Vec::with_capacity(expect_count as usize);
    for chunk in data.chunks_exact(2) {
        registers.push(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    Ok(registers)
}

/// Verify the echo payload of a write (single or multiple).
///
/// Single writes echo address+value; multiple writes echo address+quantity.
/// Either way the first four payload bytes must match what we sent.
///
/// # Errors
///
/// Returns [`BusError::ShortFrame`] on a truncated echo and
/// [`BusError::InvalidRequest`] when the echoed fields disagree.
pub fn verify_write_echo(payload: &[u8], address: u16, word: u16) -> BusResult<()> {
    if payload.len() < 4 {
        return Err(BusError::ShortFrame(payload.len()));
    }
    let echo_addr = u16::from_be_bytes([payload[0], payload[1]]);
    let echo_word = u16::from_be_bytes([payload[2], payload[3]]);
    if echo_addr != address || echo_word != word {
        return Err(BusError::InvalidRequest(format!(
            "write echo mismatch: sent {address:#06X}/{word:#06X}, echoed {echo_addr:#06X}/{echo_word:#06X}"
        )));
    }
    Ok(())
}
