use crate::frame::ExceptionCode;
use std::time::Duration;
use thiserror::Error;

/// Transaction errors reported by the bus master.
///
/// Retry policy is the caller's: polling retries a failed read once,
/// discovery skips the candidate, operator commands surface the error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    /// No response byte arrived within the transaction timeout.
    #[error("transaction timed out after {0:?}")]
    Timeout(Duration),

    /// Response CRC trailer did not match the frame body.
    #[error("CRC mismatch: computed {expected:#06X}, received {actual:#06X}")]
    CrcMismatch {
        /// CRC computed over the received body.
        expected: u16,
        /// CRC trailer on the wire.
        actual: u16,
    },

    /// Frame shorter than the minimum RTU envelope.
    #[error("frame too short: {0} bytes")]
    ShortFrame(usize),

    /// Response function byte did not echo the request.
    #[error("unexpected function: sent {expected:#04X}, received {actual:#04X}")]
    UnexpectedFunction {
        /// Function code requested.
        expected: u8,
        /// Function byte in the response.
        actual: u8,
    },

    /// Slave answered with `function | 0x80` and an exception code.
    #[error("modbus exception on function {function:#04X}: {exception}")]
    Exception {
        /// Function code requested.
        function: u8,
        /// Exception code from the slave.
        exception: ExceptionCode,
    },

    /// Response unit id did not match the request.
    #[error("unit id mismatch: sent to {expected}, answered by {actual}")]
    AddressMismatch {
        /// Unit id addressed.
        expected: u8,
        /// Unit id in the response.
        actual: u8,
    },

    /// The serial port is gone; the master retries reopening with backoff.
    #[error("bus closed: {0}")]
    BusClosed(String),

    /// Request rejected before touching the wire.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Convenience alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;
