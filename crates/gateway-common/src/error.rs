use thiserror::Error;

/// Gateway error types covering configuration, command validation, and
/// subsystem failures surfaced across crate boundaries.
///
/// Wire-level Modbus errors are typed separately in the bus crate; they are
/// stringified into [`GatewayError::Bus`] when they cross into the command
/// and API layers.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operator input failed validation; no side effects were applied.
    #[error("validation error: {0}")]
    Validation(String),

    /// Modbus transaction failure surfaced to a caller.
    #[error("bus error: {0}")]
    Bus(String),

    /// Local database failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Referenced device is not in the cache.
    #[error("device {0} not found")]
    DeviceNotFound(u8),

    /// Referenced alert row does not exist.
    #[error("alert {0} not found")]
    AlertNotFound(i64),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Convenience type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
