//! Register map of the sensor slaves, as published in the device manual.
//!
//! Holding registers carry identity and configuration; input registers
//! carry measurements. All multi-byte fields are big-endian on the wire.

/// Holding register addresses (function 0x03 read, 0x06/0x10 write).
pub mod holding {
    /// Vendor id word.
    pub const VENDOR_ID: u16 = 0x0000;
    /// Product id word.
    pub const PRODUCT_ID: u16 = 0x0001;
    /// Hardware version, `(major << 8) | minor`.
    pub const HW_VERSION: u16 = 0x0002;
    /// Firmware version, `(major << 8) | minor`.
    pub const FW_VERSION: u16 = 0x0003;
    /// Unit id echo.
    pub const UNIT_ID_ECHO: u16 = 0x0004;
    /// Capability bitmask.
    pub const CAPABILITIES: u16 = 0x0005;
    /// Uptime seconds, low word.
    pub const UPTIME_LO: u16 = 0x0006;
    /// Uptime seconds, high word.
    pub const UPTIME_HI: u16 = 0x0007;
    /// Status bitmask.
    pub const STATUS_FLAGS: u16 = 0x0008;
    /// Error bitmask.
    pub const ERROR_FLAGS: u16 = 0x0009;
    /// Baud rate code.
    pub const BAUD_CODE: u16 = 0x0010;
    /// Low-pass filter frequency, Hz.
    pub const FILTER_HZ: u16 = 0x0011;
    /// Save-to-EEPROM command register; write [`super::EEPROM_SAVE_MAGIC`].
    pub const SAVE_COMMAND: u16 = 0x0012;
    /// Identify LED duration in seconds; 0 stops blinking.
    pub const IDENTIFY_SECONDS: u16 = 0x0013;
    /// Unit id configuration (1..=247); takes effect on EEPROM save.
    pub const UNIT_ID_CONFIG: u16 = 0x0014;
    /// First diagnostics counter word.
    pub const DIAG_COUNTERS: u16 = 0x0020;
    /// Number of diagnostics counter words.
    pub const DIAG_COUNTER_WORDS: u16 = 6;
    /// Vendor string length word; 4 packed-ASCII words follow.
    pub const VENDOR_STR_LEN: u16 = 0x0026;
    /// Product string length word; 4 packed-ASCII words follow.
    pub const PRODUCT_STR_LEN: u16 = 0x002B;
    /// Packed-ASCII words per name string.
    pub const NAME_STR_WORDS: u16 = 4;
    /// Alias length word (0..=64).
    pub const ALIAS_LEN: u16 = 0x0030;
    /// First alias data word; 32 packed-ASCII words.
    pub const ALIAS_DATA: u16 = 0x0031;
    /// Number of alias data words.
    pub const ALIAS_DATA_WORDS: u16 = 32;
}

/// Input register addresses (function 0x04).
pub mod input {
    /// Angle X, signed centi-degrees.
    pub const ANGLE_X: u16 = 0x0000;
    /// Angle Y, signed centi-degrees.
    pub const ANGLE_Y: u16 = 0x0001;
    /// Temperature, signed centi-°C.
    pub const TEMPERATURE: u16 = 0x0002;
    /// Acceleration X, signed milli-g.
    pub const ACCEL_X: u16 = 0x0003;
    /// Acceleration Y, signed milli-g.
    pub const ACCEL_Y: u16 = 0x0004;
    /// Acceleration Z, signed milli-g.
    pub const ACCEL_Z: u16 = 0x0005;
    /// Gyro X, signed milli-deg/s.
    pub const GYRO_X: u16 = 0x0006;
    /// Gyro Y, signed milli-deg/s.
    pub const GYRO_Y: u16 = 0x0007;
    /// Gyro Z, signed milli-deg/s.
    pub const GYRO_Z: u16 = 0x0008;
    /// Sample counter, low word.
    pub const SAMPLE_LO: u16 = 0x0009;
    /// Sample counter, high word.
    pub const SAMPLE_HI: u16 = 0x000A;
    /// Quality flag bitmask.
    pub const QUALITY_FLAGS: u16 = 0x000B;
    /// Load, signed centi-kg.
    pub const LOAD: u16 = 0x000C;
    /// Wind speed, unsigned cm/s.
    pub const WIND_SPEED: u16 = 0x000D;
    /// Wind direction, unsigned degrees 0..=359.
    pub const WIND_DIRECTION: u16 = 0x000E;
}

/// Magic word written to [`holding::SAVE_COMMAND`] to commit configuration
/// to slave EEPROM.
pub const EEPROM_SAVE_MAGIC: u16 = 0xA55A;

/// Maximum alias length in bytes.
pub const ALIAS_MAX_BYTES: usize = 64;

/// Words in the identity block read during discovery
/// (vendor id through error flags).
pub const IDENTITY_BLOCK_WORDS: u16 = 10;
