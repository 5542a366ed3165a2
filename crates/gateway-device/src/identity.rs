//! Identity block decoding and packed-ASCII handling.
//!
//! Name strings and the alias travel as a length word followed by ASCII
//! bytes packed two per register, most significant byte first. Reads clamp
//! to the stored length and drop non-printable bytes; writes validate
//! printable ASCII up front.

use gateway_common::error::{GatewayError, GatewayResult};
use gateway_common::types::{Capabilities, Device};
use gateway_modbus::registers::ALIAS_MAX_BYTES;

/// Decoded identity block (holding registers 0x0000..=0x0009).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityBlock {
    /// Vendor id word.
    pub vendor_code: u16,
    /// Product id word.
    pub product_code: u16,
    /// Hardware version word.
    pub hw_version: u16,
    /// Firmware version word.
    pub fw_version: u16,
    /// Unit id echoed by the slave.
    pub unit_id_echo: u16,
    /// Capability bitmask.
    pub capabilities: Capabilities,
    /// Uptime seconds, assembled from the lo/hi words.
    pub uptime_secs: u32,
    /// Status bitmask.
    pub status_flags: u16,
    /// Error bitmask.
    pub error_flags: u16,
}

/// Decode the identity block.
///
/// # Errors
///
/// Returns a validation error when fewer than ten words are supplied.
pub fn decode_identity(words: &[u16]) -> GatewayResult<IdentityBlock> {
    if words.len() < 10 {
        return Err(GatewayError::Bus(format!(
            "identity block truncated: {} of 10 words",
            words.len()
        )));
    }
    Ok(IdentityBlock {
        vendor_code: words[0],
        product_code: words[1],
        hw_version: words[2],
        fw_version: words[3],
        unit_id_echo: words[4],
        capabilities: Capabilities(words[5]),
        uptime_secs: u32::from(words[6]) | (u32::from(words[7]) << 16),
        status_flags: words[8],
        error_flags: words[9],
    })
}

/// Apply a decoded identity block to a device record.
pub fn apply_identity(device: &mut Device, block: &IdentityBlock) {
    device.vendor_code = block.vendor_code;
    device.product_code = block.product_code;
    device.hw_version = block.hw_version;
    device.fw_version = block.fw_version;
    device.capabilities = block.capabilities;
    device.uptime_secs = block.uptime_secs;
    device.status_flags = block.status_flags;
    device.error_flags = block.error_flags;
}

/// Unpack ASCII bytes from registers (two bytes per word, MSB first),
/// clamped to `len` bytes, dropping non-printable bytes.
#[must_use]
pub fn unpack_ascii(words: &[u16], len: usize) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        bytes.push((word >> 8) as u8);
        bytes.push((word & 0xFF) as u8);
    }
    bytes.truncate(len.min(bytes.len()));
    bytes
        .into_iter()
        .filter(|b| (0x20..=0x7E).contains(b))
        .map(char::from)
        .collect()
}

/// Pack an ASCII string into registers, two bytes per word, MSB first,
/// zero-padding the final word when the length is odd.
#[must_use]
pub fn pack_ascii(s: &str) -> Vec<u16> {
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = u16::from(pair[0]) << 8;
            let lo = pair.get(1).map_or(0, |&b| u16::from(b));
            hi | lo
        })
        .collect()
}

/// Validate an alias for writing: at most 64 bytes of printable ASCII.
///
/// # Errors
///
/// Returns a validation error naming the violated rule.
pub fn validate_alias(alias: &str) -> GatewayResult<()> {
    if alias.len() > ALIAS_MAX_BYTES {
        return Err(GatewayError::Validation(format!(
            "alias is {} bytes, maximum is {ALIAS_MAX_BYTES}",
            alias.len()
        )));
    }
    if let Some(bad) = alias.bytes().find(|b| !(0x20..=0x7E).contains(b)) {
        return Err(GatewayError::Validation(format!(
            "alias contains non-printable byte 0x{bad:02X}"
        )));
    }
    Ok(())
}

/// Build the write-multiple block for an alias: the length word followed
/// by the packed ASCII words. Written starting at the alias-length
/// register.
#[must_use]
pub fn alias_write_block(alias: &str) -> Vec<u16> {
    let mut block = Vec::with_capacity(1 + alias.len().div_ceil(2));
    block.push(alias.len() as u16);
    block.extend(pack_ascii(alias));
    block
}
