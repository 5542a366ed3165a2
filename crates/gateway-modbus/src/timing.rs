//! RTU wire timing derived from the configured baud rate.
//!
//! A character on an 8N1 line is 10 bits. Frames are delimited by at least
//! 3.5 character times of silence; bytes inside a frame arrive within 1.5
//! character times of each other.

use std::time::Duration;

/// Bits per character on an 8N1 line (start + 8 data + stop).
const BITS_PER_CHAR: f64 = 10.0;

/// Settling delay after asserting driver-enable, before the first bit.
pub const DE_SETTLE: Duration = Duration::from_micros(50);

/// Guard added on top of one character time before releasing
/// driver-enable after the last byte is flushed.
pub const DE_RELEASE_GUARD: Duration = Duration::from_micros(100);

/// Duration of one character at the given baud rate.
#[must_use]
pub fn char_time(baud: u32) -> Duration {
    Duration::from_secs_f64(BITS_PER_CHAR / f64::from(baud.max(1)))
}

/// The t1.5 intra-frame silence limit.
#[must_use]
pub fn t1_5(baud: u32) -> Duration {
    Duration::from_secs_f64(1.5 * BITS_PER_CHAR / f64::from(baud.max(1)))
}

/// The t3.5 inter-frame silence that delimits RTU frames.
#[must_use]
pub fn t3_5(baud: u32) -> Duration {
    Duration::from_secs_f64(3.5 * BITS_PER_CHAR / f64::from(baud.max(1)))
}

/// End-of-frame silence window used by the receive loop: t3.5, clamped up
/// to the async timer granularity so short windows at high baud rates do
/// not truncate frames mid-flight.
#[must_use]
pub fn silence_window(baud: u32) -> Duration {
    t3_5(baud).max(Duration::from_millis(1))
}

/// Hold time between the last byte flushed and driver-enable release.
#[must_use]
pub fn tx_release_hold(baud: u32) -> Duration {
    char_time(baud) + DE_RELEASE_GUARD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_t3_5_at_115200() {
        // 3.5 * 10 / 115200 ≈ 304 µs.
        let t = t3_5(115_200);
        assert!(t >= Duration::from_micros(300) && t <= Duration::from_micros(310));
    }

    #[test]
    fn test_t3_5_at_9600() {
        // 3.5 * 10 / 9600 ≈ 3.65 ms.
        let t = t3_5(9_600);
        assert!(t >= Duration::from_micros(3_600) && t <= Duration::from_micros(3_700));
    }

    #[test]
    fn test_silence_window_floor() {
        // High baud rates clamp to timer granularity...
        assert_eq!(silence_window(115_200), Duration::from_millis(1));
        // ...low baud rates keep the computed t3.5.
        assert_eq!(silence_window(9_600), t3_5(9_600));
    }

    #[test]
    fn test_t1_5_below_t3_5() {
        for baud in [9_600, 19_200, 115_200] {
            assert!(t1_5(baud) < t3_5(baud));
        }
    }
}
