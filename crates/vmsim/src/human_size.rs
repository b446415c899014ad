//! Byte counts formatted for log output.

use core::fmt;

/// Formats a byte count with binary prefixes, e.g. `4KiB` or `1.5MiB`.
///
/// Fractions are truncated to one decimal digit and omitted when zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        if self.0 < 1024 {
            return write!(f, "{}B", self.0);
        }

        let mut unit = 0;
        let mut scale = 1024usize;
        while unit + 1 < UNITS.len() && self.0 / scale >= 1024 {
            scale *= 1024;
            unit += 1;
        }

        let whole = self.0 / scale;
        let tenths = (self.0 % scale) as u128 * 10 / scale as u128;
        if tenths == 0 {
            write!(f, "{whole}{}", UNITS[unit])
        } else {
            write!(f, "{whole}.{tenths}{}", UNITS[unit])
        }
    }
}
