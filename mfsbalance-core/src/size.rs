//! Byte sizes with binary suffixes (`K`, `M`, `G`, `T`).

use crate::error::{MfsError, Result};

const UNITS: [(char, u32); 4] = [('K', 1), ('M', 2), ('G', 3), ('T', 4)];

/// Parse a size such as `16G` or `512` into bytes.
///
/// Suffixes are case-insensitive and multiply by powers of 1024.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || MfsError::InvalidSize(input.to_string());

    let (digits, exponent) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let upper = c.to_ascii_uppercase();
            let (_, exp) = UNITS
                .iter()
                .find(|(unit, _)| *unit == upper)
                .ok_or_else(invalid)?;
            (&trimmed[..trimmed.len() - 1], *exp)
        }
        Some(_) => (trimmed, 0),
        None => return Err(invalid()),
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(1024u64.pow(exponent))
        .ok_or_else(invalid)
}

/// Render bytes in the largest whole binary unit, e.g. `1.5G`.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = None;
    for (suffix, _) in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = Some(suffix);
    }
    match unit {
        Some(suffix) => format!("{:.1}{}", value, suffix),
        None => format!("{}B", bytes),
    }
}
