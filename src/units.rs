// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Number parsing and human-readable amount formatting.
//!
//! Sizes accept an optional K/M/G/T suffix, interpreted as multiples of
//! 1024 or, when `decimal_units` is set, 1000.  Intervals accept either
//! `.` or `,` as the decimal mark so they parse the same way regardless of
//! the operator's locale.

/// What kind of quantity a count refers to, which decides both the divisor
/// and the suffix style used when rendering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCount {
    /// Bytes, rendered with binary prefixes ("KiB", "MiB", ...).
    Bytes,
    /// Bytes, rendered with decimal prefixes ("kB", "MB", ...).
    DecimalBytes,
    /// Lines (or other plain counts), always decimal.
    Lines,
}

/// Parse a size expression such as "100", "1.5G" or "2,5 k".
///
/// Leading non-digit characters are skipped; a fractional part is honoured
/// to four decimal places; the suffix multiplies by powers of 1024 (or
/// 1000 with `decimal_units`).
pub fn parse_size(input: &str, decimal_units: bool) -> u64 {
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() && !bytes[pos].is_ascii_digit() {
        pos += 1;
    }

    let mut integral: u64 = 0;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        integral = integral.wrapping_mul(10).wrapping_add(u64::from(bytes[pos] - b'0'));
        pos += 1;
    }

    let mut fractional: u64 = 0;
    let mut fractional_divisor: u64 = 1;
    if pos < bytes.len() && (bytes[pos] == b'.' || bytes[pos] == b',') {
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            // Stop counting below 0.0001.
            if fractional_divisor < 10_000 {
                fractional = fractional * 10 + u64::from(bytes[pos] - b'0');
                fractional_divisor *= 10;
            }
            pos += 1;
        }
    }

    while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
        pos += 1;
    }

    let (binary_shift, decimal_multiplier): (u32, u64) = match bytes.get(pos) {
        Some(b'k') | Some(b'K') => (10, 1_000),
        Some(b'm') | Some(b'M') => (20, 1_000_000),
        Some(b'g') | Some(b'G') => (30, 1_000_000_000),
        Some(b't') | Some(b'T') => (40, 1_000_000_000_000),
        _ => (0, 1),
    };

    if decimal_units {
        integral = integral.saturating_mul(decimal_multiplier);
        fractional = fractional.saturating_mul(decimal_multiplier);
    } else {
        integral = integral.checked_shl(binary_shift).unwrap_or(u64::MAX);
        fractional = fractional.checked_shl(binary_shift).unwrap_or(u64::MAX);
    }

    integral.saturating_add(fractional / fractional_divisor)
}

/// Parse a time interval in seconds, accepting `.` or `,` as the decimal
/// mark.  Non-digit leading characters are skipped.
pub fn parse_interval(input: &str) -> f64 {
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() && !bytes[pos].is_ascii_digit() {
        pos += 1;
    }

    let mut result = 0.0;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        result = result * 10.0 + f64::from(bytes[pos] - b'0');
        pos += 1;
    }

    if pos >= bytes.len() || (bytes[pos] != b'.' && bytes[pos] != b',') {
        return result;
    }
    pos += 1;

    let mut step = 1.0;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() && step < 1_000_000.0 {
        step *= 10.0;
        result += f64::from(bytes[pos] - b'0') / step;
        pos += 1;
    }

    result
}

/// Clamp `value` to `[min, max]`.
pub fn bound(value: i64, min: i64, max: i64) -> i64 {
    value.clamp(min, max)
}

/// `100 * amount / total`, or 0 when the total is unknown.
pub fn percentage(amount: i64, total: i64) -> f64 {
    if total < 1 {
        return 0.0;
    }
    (amount as f64) * 100.0 / (total as f64)
}

/// Estimated seconds until completion given the current position, the
/// total, and the average rate.
pub fn seconds_remaining(so_far: i64, total: i64, rate: f64) -> i64 {
    if so_far < 1 || rate < 0.001 {
        return 0;
    }
    ((total - so_far) as f64 / rate) as i64
}

const PREFIXES_1000: &[u8] = b"yzafpnum kMGTPEZY";
const PREFIXES_1024: &[u8] = b"yzafpnum KMGTPEZY";

/// Scale `value` into the range 1.0..ratio and return the matching SI
/// prefix.  For byte counts the prefix carries the IEEE1541 "i" ("KiB"),
/// so a bare byte amount gets two spaces to keep columns aligned.
pub fn si_prefix(value: &mut f64, ratio: f64, count_type: TransferCount) -> String {
    let prefixes = if count_type == TransferCount::Bytes {
        PREFIXES_1024
    } else {
        PREFIXES_1000
    };
    let middle = prefixes
        .iter()
        .position(|&c| c == b' ')
        .unwrap_or(prefixes.len() / 2);

    let mut prefix = b' ';

    // Force an empty prefix if the value is almost zero, to avoid "0yB".
    if *value > -0.000_000_01 && *value < 0.000_000_01 {
        return match count_type {
            TransferCount::Bytes => "  ".to_string(),
            _ => " ".to_string(),
        };
    }

    // Cut-off for moving to the next prefix - a little less than the ratio
    // (970 for ratio=1000, 993 for ratio=1024).
    let cutoff = ratio * 0.97;
    let mut index = middle;

    if *value > 0.0 {
        while *value > cutoff && index + 1 < prefixes.len() {
            index += 1;
            *value /= ratio;
            prefix = prefixes[index];
        }
        while *value < 1.0 && index > 0 {
            index -= 1;
            *value *= ratio;
            prefix = prefixes[index];
        }
    } else {
        while *value < -cutoff && index + 1 < prefixes.len() {
            index += 1;
            *value /= ratio;
            prefix = prefixes[index];
        }
        while *value > -1.0 && index > 0 {
            index -= 1;
            *value *= ratio;
            prefix = prefixes[index];
        }
    }

    let mut out = String::new();
    out.push(prefix as char);
    if count_type == TransferCount::Bytes {
        out.push(if prefix == b' ' { ' ' } else { 'i' });
    }
    out
}

/// Render `amount` as 3-4 digits, an SI prefix, and a suffix, then splice
/// the result into `template` at its `{}` marker.  `suffix_basic` is used
/// for plain counts, `suffix_bytes` for byte counts.
pub fn describe_amount(
    template: &str,
    amount: f64,
    suffix_basic: &str,
    suffix_bytes: &str,
    count_type: TransferCount,
) -> String {
    let (suffix, divider) = match count_type {
        TransferCount::Bytes => (suffix_bytes, 1024.0),
        TransferCount::DecimalBytes => (suffix_bytes, 1000.0),
        TransferCount::Lines => (suffix_basic, 1000.0),
    };

    let mut display_amount = amount;
    let prefix = si_prefix(&mut display_amount, divider, count_type);

    display_amount = display_amount.clamp(-100_000.0, 100_000.0);

    // Three significant figures; above 99.9 the fraction is dropped so
    // "1.01e+03" can never appear in place of "1010".
    let magnitude = display_amount.abs();
    let rendered = if magnitude > 99.9 {
        format!("{:4}{}{}", display_amount as i64, prefix, suffix)
    } else if magnitude >= 10.0 {
        format!("{:4.1}{}{}", display_amount, prefix, suffix)
    } else {
        format!("{:4.2}{}{}", display_amount, prefix, suffix)
    };

    template.replacen("{}", &rendered, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_plain() {
        assert_eq!(parse_size("100", false), 100);
        assert_eq!(parse_size("0", false), 0);
        assert_eq!(parse_size("", false), 0);
    }

    #[test]
    fn parse_size_binary_suffixes() {
        assert_eq!(parse_size("1K", false), 1024);
        assert_eq!(parse_size("1k", false), 1024);
        assert_eq!(parse_size("2M", false), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G", false), 1 << 30);
        assert_eq!(parse_size("1T", false), 1u64 << 40);
    }

    #[test]
    fn parse_size_decimal_suffixes() {
        assert_eq!(parse_size("1K", true), 1000);
        assert_eq!(parse_size("3M", true), 3_000_000);
    }

    #[test]
    fn parse_size_fractional() {
        assert_eq!(parse_size("1.5K", false), 1024 + 512);
        assert_eq!(parse_size("1,5K", false), 1024 + 512);
        assert_eq!(parse_size("2.5k", true), 2500);
    }

    #[test]
    fn parse_size_spaces_before_suffix() {
        assert_eq!(parse_size("4 K", false), 4096);
    }

    #[test]
    fn parse_interval_marks() {
        assert!((parse_interval("0.1") - 0.1).abs() < 1e-9);
        assert!((parse_interval("0,1") - 0.1).abs() < 1e-9);
        assert!((parse_interval("30") - 30.0).abs() < 1e-9);
    }

    #[test]
    fn percentage_bounds() {
        assert_eq!(percentage(50, 100), 50.0);
        assert_eq!(percentage(10, 0), 0.0);
        assert_eq!(percentage(10, -5), 0.0);
    }

    #[test]
    fn seconds_remaining_guards() {
        assert_eq!(seconds_remaining(0, 100, 10.0), 0);
        assert_eq!(seconds_remaining(50, 100, 0.0), 0);
        assert_eq!(seconds_remaining(50, 100, 10.0), 5);
    }

    #[test]
    fn describe_amount_bytes() {
        let s = describe_amount("{}", 2048.0, "", "B", TransferCount::Bytes);
        assert!(s.contains("KiB"), "got {:?}", s);
        let s = describe_amount("[{}]", 0.0, "/s", "B/s", TransferCount::Bytes);
        assert!(s.starts_with('[') && s.ends_with(']'));
    }

    #[test]
    fn describe_amount_lines() {
        let s = describe_amount("{}", 1500.0, "", "B", TransferCount::Lines);
        assert!(s.contains('k'), "got {:?}", s);
        assert!(!s.contains('i'), "got {:?}", s);
    }

    #[test]
    fn si_prefix_zero_is_blank() {
        let mut v = 0.0;
        let p = si_prefix(&mut v, 1024.0, TransferCount::Bytes);
        assert_eq!(p, "  ");
    }

    #[test]
    fn si_prefix_scales_down() {
        let mut v = 0.5;
        let p = si_prefix(&mut v, 1000.0, TransferCount::Lines);
        assert_eq!(p, "m");
        assert!((v - 500.0).abs() < 1e-6);
    }
}
