//! Response interpretation
//!
//! IC box replies are loose text. Results are derived by substring search or
//! by reading a leading number, so partial or garbled replies fall back to
//! `false` / `0` instead of failing.

use super::RESPONSE_TERMINATOR;

/// Reply text assumed for the hook query when no exchange took place
pub const HOOK_DEFAULT_REPLY: &str = "0";

/// Whether `text` contains a complete response
pub fn is_terminated(text: &str) -> bool {
    text.contains(RESPONSE_TERMINATOR)
}

/// Whether the device accepted a command (`F` anywhere in the reply)
pub fn is_acknowledged(text: &str) -> bool {
    text.contains('F')
}

/// Whether the hook reply reports on-hook (`0` anywhere in the reply)
pub fn is_on_hook(text: &str) -> bool {
    text.contains('0')
}

/// Parse the leading decimal number of `text`.
///
/// Leading whitespace is skipped and anything after the number is ignored,
/// so `"012\r"` and `"12.7 dB\r"` both parse.
pub fn leading_number(text: &str) -> Option<f64> {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }

    let int_end = digits_from(end);
    let mut digit_count = int_end - end;
    end = int_end;

    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        let frac_count = frac_end - (end + 1);
        if digit_count + frac_count > 0 {
            digit_count += frac_count;
            end = frac_end;
        }
    }

    if digit_count == 0 {
        return None;
    }

    if matches!(bytes.get(end), Some(b'e') | Some(b'E')) {
        let mut exp_start = end + 1;
        if matches!(bytes.get(exp_start), Some(b'+') | Some(b'-')) {
            exp_start += 1;
        }
        let exp_end = digits_from(exp_start);
        if exp_end > exp_start {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Round half toward positive infinity (`-2.5` becomes `-2`).
///
/// `value + 0.5` is inexact near one half and above 2^52, so the fraction is
/// compared against the floor instead.
fn round_half_up(value: f64) -> i64 {
    let floor = value.floor();
    let rounded = if value - floor >= 0.5 {
        floor + 1.0
    } else {
        floor
    };
    rounded as i64
}

/// Numeric reply as a rounded integer, `0` when no number is present
pub fn parse_numeric(text: &str) -> i64 {
    leading_number(text).map(round_half_up).unwrap_or(0)
}
