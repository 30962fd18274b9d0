//! P1 telegram framing and field extraction
//!
//! A telegram is newline-delimited ASCII where each data line starts with an
//! OBIS code followed by one or more parenthesised values, for example
//! `1-0:1.8.1(000123.456*kWh)`. The telegram ends with `!` and a four digit
//! CRC. Lookups here are plain substring searches; the CRC is not checked.

/// Longest field token handed to the number parser
pub const MAX_FIELD_LEN: usize = 511;

pub const TARIFF1_USED: &str = "1-0:1.8.1";
pub const TARIFF2_USED: &str = "1-0:1.8.2";
pub const TARIFF1_PRODUCED: &str = "1-0:2.8.1";
pub const TARIFF2_PRODUCED: &str = "1-0:2.8.2";
pub const POWER_USED: &str = "1-0:1.7.0";
pub const POWER_PRODUCED: &str = "1-0:2.7.0";
pub const VOLTAGE_L1: &str = "1-0:32.7.0";
pub const GAS: &str = "0-1:24.2.1";

pub const PHASE_POWER_USED: [&str; 3] = ["1-0:21.7.0", "1-0:41.7.0", "1-0:61.7.0"];
pub const PHASE_POWER_PRODUCED: [&str; 3] = ["1-0:22.7.0", "1-0:42.7.0", "1-0:62.7.0"];

/// kWh to Wh, kW to W
pub const KILO: f64 = 1000.0;

/// Whether `data` holds a complete telegram
///
/// The first `!` must be followed by exactly five bytes (CRC and `\r`) and
/// then `\n`.
pub fn frame_complete(data: &[u8]) -> bool {
    let Some(bang) = data.iter().position(|&b| b == b'!') else {
        return false;
    };
    match data[bang..].iter().position(|&b| b == b'\n') {
        Some(distance) => distance == 6,
        None => false,
    }
}

/// Locate `code` and return the rest of its line, code included
pub fn find_field<'a>(telegram: &'a str, code: &str) -> Option<&'a str> {
    if code.is_empty() {
        return None;
    }
    let start = telegram.find(code)?;
    let line = &telegram[start..];
    let line = match line.find('\n') {
        Some(end) => &line[..end],
        None => line,
    };
    Some(truncate(line, MAX_FIELD_LEN))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Parse the number after the first `(` of a field token; 0 when absent
pub fn to_number(token: &str) -> f64 {
    match token.find('(') {
        Some(open) => parse_leading_float(&token[open + 1..]),
        None => 0.0,
    }
}

/// Lenient field value: absent fields read as 0
pub fn field_number(telegram: &str, code: &str) -> f64 {
    find_field(telegram, code).map(to_number).unwrap_or(0.0)
}

/// Strict field value: `None` unless the code exists and a `(` follows it on
/// the same line
pub fn field_value(telegram: &str, code: &str) -> Option<f64> {
    let start = telegram.find(code)?;
    let rest = &telegram[start..];
    let newline = rest.find('\n')?;
    let open = rest.find('(')?;
    if open < newline {
        Some(parse_leading_float(&rest[open + 1..]))
    } else {
        None
    }
}

/// Parse the longest decimal prefix of `s`
///
/// Leading whitespace and a sign are accepted, as is a fraction and an
/// exponent. Anything unparsable yields 0.
pub fn parse_leading_float(s: &str) -> f64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return 0.0;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }
    s[..end].parse().unwrap_or(0.0)
}

/// Gas meter reading
///
/// The gas line carries the reading time as its first group, e.g.
/// `0-1:24.2.1(101209112500W)(12785.123*m3)`, so the value is taken from the
/// group after the first `)`.
pub fn gas_total(telegram: &str) -> f64 {
    let Some(token) = find_field(telegram, GAS) else {
        return 0.0;
    };
    let Some(close) = token.find(')') else {
        return 0.0;
    };
    match token[close..].find('(') {
        Some(open) => parse_leading_float(&token[close + open + 1..]),
        None => 0.0,
    }
}

fn sum(telegram: &str, codes: &[&str]) -> f64 {
    codes.iter().map(|code| field_number(telegram, code)).sum()
}

/// Power currently used over all phases (W)
pub fn phase_consumption(telegram: &str) -> f64 {
    sum(telegram, &PHASE_POWER_USED) * KILO
}

/// Power currently produced over all phases (W)
pub fn phase_production(telegram: &str) -> f64 {
    sum(telegram, &PHASE_POWER_PRODUCED) * KILO
}

/// Net power over all phases, consumption minus production (W)
pub fn phase_net(telegram: &str) -> f64 {
    (sum(telegram, &PHASE_POWER_USED) - sum(telegram, &PHASE_POWER_PRODUCED)) * KILO
}

/// Energy used over both tariffs (Wh)
pub fn total_used(telegram: &str) -> f64 {
    sum(telegram, &[TARIFF1_USED, TARIFF2_USED]) * KILO
}

/// Energy produced over both tariffs (Wh)
pub fn total_produced(telegram: &str) -> f64 {
    sum(telegram, &[TARIFF1_PRODUCED, TARIFF2_PRODUCED]) * KILO
}

/// Energy used minus energy produced (Wh)
pub fn net_total(telegram: &str) -> f64 {
    (sum(telegram, &[TARIFF1_USED, TARIFF2_USED])
        - sum(telegram, &[TARIFF1_PRODUCED, TARIFF2_PRODUCED]))
        * KILO
}

/// Net power reported by the meter itself, consumption minus production (W)
pub fn meter_net_power(telegram: &str) -> f64 {
    (field_number(telegram, POWER_USED) - field_number(telegram, POWER_PRODUCED)) * KILO
}
