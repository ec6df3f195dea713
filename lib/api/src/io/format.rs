//! Read formats and the textual number grammar.
use std::str::FromStr;

use crate::{Error, Result};

/// Longest numeral `*n` accepts.
const MAX_NUMERAL_LEN: usize = 200;

/// What a single `read` format asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadFormat {
    /// `*l`: the next line, without its terminator
    #[default]
    Line,
    /// `*L`: the next line, terminator included
    LineWithEnding,
    /// `*a`: everything up to the end of the stream
    All,
    /// `*n`: a numeral
    Number,
    /// `N`: up to N bytes
    Bytes(usize),
}

impl FromStr for ReadFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let spec = s.strip_prefix('*').unwrap_or(s);
        match spec.as_bytes().first() {
            Some(b'l') => Ok(ReadFormat::Line),
            Some(b'L') => Ok(ReadFormat::LineWithEnding),
            Some(b'a') => Ok(ReadFormat::All),
            Some(b'n') => Ok(ReadFormat::Number),
            Some(b'0'..=b'9') if !s.starts_with('*') => s
                .parse::<usize>()
                .map(ReadFormat::Bytes)
                .map_err(|_| Error::invalid(format!("invalid format '{s}'"))),
            _ => Err(Error::invalid(format!("invalid format '{s}'"))),
        }
    }
}

impl From<usize> for ReadFormat {
    fn from(count: usize) -> Self {
        ReadFormat::Bytes(count)
    }
}

/// Scans the longest prefix that looks like a numeral, pulling bytes
/// through `peek` one at a time. Returns the length of that prefix; it may
/// still turn out not to be a valid number (e.g. `"1e"`). A numeral longer
/// than [`MAX_NUMERAL_LEN`] yields `None`.
pub(crate) fn scan_numeral(
    mut peek: impl FnMut(usize) -> Result<Option<u8>>,
) -> Result<Option<usize>> {
    let mut len = 0usize;
    let mut overlong = false;

    macro_rules! accept {
        ($pred:expr) => {{
            match peek(len)? {
                Some(byte) if !overlong && $pred(byte) => {
                    if len == MAX_NUMERAL_LEN {
                        overlong = true;
                        false
                    } else {
                        len += 1;
                        true
                    }
                }
                _ => false,
            }
        }};
    }

    let mut digits = 0usize;
    accept!(|b: u8| b == b'-' || b == b'+');
    let mut hex = false;
    if accept!(|b: u8| b == b'0') {
        if accept!(|b: u8| b == b'x' || b == b'X') {
            hex = true;
        } else {
            digits = 1;
        }
    }
    let is_digit = |b: u8| {
        if hex {
            b.is_ascii_hexdigit()
        } else {
            b.is_ascii_digit()
        }
    };
    while accept!(is_digit) {
        digits += 1;
    }
    if accept!(|b: u8| b == b'.') {
        while accept!(is_digit) {
            digits += 1;
        }
    }
    let is_exponent = |b: u8| {
        if hex {
            b == b'p' || b == b'P'
        } else {
            b == b'e' || b == b'E'
        }
    };
    if digits > 0 && accept!(is_exponent) {
        accept!(|b: u8| b == b'-' || b == b'+');
        while accept!(|b: u8| b.is_ascii_digit()) {}
    }
    Ok((!overlong).then_some(len))
}

/// Converts a numeral produced by [`scan_numeral`] into a number.
pub(crate) fn parse_numeral(token: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(token).ok()?;
    let (negative, unsigned) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let magnitude = if let Some(hex) = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        parse_hex(hex)?
    } else {
        // keeps "inf" and "nan" out, which str::parse would accept
        if !unsigned.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
            return None;
        }
        unsigned.parse::<f64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_hex(text: &str) -> Option<f64> {
    let (mantissa, exponent) = match text.find(['p', 'P']) {
        Some(pos) => (&text[..pos], Some(&text[pos + 1..])),
        None => (text, None),
    };
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(pos) => (&mantissa[..pos], &mantissa[pos + 1..]),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut value = 0f64;
    for digit in int_part.chars() {
        value = value * 16.0 + f64::from(digit.to_digit(16)?);
    }
    let mut scale = 1.0 / 16.0;
    for digit in frac_part.chars() {
        value += f64::from(digit.to_digit(16)?) * scale;
        scale /= 16.0;
    }
    if let Some(exponent) = exponent {
        let exponent: i32 = exponent.parse().ok()?;
        value *= 2f64.powi(exponent);
    }
    Some(value)
}

/// Renders a number the way C's `printf("%.14g")` does.
pub fn format_number(value: f64) -> String {
    const PRECISION: i32 = 14;

    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            sign,
            exponent.unsigned_abs()
        )
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scan(text: &str) -> Option<usize> {
        let bytes = text.as_bytes();
        scan_numeral(|i| Ok(bytes.get(i).copied())).unwrap()
    }

    fn read(text: &str) -> Option<f64> {
        let len = scan(text)?;
        parse_numeral(&text.as_bytes()[..len])
    }

    #[test]
    fn parses_formats() {
        assert_eq!("*l".parse::<ReadFormat>().unwrap(), ReadFormat::Line);
        assert_eq!("*L".parse::<ReadFormat>().unwrap(), ReadFormat::LineWithEnding);
        assert_eq!("*a".parse::<ReadFormat>().unwrap(), ReadFormat::All);
        assert_eq!("*n".parse::<ReadFormat>().unwrap(), ReadFormat::Number);
        assert_eq!("a".parse::<ReadFormat>().unwrap(), ReadFormat::All);
        assert_eq!("12".parse::<ReadFormat>().unwrap(), ReadFormat::Bytes(12));
        assert!("*x".parse::<ReadFormat>().is_err());
        assert!("".parse::<ReadFormat>().is_err());
    }

    #[test]
    fn scans_numerals() {
        assert_eq!(scan("42 rest"), Some(2));
        assert_eq!(scan("-3.25e+2x"), Some(8));
        assert_eq!(scan("0x1Fp3 "), Some(6));
        assert_eq!(scan("hello"), Some(0));
        assert_eq!(scan(".5"), Some(2));
    }

    #[test]
    fn overlong_numerals_are_rejected_whole() {
        let longest = "9".repeat(MAX_NUMERAL_LEN);
        assert_eq!(scan(&format!("{longest} ")), Some(MAX_NUMERAL_LEN));
        assert_eq!(scan(&format!("{longest}9 7")), None);
        assert_eq!(read(&format!("0.{}", "1".repeat(MAX_NUMERAL_LEN))), None);
        assert_eq!(read(&format!("1e{}", "0".repeat(MAX_NUMERAL_LEN))), None);
    }

    #[test]
    fn reads_numbers() {
        assert_eq!(read("42"), Some(42.0));
        assert_eq!(read("-3.25e+2"), Some(-325.0));
        assert_eq!(read("+.5"), Some(0.5));
        assert_eq!(read("0x10"), Some(16.0));
        assert_eq!(read("0x1p4"), Some(16.0));
        assert_eq!(read("0x.8"), Some(0.5));
        assert_eq!(read("0"), Some(0.0));
        assert_eq!(read("1e"), None);
        assert_eq!(read("0x"), None);
        assert_eq!(read("-"), None);
        assert_eq!(read("."), None);
        assert_eq!(read("abc"), None);
    }

    #[test]
    fn formats_like_printf_g14() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-42.0), "-42");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(3.14159265358979), "3.1415926535898");
        assert_eq!(format_number(1e20), "1e+20");
        assert_eq!(format_number(1.5e-7), "1.5e-07");
        assert_eq!(format_number(0.0001), "0.0001");
        assert_eq!(format_number(1e15), "1e+15");
        assert_eq!(format_number(99999999999999.5), "1e+14");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(0.0), "0");
    }
}
