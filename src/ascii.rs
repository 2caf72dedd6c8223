pub(crate) const CR: u8 = 13;
pub(crate) const LF: u8 = 10;
pub(crate) const SP: u8 = 32;
pub(crate) const HT: u8 = 9;
pub(crate) const COLON: u8 = 58;
pub(crate) const ZERO: u8 = 48;

pub(crate) const CRLF: &[u8] = &[CR, LF];

/// Parses a decimal number, rejecting anything that is not a digit and values that overflow.
pub(crate) fn atoi(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }

    let mut val: u64 = 0;
    for digit in data {
        if !digit.is_ascii_digit() {
            return None;
        }
        val = val
            .checked_mul(10)?
            .checked_add(u64::from(digit - ZERO))?;
    }

    Some(val)
}

/// RFC 7230 `tchar`, the characters allowed in methods and header field names.
pub(crate) fn is_token(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z')
}

/// Radix for [`AsciiInt`] rendering.
#[derive(Clone, Copy, PartialEq)]
pub(crate) enum Radix {
    Decimal,
    Hex,
}

/// A number rendered into a fixed buffer without allocating.
pub(crate) struct AsciiInt {
    buf: [u8; 20],
    start: usize,
}

impl AsciiInt {
    pub(crate) fn new(value: u64, radix: Radix) -> Self {
        let base = match radix {
            Radix::Decimal => 10,
            Radix::Hex => 16,
        };

        let mut buf = [ZERO; 20];
        let mut start = buf.len();
        let mut int = value;
        loop {
            start -= 1;
            let rem = (int % base) as u8;
            buf[start] = match rem {
                0..=9 => ZERO + rem,
                _ => b'A' + rem - 10,
            };
            int /= base;
            if int == 0 {
                break;
            }
        }

        AsciiInt { buf, start }
    }

    pub(crate) fn hex(value: u64) -> Self {
        Self::new(value, Radix::Hex)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    pub(crate) fn as_str(&self) -> &str {
        // only ASCII digits are ever written into the buffer
        str::from_utf8(self.as_bytes()).unwrap_or_default()
    }
}

impl From<u64> for AsciiInt {
    fn from(value: u64) -> Self {
        Self::new(value, Radix::Decimal)
    }
}

impl From<usize> for AsciiInt {
    fn from(value: usize) -> Self {
        Self::new(value as u64, Radix::Decimal)
    }
}
