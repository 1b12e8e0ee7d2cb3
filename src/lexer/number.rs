//! Numeric literal decoding (§4.1 "Numbers").

/// Outcome of attempting to decode a numeric literal's digit run plus
/// optional suffix.
pub struct DecodedNumber {
    /// The literal's value, always stored as a double per §3 "Magic
    /// value" (integers, hex, and binary literals are all folded to
    /// `f64` at this layer; sub-type suffixes are accepted syntactically
    /// but do not change the in-memory representation, matching the
    /// dynamically-typed `number` kind).
    pub value: f64,
    /// Byte length of the literal consumed from the cursor, suffix
    /// included.
    pub len: usize,
    /// False if a suffix was present but unparseable (§4.1 "A trailing
    /// suffix that cannot be parsed yields a lex error").
    pub ok: bool,
}

/// Recognized numeric literal suffixes. These tag a sub-type but, per the
/// dynamically-typed value model (§3), do not change storage: all numbers
/// are `f64`.
const VALID_SUFFIXES: &[&str] = &["u", "l", "ul", "lu", "f"];

/// Decode a numeric literal starting at `bytes[0]`, which must be an ASCII
/// digit or `.`. Supports decimal integer/float, `0x`-prefixed hex, and
/// `0b`-prefixed binary forms, with an optional trailing suffix.
pub fn decode_number(bytes: &[u8]) -> DecodedNumber {
    debug_assert!(!bytes.is_empty());

    if bytes.len() >= 2 && bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
        return decode_radix(bytes, 2, 16);
    }
    if bytes.len() >= 2 && bytes[0] == b'0' && (bytes[1] == b'b' || bytes[1] == b'B') {
        return decode_radix(bytes, 2, 2);
    }
    decode_decimal(bytes)
}

fn decode_radix(bytes: &[u8], prefix_len: usize, radix: u32) -> DecodedNumber {
    let mut i = prefix_len;
    while i < bytes.len() && (bytes[i] as char).is_digit(radix) {
        i += 1;
    }
    let digits = &bytes[prefix_len..i];
    let (suffix_ok, suffix_len) = consume_suffix(&bytes[i..]);
    let value = if digits.is_empty() {
        0.0
    } else {
        u64::from_str_radix(std::str::from_utf8(digits).unwrap_or(""), radix)
            .map(|v| v as f64)
            .unwrap_or(f64::NAN)
    };
    DecodedNumber {
        value,
        len: i + suffix_len,
        ok: !digits.is_empty() && suffix_ok && value.is_finite(),
    }
}

fn decode_decimal(bytes: &[u8]) -> DecodedNumber {
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    let digits = &bytes[..i];
    let (suffix_ok, suffix_len) = consume_suffix(&bytes[i..]);
    let value = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(f64::NAN);
    DecodedNumber {
        value,
        len: i + suffix_len,
        ok: suffix_ok && value.is_finite(),
    }
}

/// Consume an optional run of alphabetic suffix letters immediately after
/// the digits, returning whether the suffix (if any) is one of the
/// recognized forms.
fn consume_suffix(rest: &[u8]) -> (bool, usize) {
    let mut len = 0;
    while len < rest.len() && (rest[len] as char).is_ascii_alphabetic() {
        len += 1;
    }
    if len == 0 {
        return (true, 0);
    }
    let text = std::str::from_utf8(&rest[..len]).unwrap_or("");
    let lower = text.to_ascii_lowercase();
    (VALID_SUFFIXES.contains(&lower.as_str()), len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_integer() {
        let d = decode_number(b"42");
        assert_eq!(d.value, 42.0);
        assert_eq!(d.len, 2);
        assert!(d.ok);
    }

    #[test]
    fn decimal_float() {
        let d = decode_number(b"3.14");
        assert_eq!(d.value, 3.14);
        assert!(d.ok);
    }

    #[test]
    fn hex_literal() {
        let d = decode_number(b"0xFF");
        assert_eq!(d.value, 255.0);
        assert!(d.ok);
    }

    #[test]
    fn binary_literal() {
        let d = decode_number(b"0b1010");
        assert_eq!(d.value, 10.0);
        assert!(d.ok);
    }

    #[test]
    fn suffix_tagged() {
        let d = decode_number(b"10u");
        assert_eq!(d.value, 10.0);
        assert_eq!(d.len, 3);
        assert!(d.ok);
    }

    #[test]
    fn bad_suffix_marks_broken() {
        let d = decode_number(b"10zz");
        assert!(!d.ok);
    }
}
