use chrono::{DateTime, SecondsFormat, Utc};
use num_bigint::{BigInt, Sign};
use serde::{Deserialize, Serialize};

use crate::collator::Collator;

/// The sort value attached to a record.
///
/// Text, timestamps and numbers encode into byte strings whose lexicographic
/// order follows the value order, so the driver can serve range scans over
/// raw bytes. Opaque values are stored for equality only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortValue {
    None,
    Text(String),
    Timestamp(DateTime<Utc>),
    Int(i64),
    Float(f64),
    Opaque(Vec<u8>),
}

impl Default for SortValue {
    fn default() -> Self {
        SortValue::None
    }
}

impl From<&str> for SortValue {
    fn from(v: &str) -> Self {
        SortValue::Text(v.to_string())
    }
}

impl From<i64> for SortValue {
    fn from(v: i64) -> Self {
        SortValue::Int(v)
    }
}

impl From<f64> for SortValue {
    fn from(v: f64) -> Self {
        SortValue::Float(v)
    }
}

impl From<DateTime<Utc>> for SortValue {
    fn from(v: DateTime<Utc>) -> Self {
        SortValue::Timestamp(v)
    }
}

/// Encodes a sort value as the byte string handed to the driver's secondary
/// index. `max_len` is the driver's sorter limit; numeric encodings fill it
/// exactly, text keys are capped to it. An empty result means "no index
/// entry". Never fails: unencodable values degrade to an empty byte string.
pub fn sorter_bytes(value: &SortValue, collator: &Collator, max_len: usize) -> Vec<u8> {
    match value {
        SortValue::None => Vec::new(),
        SortValue::Text(s) => {
            let mut key = collator.collation_key(s);
            key.truncate(max_len);
            key
        }
        SortValue::Timestamp(ts) => {
            // fixed-width UTC form: "2018-01-01T00:00:00.000Z"; constant
            // width keeps byte order equal to time order across precisions
            let mut bytes = ts
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .into_bytes();
            bytes.truncate(max_len);
            bytes
        }
        SortValue::Int(n) => encode_number(&n.to_string(), max_len),
        SortValue::Float(n) => {
            if n.is_nan() {
                encode_number("0", max_len)
            } else if n.is_infinite() {
                encode_saturated(n.is_sign_positive(), max_len)
            } else {
                encode_number(&n.to_string(), max_len)
            }
        }
        SortValue::Opaque(bytes) => bytes.clone(),
    }
}

/// The saturation bound: a positive integer of `max_len - 1` bytes reading
/// `7F FF .. FF`. Keeping it one byte shorter than the target width means the
/// `+BIG` bias can never overflow `max_len` bytes.
fn big_bound(max_len: usize) -> BigInt {
    let mut bytes = vec![0xFFu8; max_len - 1];
    bytes[0] = 0x7F;
    BigInt::from_bytes_be(Sign::Plus, &bytes)
}

/// Maps a decimal number onto a non-negative integer of exactly `max_len`
/// bytes such that byte order equals numeric order:
///
/// 1. scale by half the decimal digits of the bound, truncating the rest of
///    the fraction (the lower half of the range carries fractional precision)
/// 2. clamp to `[-BIG, BIG]`
/// 3. bias by `+BIG` into `[0, 2*BIG]`
/// 4. right-align the big-endian bytes in a zeroed buffer
fn encode_number(decimal: &str, max_len: usize) -> Vec<u8> {
    if max_len < 2 {
        return Vec::new();
    }
    let big = big_bound(max_len);
    let shift = big.to_string().len() / 2;

    let mut scaled = shift_point_right(decimal, shift);
    if scaled > big {
        scaled = big.clone();
    } else if scaled < -big.clone() {
        scaled = -big.clone();
    }

    align_right(scaled + big, max_len)
}

fn encode_saturated(positive: bool, max_len: usize) -> Vec<u8> {
    if max_len < 2 {
        return Vec::new();
    }
    let big = big_bound(max_len);
    let v = if positive { big.clone() } else { -big.clone() };
    align_right(v + big, max_len)
}

fn align_right(biased: BigInt, max_len: usize) -> Vec<u8> {
    let (_, bytes) = biased.to_bytes_be();
    let mut out = vec![0u8; max_len];
    let offset = max_len - bytes.len();
    out[offset..].copy_from_slice(&bytes);
    out
}

/// Moves the decimal point of `decimal` right by `shift` places and truncates
/// toward zero. `decimal` is the `Display` form of an i64 or finite f64, i.e.
/// `-?digits(.digits)?`.
fn shift_point_right(decimal: &str, shift: usize) -> BigInt {
    let (negative, unsigned) = match decimal.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, decimal),
    };
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };

    let mut digits = String::with_capacity(int_part.len() + shift);
    digits.push_str(int_part);
    if frac_part.len() >= shift {
        digits.push_str(&frac_part[..shift]);
    } else {
        digits.push_str(frac_part);
        for _ in 0..shift - frac_part.len() {
            digits.push('0');
        }
    }

    let magnitude = BigInt::parse_bytes(digits.as_bytes(), 10).unwrap_or_default();
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const L: usize = 8;

    fn enc(v: impl Into<SortValue>) -> Vec<u8> {
        sorter_bytes(&v.into(), &Collator::default(), L)
    }

    #[test]
    fn test_none_has_no_index_entry() {
        assert!(sorter_bytes(&SortValue::None, &Collator::default(), L).is_empty());
    }

    #[test]
    fn test_zero_is_the_right_aligned_bound() {
        // BIG for L=8 is seven bytes 7F FF FF FF FF FF FF; zero encodes as
        // 0 + BIG right-aligned in eight bytes
        let expected = vec![0x00, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(enc(0i64), expected);
        assert_eq!(enc(0.0f64), expected);
    }

    #[test]
    fn test_numeric_order_around_zero() {
        assert!(enc(1i64) > enc(0i64));
        assert!(enc(-1i64) < enc(0i64));
        assert!(enc(0.5f64) > enc(0i64));
        assert!(enc(0.5f64) < enc(1i64));
    }

    #[test]
    fn test_numeric_monotonicity() {
        let values: [f64; 7] = [-1000.0, -1.5, -1.0, 0.0, 0.5, 1.0, 1000.0];
        let encoded: Vec<_> = values.iter().map(|v| enc(*v)).collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for bytes in &encoded {
            assert_eq!(bytes.len(), L);
        }
    }

    #[test]
    fn test_huge_values_clamp_to_the_bound() {
        // 2 * BIG = FF FF FF FF FF FF FE, right-aligned
        let top = vec![0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE];
        assert_eq!(enc(i64::MAX), top);
        assert_eq!(enc(1e300f64), top);
        assert_eq!(enc(f64::INFINITY), top);

        let bottom = vec![0x00; L];
        assert_eq!(enc(i64::MIN), bottom);
        assert_eq!(enc(f64::NEG_INFINITY), bottom);
    }

    #[test]
    fn test_nan_degrades_to_zero() {
        assert_eq!(enc(f64::NAN), enc(0i64));
    }

    #[test]
    fn test_integers_and_floats_agree() {
        assert_eq!(enc(42i64), enc(42.0f64));
    }

    #[test]
    fn test_timestamp_order_and_width() {
        let a = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 1).unwrap();
        let c = Utc.with_ymd_and_hms(2019, 6, 30, 12, 0, 0).unwrap();
        let big_len = 64;
        let ka = sorter_bytes(&a.into(), &Collator::default(), big_len);
        let kb = sorter_bytes(&b.into(), &Collator::default(), big_len);
        let kc = sorter_bytes(&c.into(), &Collator::default(), big_len);
        assert!(ka < kb);
        assert!(kb < kc);
        // fixed textual width regardless of sub-second precision
        assert_eq!(ka.len(), kb.len());
    }

    #[test]
    fn test_text_key_is_capped_to_the_limit() {
        let long = "a long piece of text that would overflow any sorter column";
        let key = sorter_bytes(&long.into(), &Collator::default(), L);
        assert_eq!(key.len(), L);
    }

    #[test]
    fn test_opaque_is_pass_through() {
        let bytes = vec![9, 8, 7];
        assert_eq!(
            sorter_bytes(&SortValue::Opaque(bytes.clone()), &Collator::default(), L),
            bytes
        );
    }

    #[test]
    fn test_fraction_truncates_toward_zero() {
        // with L=8 the shift is 8 decimal places; digits beyond it vanish
        assert_eq!(enc(0.000000001f64), enc(0i64));
        assert_eq!(enc(-0.000000001f64), enc(0i64));
    }
}
