//! Conversions between raw PLC bytes and typed values.
//!
//! Words use big-endian byte order, bits are numbered LSB first inside each
//! byte, strings follow the S7 `STRING`/`WSTRING` layouts and date-times the
//! packed BCD `DATE_AND_TIME` layout.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::errors::{Error, Result};

/// Capacity assumed for a string whose declared maximum length is 0
pub const DEFAULT_STRING_CAPACITY: usize = 254;

/// Size of a `DATE_AND_TIME` value
pub const DATE_TIME_LEN: usize = 8;

/// Fixed size values stored big-endian in PLC memory
pub trait WordValue: Copy + Send + Sync + 'static {
    /// Number of bytes of one value
    const SIZE: usize;

    /// Decode from exactly `SIZE` bytes
    fn from_be_slice(bytes: &[u8]) -> Self;

    /// Append the big-endian representation
    fn put_be(self, out: &mut Vec<u8>);
}

macro_rules! word_value {
    ($($t:ty),*) => {
        $(
            impl WordValue for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn from_be_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0_u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_be_bytes(raw)
                }

                fn put_be(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_be_bytes());
                }
            }
        )*
    };
}

word_value!(u8, i8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Decode the first value of `bytes`
/// # Errors
///
/// Will return `Error::InvalidValue` if fewer than `T::SIZE` bytes are given.
pub fn decode_word<T: WordValue>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < T::SIZE {
        return Err(Error::InvalidValue(format!(
            "{} bytes needed, {} available",
            T::SIZE,
            bytes.len()
        )));
    }
    Ok(T::from_be_slice(bytes))
}

/// Decode a concatenated array of values
/// # Errors
///
/// Will return `Error::InvalidValue` if the length is not a multiple of `T::SIZE`.
pub fn decode_words<T: WordValue>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.len() % T::SIZE != 0 {
        return Err(Error::InvalidValue(format!(
            "{} bytes are not a multiple of {}",
            bytes.len(),
            T::SIZE
        )));
    }
    Ok(bytes.chunks_exact(T::SIZE).map(T::from_be_slice).collect())
}

/// Encode values by concatenating their big-endian representations
pub fn encode_words<T: WordValue>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    for value in values {
        value.put_be(&mut out);
    }
    out
}

/// Value of bit `index` counted from the LSB of the first byte
pub fn get_bit(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
}

/// Extract `count` bits starting at bit `offset`
pub fn bytes_to_bools(bytes: &[u8], offset: usize, count: usize) -> Vec<bool> {
    (offset..offset + count).map(|i| get_bit(bytes, i)).collect()
}

/// Overlay `values` onto `bytes` starting at bit `offset`, leaving all other bits untouched
pub fn overlay_bools(bytes: &mut [u8], offset: usize, values: &[bool]) {
    for (i, value) in values.iter().enumerate() {
        let index = offset + i;
        if let Some(byte) = bytes.get_mut(index / 8) {
            let mask = 1 << (index % 8);
            if *value {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
    }
}

/// Byte aligned region covering `count` bits from bit address `start_bit`.
///
/// Returns `(first byte, number of bytes, bit offset inside the first byte)`.
pub fn bit_window(start_bit: u32, count: usize) -> (u32, usize, usize) {
    let offset = (start_bit % 8) as usize;
    (start_bit / 8, (offset + count).div_ceil(8), offset)
}

fn capacity(declared: usize) -> usize {
    if declared == 0 {
        DEFAULT_STRING_CAPACITY
    } else {
        declared
    }
}

/// Encode an S7 `STRING`: `[max][current][latin-1 payload]`.
///
/// A declared maximum of 0 is treated as 254.
/// # Errors
///
/// Will return `Error::StringTooLong` if the value does not fit and
/// `Error::InvalidValue` for characters outside latin-1.
pub fn encode_string(value: &str, max_len: u8) -> Result<Vec<u8>> {
    let max = capacity(usize::from(max_len));
    let payload = value
        .chars()
        .map(|c| {
            u8::try_from(u32::from(c))
                .map_err(|_| Error::InvalidValue(format!("'{c}' cannot be stored in an S7 string")))
        })
        .collect::<Result<Vec<u8>>>()?;
    if payload.len() > max {
        return Err(Error::StringTooLong {
            length: payload.len(),
            max,
        });
    }

    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(max as u8);
    out.push(payload.len() as u8);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode an S7 `STRING`, the current length is clamped to the available bytes
/// # Errors
///
/// Will return `Error::InvalidValue` if the two byte header is missing.
pub fn decode_string(bytes: &[u8]) -> Result<String> {
    let [_, current, payload @ ..] = bytes else {
        return Err(Error::InvalidValue("S7 string header missing".to_string()));
    };
    let len = usize::from(*current).min(payload.len());
    Ok(payload[..len].iter().map(|b| char::from(*b)).collect())
}

/// Encode an S7 `WSTRING`: `[max:2][current:2][UTF-16 big-endian payload]`
/// # Errors
///
/// Will return `Error::StringTooLong` if the value does not fit.
pub fn encode_wstring(value: &str, max_len: u16) -> Result<Vec<u8>> {
    let max = capacity(usize::from(max_len));
    let units: Vec<u16> = value.encode_utf16().collect();
    if units.len() > max {
        return Err(Error::StringTooLong {
            length: units.len(),
            max,
        });
    }

    let mut out = Vec::with_capacity(units.len() * 2 + 4);
    out.extend_from_slice(&(max as u16).to_be_bytes());
    out.extend_from_slice(&(units.len() as u16).to_be_bytes());
    out.extend_from_slice(&encode_words(&units));
    Ok(out)
}

/// Decode an S7 `WSTRING`
/// # Errors
///
/// Will return `Error::InvalidValue` if the header is missing or the payload is not valid UTF-16.
pub fn decode_wstring(bytes: &[u8]) -> Result<String> {
    if bytes.len() < 4 {
        return Err(Error::InvalidValue("S7 wstring header missing".to_string()));
    }
    let current = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
    let available = (bytes.len() - 4) / 2;
    let units = decode_words::<u16>(&bytes[4..4 + current.min(available) * 2])?;
    String::from_utf16(&units).map_err(|e| Error::InvalidValue(e.to_string()))
}

fn to_bcd(value: u32) -> u8 {
    (((value / 10) << 4) | (value % 10)) as u8
}

fn from_bcd(byte: u8) -> Result<u32> {
    let (high, low) = (byte >> 4, byte & 0x0F);
    if high > 9 || low > 9 {
        return Err(Error::InvalidValue(format!("0x{byte:02X} is not a BCD value")));
    }
    Ok(u32::from(high) * 10 + u32::from(low))
}

/// Encode a `DATE_AND_TIME` value (years 1990 to 2089, millisecond precision)
/// # Errors
///
/// Will return `Error::InvalidValue` if the year cannot be represented.
pub fn encode_datetime(value: &NaiveDateTime) -> Result<[u8; DATE_TIME_LEN]> {
    let year = value.year();
    if !(1990..=2089).contains(&year) {
        return Err(Error::InvalidValue(format!(
            "year {year} is outside 1990..2089"
        )));
    }
    let millis = value.nanosecond() / 1_000_000 % 1000;
    Ok([
        to_bcd(year as u32 % 100),
        to_bcd(value.month()),
        to_bcd(value.day()),
        to_bcd(value.hour()),
        to_bcd(value.minute()),
        to_bcd(value.second()),
        to_bcd(millis / 10),
        ((millis % 10) << 4) as u8 | value.weekday().number_from_sunday() as u8,
    ])
}

/// Decode a `DATE_AND_TIME` value
/// # Errors
///
/// Will return `Error::InvalidValue` for short input, invalid BCD digits or impossible dates.
pub fn decode_datetime(bytes: &[u8]) -> Result<NaiveDateTime> {
    let Some(raw) = bytes.get(..DATE_TIME_LEN) else {
        return Err(Error::InvalidValue(format!(
            "date and time needs {DATE_TIME_LEN} bytes"
        )));
    };
    let year = from_bcd(raw[0])?;
    let year = if year >= 90 { 1900 + year } else { 2000 + year };
    let millis_low = u32::from(raw[7] >> 4);
    if millis_low > 9 {
        return Err(Error::InvalidValue("invalid millisecond digit".to_string()));
    }
    let millis = from_bcd(raw[6])? * 10 + millis_low;

    NaiveDate::from_ymd_opt(year as i32, from_bcd(raw[1])?, from_bcd(raw[2])?)
        .and_then(|date| {
            date.and_hms_milli_opt(
                from_bcd(raw[3]).ok()?,
                from_bcd(raw[4]).ok()?,
                from_bcd(raw[5]).ok()?,
                millis,
            )
        })
        .ok_or_else(|| Error::InvalidValue(format!("{} is not a valid date", hex::encode(raw))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_big_endian() {
        assert_eq!(encode_words(&[0x1234_u16]), vec![0x12, 0x34]);
        assert_eq!(encode_words(&[-2_i16]), vec![0xFF, 0xFE]);
        assert_eq!(decode_word::<u32>(&[0, 0, 1, 0]).unwrap(), 256);
        assert!(decode_word::<u32>(&[0, 0, 1]).is_err());
        assert!(decode_words::<i16>(&[0, 0, 1]).is_err());
    }

    #[test]
    fn word_round_trips() {
        let ints = [i32::MIN, -1, 0, 1, i32::MAX];
        assert_eq!(decode_words::<i32>(&encode_words(&ints)).unwrap(), ints);

        let floats = [0.0_f32, -1.5, 3.25e6, f32::MAX];
        assert_eq!(decode_words::<f32>(&encode_words(&floats)).unwrap(), floats);

        let doubles = [std::f64::consts::PI, -0.125];
        assert_eq!(decode_words::<f64>(&encode_words(&doubles)).unwrap(), doubles);

        let longs = [u64::MAX, 42];
        assert_eq!(decode_words::<u64>(&encode_words(&longs)).unwrap(), longs);
        assert_eq!(decode_word::<i64>(&encode_words(&[-7_i64])).unwrap(), -7);
    }

    #[test]
    fn bits_round_trip() {
        let values = [true, false, true, true, false, false, true, false, true, true];
        let (_, byte_len, offset) = bit_window(3, values.len());
        assert_eq!((byte_len, offset), (2, 3));

        let mut bytes = vec![0b1000_0101, 0b1111_0000];
        overlay_bools(&mut bytes, offset, &values);
        assert_eq!(bytes_to_bools(&bytes, offset, values.len()), values);
        // bits outside the window are kept
        assert!(get_bit(&bytes, 0));
        assert!(!get_bit(&bytes, 1));
        assert!(get_bit(&bytes, 2));
        assert!(get_bit(&bytes, 13));
    }

    #[test]
    fn bit_window_spans_bytes() {
        assert_eq!(bit_window(800, 1), (100, 1, 0));
        assert_eq!(bit_window(807, 2), (100, 2, 7));
        assert_eq!(bit_window(803, 16), (100, 3, 3));
    }

    #[test]
    fn s7_string_round_trip() {
        let encoded = encode_string("Hällo", 10).unwrap();
        assert_eq!(&encoded[..2], &[10, 5]);
        assert_eq!(decode_string(&encoded).unwrap(), "Hällo");

        let encoded = encode_string("abc", 0).unwrap();
        assert_eq!(encoded[0], 254);
    }

    #[test]
    fn s7_string_bounds() {
        assert_eq!(
            encode_string("0123456789", 5),
            Err(Error::StringTooLong { length: 10, max: 5 })
        );
        assert!(matches!(encode_string("€", 5), Err(Error::InvalidValue(_))));
        // current length larger than the buffer is clamped
        assert_eq!(decode_string(&[10, 9, b'a', b'b']).unwrap(), "ab");
        assert!(decode_string(&[10]).is_err());
    }

    #[test]
    fn wstring_round_trip() {
        let encoded = encode_wstring("Grüße €", 20).unwrap();
        assert_eq!(&encoded[..4], &[0, 20, 0, 7]);
        // UTF-16 big-endian: 'G' is 0x0047
        assert_eq!(&encoded[4..6], &[0x00, 0x47]);
        assert_eq!(decode_wstring(&encoded).unwrap(), "Grüße €");
        assert_eq!(
            encode_wstring("toolong", 3),
            Err(Error::StringTooLong { length: 7, max: 3 })
        );
    }

    #[test]
    fn datetime_round_trip() {
        let value = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_milli_opt(13, 45, 59, 123)
            .unwrap();
        let encoded = encode_datetime(&value).unwrap();
        // 2024-02-29 is a Thursday, weekday 5 counted from Sunday
        assert_eq!(encoded, [0x24, 0x02, 0x29, 0x13, 0x45, 0x59, 0x12, 0x35]);
        assert_eq!(decode_datetime(&encoded).unwrap(), value);

        let nineties = NaiveDate::from_ymd_opt(1995, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 1)
            .unwrap();
        assert_eq!(
            decode_datetime(&encode_datetime(&nineties).unwrap()).unwrap(),
            nineties
        );
    }

    #[test]
    fn datetime_rejects_garbage() {
        assert!(decode_datetime(&[0x24, 0x13, 0x01, 0, 0, 0, 0, 0]).is_err());
        assert!(decode_datetime(&[0x2A, 0x01, 0x01, 0, 0, 0, 0, 0]).is_err());
        assert!(decode_datetime(&[0x24, 0x01]).is_err());
        let too_early = NaiveDate::from_ymd_opt(1980, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(encode_datetime(&too_early).is_err());
    }
}
