//! Serial types are how SQLite stores values in records.
//!
//! Each column value in a record is tagged with an integer serial type code
//! that determines the wire form of the body bytes:
//!
//! | code       | size        | meaning                               |
//! | ---------- | ----------- | ------------------------------------- |
//! | 0          | 0           | NULL                                  |
//! | 1..=6      | 1,2,3,4,6,8 | big-endian two's-complement integer   |
//! | 7          | 8           | big-endian IEEE 754 64-bit float      |
//! | 8, 9       | 0           | the integer constants 0 and 1         |
//! | 10, 11     | -           | reserved, never on disk               |
//! | N>=12 even | (N-12)/2    | blob                                  |
//! | N>=13 odd  | (N-13)/2    | text, no nul terminator               |

use byteorder::{BigEndian, ByteOrder};

use crate::value::ColumnValue;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid serial type code {0}.")]
    InvalidSerialTypeCode(i64),
    #[error("Value body shorter than its serial type requires.")]
    Truncated,
}

/// Returns the size in bytes of the body of a value with the given serial
/// type code.  NULL and the constant types have no body.
pub fn content_size(serial_type: i64) -> Result<usize, Error> {
    match serial_type {
        0 => Ok(0),
        1 => Ok(1),
        2 => Ok(2),
        3 => Ok(3),
        4 => Ok(4),
        5 => Ok(6),
        6 | 7 => Ok(8),
        8 | 9 => Ok(0),
        x if x >= 12 => Ok((x as usize - 12 - (x % 2) as usize) / 2),
        x => Err(Error::InvalidSerialTypeCode(x)),
    }
}

// Sign-extending read of a 1-8 byte big-endian two's-complement integer.
fn read_twos_complement(data: &[u8]) -> i64 {
    let mut v: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in data {
        v = (v << 8) | b as i64;
    }
    v
}

/// Decodes one value in serial-type wire form into a `ColumnValue` borrowing
/// from `data`.  `data` must hold at least `content_size(serial_type)` bytes.
pub fn decode_value(serial_type: i64, data: &[u8]) -> Result<ColumnValue<'_>, Error> {
    use ColumnValue::*;

    let size = content_size(serial_type)?;
    if data.len() < size {
        return Err(Error::Truncated);
    }
    match serial_type {
        0 => Ok(Null),
        1..=6 => Ok(Int(read_twos_complement(&data[..size]))),
        7 => Ok(Real(f64::from_bits(BigEndian::read_u64(&data[..8])))),
        8 => Ok(Int(0)),
        9 => Ok(Int(1)),
        x if x >= 12 && x % 2 == 0 => Ok(Blob(&data[..size])),
        x if x >= 13 => Ok(Text(&data[..size])),
        x => Err(Error::InvalidSerialTypeCode(x)),
    }
}

/// Picks the narrowest serial type code that represents `v` exactly.
///
/// Integers use the constant codes 8 and 9 when equal to 0 or 1, otherwise
/// the narrowest of the 1/2/3/4/6 widths that fits.
pub fn pick_serial_type(v: &ColumnValue) -> i64 {
    match v {
        ColumnValue::Null => 0,
        ColumnValue::Int(0) => 8,
        ColumnValue::Int(1) => 9,
        ColumnValue::Int(x) => match x {
            -128..=127 => 1,
            -32768..=32767 => 2,
            -8388608..=8388607 => 3,
            -2147483648..=2147483647 => 4,
            _ => 6,
        },
        ColumnValue::Real(_) => 7,
        ColumnValue::Blob(b) => 12 + 2 * b.len() as i64,
        ColumnValue::Text(t) => 13 + 2 * t.len() as i64,
    }
}

/// Encodes the body of `v` into `buf` using the serial type that
/// `pick_serial_type` chooses.  Returns the number of bytes written, which
/// equals `content_size(pick_serial_type(v))`.
pub fn encode_body(v: &ColumnValue, buf: &mut [u8]) -> usize {
    match v {
        ColumnValue::Null | ColumnValue::Int(0) | ColumnValue::Int(1) => 0,
        ColumnValue::Int(x) => {
            let size = content_size(pick_serial_type(v)).unwrap();
            let be = x.to_be_bytes();
            buf[..size].copy_from_slice(&be[8 - size..]);
            size
        }
        ColumnValue::Real(x) => {
            BigEndian::write_u64(&mut buf[..8], x.to_bits());
            8
        }
        ColumnValue::Text(b) | ColumnValue::Blob(b) => {
            buf[..b.len()].copy_from_slice(b);
            b.len()
        }
    }
}

#[test]
fn test_content_size() {
    assert_eq!(content_size(0).unwrap(), 0);
    assert_eq!(content_size(1).unwrap(), 1);
    assert_eq!(content_size(5).unwrap(), 6);
    assert_eq!(content_size(6).unwrap(), 8);
    assert_eq!(content_size(7).unwrap(), 8);
    assert_eq!(content_size(8).unwrap(), 0);
    assert_eq!(content_size(12).unwrap(), 0); // empty blob
    assert_eq!(content_size(13).unwrap(), 0); // empty text
    assert_eq!(content_size(18).unwrap(), 3); // 3 byte blob
    assert_eq!(content_size(19).unwrap(), 3); // 3 byte text
    assert!(content_size(10).is_err());
    assert!(content_size(11).is_err());
    assert!(content_size(-1).is_err());
}

#[test]
fn test_decode_ints() {
    use ColumnValue::*;
    let cases: Vec<(i64, &[u8], ColumnValue)> = vec![
        (0, b"", Null),
        (1, &[0x7f], Int(127)),
        (1, &[0xff], Int(-1)),
        (2, &[0x01, 0x00], Int(256)),
        (2, &[0xff, 0xff], Int(-1)),
        (3, &[0x01, 0x00, 0x00], Int(65536)),
        (3, &[0xff, 0xff, 0xff], Int(-1)),
        (4, &[0x7f, 0xff, 0xff, 0xff], Int(i32::MAX as i64)),
        (5, &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff], Int(-1)),
        (5, &[0x00, 0x00, 0x01, 0x00, 0x00, 0x00], Int(1 << 24)),
        (
            6,
            &[0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
            Int(i64::MAX),
        ),
        (8, b"", Int(0)),
        (9, b"", Int(1)),
    ];
    for (st, data, expect) in cases {
        assert_eq!(decode_value(st, data).unwrap(), expect, "serial type {}", st);
    }
}

#[test]
fn test_decode_real_text_blob() {
    use ColumnValue::*;
    assert_eq!(
        decode_value(7, &3.1415_f64.to_be_bytes()).unwrap(),
        Real(3.1415)
    );
    assert_eq!(decode_value(19, b"Ten").unwrap(), Text(b"Ten"));
    assert_eq!(
        decode_value(18, &[0x00, 0x01, 0xff]).unwrap(),
        Blob(&[0x00, 0x01, 0xff])
    );
}

#[test]
fn test_decode_errors() {
    assert!(decode_value(10, b"").is_err());
    assert!(decode_value(11, b"").is_err());
    assert!(decode_value(4, &[0x00, 0x00]).is_err()); // truncated body
}

#[test]
fn test_pick_serial_type_narrowest() {
    use ColumnValue::*;
    assert_eq!(pick_serial_type(&Null), 0);
    assert_eq!(pick_serial_type(&Int(0)), 8);
    assert_eq!(pick_serial_type(&Int(1)), 9);
    assert_eq!(pick_serial_type(&Int(2)), 1);
    assert_eq!(pick_serial_type(&Int(-1)), 1);
    assert_eq!(pick_serial_type(&Int(128)), 2);
    assert_eq!(pick_serial_type(&Int(-40000)), 3);
    assert_eq!(pick_serial_type(&Int(1 << 23)), 4);
    assert_eq!(pick_serial_type(&Int(1 << 40)), 6);
    assert_eq!(pick_serial_type(&Real(0.5)), 7);
    assert_eq!(pick_serial_type(&Text(b"hello")), 23);
    assert_eq!(pick_serial_type(&Blob(&[1, 2])), 16);
}

#[test]
fn test_encode_decode_round_trip() {
    use ColumnValue::*;
    let values = vec![
        Null,
        Int(0),
        Int(1),
        Int(-7),
        Int(300),
        Int(1 << 33),
        Real(-2.75),
        Text(b"hello"),
        Blob(&[0xde, 0xad, 0xbe, 0xef]),
    ];
    let mut buf = [0_u8; 64];
    for v in values {
        let st = pick_serial_type(&v);
        let n = encode_body(&v, &mut buf);
        assert_eq!(n, content_size(st).unwrap());
        assert_eq!(decode_value(st, &buf[..n]).unwrap(), v);
    }
}
