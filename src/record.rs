//! B-tree cells hold records, which contain table rows and index keys.
//!
//! A record is `[header_size:varint][serial_type:varint ...][body ...]`.
//! The header size varint counts itself.  Each serial type describes the
//! wire form of the corresponding body; bodies are packed with no padding.

use crate::serial_type;
use crate::value::{compare_values, ColumnValue, Collation};
use crate::varint;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Record header is malformed: {0}")]
    BadHeader(#[from] varint::Error),
    #[error("Record body is malformed: {0}")]
    BadBody(#[from] serial_type::Error),
    #[error("Record header size {0} exceeds the payload length.")]
    HeaderOverrun(usize),
    #[error("Record has no column {0}.")]
    ColumnOutOfRange(usize),
}

/// Iterates over the serial type codes in a record header.
pub struct HeaderIterator<'a> {
    data: &'a [u8],
    offset: usize,
    hdr_len: usize,
}

impl<'a> HeaderIterator<'a> {
    /// Creates an iterator over the header of a record held in `payload`.
    /// `payload` must begin with the header-size varint.
    pub fn new(payload: &'a [u8]) -> Result<HeaderIterator<'a>, Error> {
        let (hdr_len, hdr_len_len) = varint::read_varint(payload)?;
        let hdr_len = hdr_len as usize;
        if hdr_len > payload.len() {
            return Err(Error::HeaderOverrun(hdr_len));
        }
        Ok(HeaderIterator {
            data: payload,
            offset: hdr_len_len,
            hdr_len,
        })
    }
}

impl<'a> Iterator for HeaderIterator<'a> {
    type Item = Result<i64, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.hdr_len {
            return None;
        }
        match varint::read_varint(&self.data[self.offset..self.hdr_len]) {
            Ok((serial_type, bytes_read)) => {
                self.offset += bytes_read;
                Some(Ok(serial_type))
            }
            Err(e) => {
                self.offset = self.hdr_len; // poison further iteration
                Some(Err(e.into()))
            }
        }
    }
}

/// Iterates over `(serial_type, body_bytes)` pairs of a record, walking the
/// header and the body in lockstep.
pub struct ValueIterator<'a> {
    data: &'a [u8],
    hdr_offset: usize,
    hdr_len: usize,
    body_offset: usize,
}

impl<'a> ValueIterator<'a> {
    pub fn new(payload: &'a [u8]) -> Result<ValueIterator<'a>, Error> {
        let (hdr_len, hdr_len_len) = varint::read_varint(payload)?;
        let hdr_len = hdr_len as usize;
        if hdr_len > payload.len() {
            return Err(Error::HeaderOverrun(hdr_len));
        }
        Ok(ValueIterator {
            data: payload,
            hdr_offset: hdr_len_len,
            hdr_len,
            body_offset: hdr_len,
        })
    }
}

impl<'a> Iterator for ValueIterator<'a> {
    type Item = Result<(i64, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.hdr_offset >= self.hdr_len {
            return None;
        }
        let step = || -> Result<(i64, &'a [u8], usize, usize), Error> {
            let (serial_type, bytes_read) =
                varint::read_varint(&self.data[self.hdr_offset..self.hdr_len])?;
            let size = serial_type::content_size(serial_type)?;
            if self.body_offset + size > self.data.len() {
                return Err(serial_type::Error::Truncated.into());
            }
            let body = &self.data[self.body_offset..self.body_offset + size];
            Ok((serial_type, body, bytes_read, size))
        };
        match step() {
            Ok((serial_type, body, hdr_step, body_step)) => {
                self.hdr_offset += hdr_step;
                self.body_offset += body_step;
                Some(Ok((serial_type, body)))
            }
            Err(e) => {
                self.hdr_offset = self.hdr_len;
                Some(Err(e))
            }
        }
    }
}

/// Decodes every column of a record into typed values.
pub fn decode_record(payload: &[u8]) -> Result<Vec<ColumnValue<'_>>, Error> {
    let mut out = Vec::new();
    for item in ValueIterator::new(payload)? {
        let (serial_type, body) = item?;
        out.push(serial_type::decode_value(serial_type, body)?);
    }
    Ok(out)
}

/// Decodes the `index`-th column of a record, skipping the bodies of the
/// columns before it without materialising them.
pub fn decode_column(payload: &[u8], index: usize) -> Result<ColumnValue<'_>, Error> {
    for (i, item) in ValueIterator::new(payload)?.enumerate() {
        let (serial_type, body) = item?;
        if i == index {
            return Ok(serial_type::decode_value(serial_type, body)?);
        }
    }
    Err(Error::ColumnOutOfRange(index))
}

/// Returns the number of columns in a record.
pub fn column_count(payload: &[u8]) -> Result<usize, Error> {
    let mut n = 0;
    for st in HeaderIterator::new(payload)? {
        st?;
        n += 1;
    }
    Ok(n)
}

/// Encodes typed values into record wire form.
///
/// The header-size varint must account for its own length; its length can
/// only jump at the 128 and 16384 varint boundaries, so recomputing once
/// after a provisional guess always reaches a fixed point.
pub fn encode_record(values: &[ColumnValue]) -> Vec<u8> {
    let mut type_bytes = 0;
    let mut body_bytes = 0;
    let mut serial_types = Vec::with_capacity(values.len());
    for v in values {
        let st = serial_type::pick_serial_type(v);
        type_bytes += varint::varint_len(st);
        body_bytes += serial_type::content_size(st).unwrap();
        serial_types.push(st);
    }
    let mut hdr_len = type_bytes + 1;
    hdr_len = type_bytes + varint::varint_len(hdr_len as i64);

    let mut out = vec![0_u8; hdr_len + body_bytes];
    let mut pos = varint::write_varint(&mut out, hdr_len as i64);
    for st in &serial_types {
        pos += varint::write_varint(&mut out[pos..], *st);
    }
    debug_assert_eq!(pos, hdr_len);
    for v in values {
        pos += serial_type::encode_body(v, &mut out[pos..]);
    }
    debug_assert_eq!(pos, out.len());
    out
}

/// Compares two records column by column, the ordering index B-trees keep.
///
/// Column `i` compares under `collations[i]` (binary beyond the slice; the
/// trailing rowid column of an index record lands there).  A shorter probe
/// that matches every column it has compares `Equal`, which is what gives
/// `seek_first` its prefix-match semantics; when arities differ otherwise,
/// the longer record compares greater.
pub fn compare_records(
    probe: &[u8],
    stored: &[u8],
    collations: &[Collation],
) -> Result<std::cmp::Ordering, Error> {
    use std::cmp::Ordering;

    let mut a = ValueIterator::new(probe)?;
    let mut b = ValueIterator::new(stored)?;
    let mut i = 0;
    loop {
        match (a.next(), b.next()) {
            (None, _) => return Ok(Ordering::Equal),
            (Some(_), None) => return Ok(Ordering::Greater),
            (Some(x), Some(y)) => {
                let (xt, xb) = x?;
                let (yt, yb) = y?;
                let xv = serial_type::decode_value(xt, xb)?;
                let yv = serial_type::decode_value(yt, yb)?;
                let collation = collations.get(i).copied().unwrap_or_default();
                let ord = compare_values(&xv, &yv, collation);
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
                i += 1;
            }
        }
    }
}

/// A comparison a stored row must satisfy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One conjunct of a row predicate: `column[ordinal] op value`.
#[derive(Debug, Clone)]
pub struct ColumnFilter<'a> {
    pub ordinal: usize,
    pub op: CompareOp,
    pub value: ColumnValue<'a>,
}

impl CompareOp {
    fn holds(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ord == Equal,
            CompareOp::Ne => ord != Equal,
            CompareOp::Lt => ord == Less,
            CompareOp::Le => ord != Greater,
            CompareOp::Gt => ord == Greater,
            CompareOp::Ge => ord != Less,
        }
    }
}

/// Evaluates a conjunction of filters against a record without materialising
/// columns no filter references.  Decoding stops at the first conjunct that
/// fails.
///
/// When `rowid_alias_ordinal` names a column, that column reads as the
/// cursor rowid (its record slot is stored as NULL).
pub fn matches(
    payload: &[u8],
    filters: &[ColumnFilter],
    row_id: i64,
    rowid_alias_ordinal: Option<usize>,
) -> Result<bool, Error> {
    for f in filters {
        let stored = if rowid_alias_ordinal == Some(f.ordinal) {
            ColumnValue::Int(row_id)
        } else {
            decode_column(payload, f.ordinal)?
        };
        let ord = compare_values(&stored, &f.value, Collation::Binary);
        if !f.op.holds(ord) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[test]
fn test_header_iterator_various_types() {
    // literal 0 | literal 1 | float 3.1415 | "Ten" | NULL
    let test_record: &[u8] = &[
        0x06, 0x08, 0x09, 0x07, 0x13, 0x00, 0x40, 0x09, 0x21, 0xca, 0xc0, 0x83, 0x12, 0x6f, 0x54,
        0x65, 0x6e,
    ];
    let types: Vec<i64> = HeaderIterator::new(test_record)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(types, vec![8, 9, 7, 0x13, 0]);
}

#[test]
fn test_value_iterator_various_types() {
    let test_record: &[u8] = &[
        0x06, 0x08, 0x09, 0x07, 0x13, 0x00, 0x40, 0x09, 0x21, 0xca, 0xc0, 0x83, 0x12, 0x6f, 0x54,
        0x65, 0x6e,
    ];
    let mut vi = ValueIterator::new(test_record).unwrap();
    assert_eq!(vi.next().unwrap().unwrap(), (8, &[][..]));
    assert_eq!(vi.next().unwrap().unwrap(), (9, &[][..]));
    assert_eq!(
        vi.next().unwrap().unwrap(),
        (7, &[0x40, 0x09, 0x21, 0xca, 0xc0, 0x83, 0x12, 0x6f][..])
    );
    assert_eq!(vi.next().unwrap().unwrap(), (0x13, &b"Ten"[..]));
    assert_eq!(vi.next().unwrap().unwrap(), (0, &[][..]));
    assert!(vi.next().is_none());
}

#[test]
fn test_encode_record_minimal() {
    // One column holding the literal 1: header size 2, serial type 9, no body.
    assert_eq!(encode_record(&[ColumnValue::Int(1)]), vec![0x02, 0x09]);
}

#[test]
fn test_record_round_trip() {
    use ColumnValue::*;
    let blob = vec![0xaa_u8; 300];
    let rows: Vec<Vec<ColumnValue>> = vec![
        vec![],
        vec![Null],
        vec![Int(42), Text(b"hello")],
        vec![Int(0), Int(1), Int(-1), Int(1 << 40), Real(9.5), Null],
        vec![Blob(&blob), Text(b"")],
    ];
    for row in rows {
        let payload = encode_record(&row);
        assert_eq!(decode_record(&payload).unwrap(), row);
        assert_eq!(column_count(&payload).unwrap(), row.len());
    }
}

#[test]
fn test_record_round_trip_long_header() {
    // 200 columns of text forces a multi-byte header-size varint.
    let row: Vec<ColumnValue> = (0..200).map(|_| ColumnValue::Text(b"x")).collect();
    let payload = encode_record(&row);
    assert_eq!(decode_record(&payload).unwrap(), row);
}

#[test]
fn test_decode_column_skips_bodies() {
    use ColumnValue::*;
    let payload = encode_record(&[Int(7), Text(b"skip me"), Real(1.5), Blob(&[9, 9])]);
    assert_eq!(decode_column(&payload, 0).unwrap(), Int(7));
    assert_eq!(decode_column(&payload, 2).unwrap(), Real(1.5));
    assert!(matches!(
        decode_column(&payload, 4),
        Err(Error::ColumnOutOfRange(4))
    ));
}

#[test]
fn test_matches_stops_at_first_failed_conjunct() {
    use ColumnValue::*;
    let payload = encode_record(&[Int(5), Text(b"abc")]);
    let filters = [
        ColumnFilter {
            ordinal: 0,
            op: CompareOp::Gt,
            value: Int(10),
        },
        // Never reached; ordinal 9 would error if decoded.
        ColumnFilter {
            ordinal: 9,
            op: CompareOp::Eq,
            value: Null,
        },
    ];
    assert!(!matches(&payload, &filters, 1, None).unwrap());
}

#[test]
fn test_compare_records_prefix_and_collation() {
    use std::cmp::Ordering::*;
    use ColumnValue::*;
    let stored = encode_record(&[Text(b"Apple"), Int(4)]);
    let equal_probe = encode_record(&[Text(b"apple")]);
    let bigger_probe = encode_record(&[Text(b"banana")]);

    // Prefix probe under NOCASE matches; under BINARY "apple" sorts after.
    assert_eq!(
        compare_records(&equal_probe, &stored, &[Collation::NoCase]).unwrap(),
        Equal
    );
    assert_eq!(
        compare_records(&equal_probe, &stored, &[Collation::Binary]).unwrap(),
        Greater
    );
    assert_eq!(
        compare_records(&bigger_probe, &stored, &[Collation::NoCase]).unwrap(),
        Greater
    );

    // Full-arity records tie-break on the trailing rowid column.
    let with_rowid_3 = encode_record(&[Text(b"Apple"), Int(3)]);
    assert_eq!(
        compare_records(&with_rowid_3, &stored, &[Collation::Binary]).unwrap(),
        Less
    );
}

#[test]
fn test_matches_rowid_alias() {
    use ColumnValue::*;
    // Rowid-alias columns store NULL; the rowid substitutes on read.
    let payload = encode_record(&[Null, Text(b"abc")]);
    let filters = [ColumnFilter {
        ordinal: 0,
        op: CompareOp::Eq,
        value: Int(17),
    }];
    assert!(matches(&payload, &filters, 17, Some(0)).unwrap());
    assert!(!matches(&payload, &filters, 18, Some(0)).unwrap());
}
