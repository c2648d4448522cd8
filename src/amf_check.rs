// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structural check of one AMF0 value before it is handed to the `amf` decoder.
//!
//! The decoder allocates whatever a length prefix asks for, recurses once
//! per nesting level, and clones the target of every reference. Walking the
//! bytes first lets us reject a value whose lengths overrun the tag, whose
//! nesting is too deep, or whose references would expand it past a budget.

use byteorder::{BigEndian, ByteOrder};

const NUMBER: u8 = 0x00;
const BOOLEAN: u8 = 0x01;
const STRING: u8 = 0x02;
const OBJECT: u8 = 0x03;
const NULL: u8 = 0x05;
const UNDEFINED: u8 = 0x06;
const REFERENCE: u8 = 0x07;
const ECMA_ARRAY: u8 = 0x08;
const OBJECT_END: u8 = 0x09;
const STRICT_ARRAY: u8 = 0x0a;
const DATE: u8 = 0x0b;
const LONG_STRING: u8 = 0x0c;
const XML_DOCUMENT: u8 = 0x0f;
const TYPED_OBJECT: u8 = 0x10;

/// Objects and arrays nested deeper than this are rejected.
pub(crate) const MAX_NESTING: usize = 64;

struct Walker<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Expanded size of each complex value, in the order the decoder numbers
    /// them for references. `None` while the value is still open.
    complexes: std::vec::Vec<Option<u64>>,
    /// Bytes added by resolving references.
    expanded: u64,
    budget: u64,
}

/// Check the AMF0 value at the start of `buf` and return its encoded length.
///
/// `budget` caps the size the value may grow to once references are
/// resolved.
pub(crate) fn check_value(buf: &[u8], budget: u64) -> Result<usize, &'static str> {
    let mut walker = Walker { buf, pos: 0, complexes: std::vec::Vec::new(), expanded: 0, budget };
    walker.value(0)?;
    Ok(walker.pos)
}

impl<'a> Walker<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], &'static str> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or("value runs past the end of the tag")?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<usize, &'static str> {
        Ok(usize::from(BigEndian::read_u16(self.take(2)?)))
    }

    fn u32(&mut self) -> Result<usize, &'static str> {
        usize::try_from(BigEndian::read_u32(self.take(4)?)).map_err(|_| "length does not fit in memory")
    }

    fn value(&mut self, depth: usize) -> Result<(), &'static str> {
        let start = self.pos;
        let marker = self.take(1)?[0];
        match marker {
            NUMBER => {
                self.take(8)?;
            },
            BOOLEAN => {
                self.take(1)?;
            },
            STRING => {
                let len = self.u16()?;
                self.take(len)?;
            },
            LONG_STRING | XML_DOCUMENT => {
                let len = self.u32()?;
                self.take(len)?;
            },
            DATE => {
                self.take(10)?;
            },
            NULL | UNDEFINED => {},
            REFERENCE => {
                let index = self.u16()?;
                let target = self
                    .complexes
                    .get(index)
                    .copied()
                    .flatten()
                    .ok_or("reference to a value that is not complete")?;
                self.expanded = self.expanded.saturating_add(target);
                if self.expanded > self.budget {
                    return Err("references expand past the size limit");
                }
            },
            OBJECT | ECMA_ARRAY | STRICT_ARRAY | TYPED_OBJECT => self.complex(marker, start, depth)?,
            _ => return Err("unsupported AMF0 marker"),
        }
        Ok(())
    }

    fn complex(&mut self, marker: u8, start: usize, depth: usize) -> Result<(), &'static str> {
        if depth >= MAX_NESTING {
            return Err("values nested too deeply");
        }
        let index = self.complexes.len();
        self.complexes.push(None);
        let expanded_before = self.expanded;

        match marker {
            STRICT_ARRAY => {
                let count = self.u32()?;
                // every element is at least one byte, so a bogus count runs out of input
                for _ in 0..count {
                    self.value(depth + 1)?;
                }
            },
            _ => {
                if marker == TYPED_OBJECT {
                    let len = self.u16()?;
                    self.take(len)?;
                } else if marker == ECMA_ARRAY {
                    self.take(4)?;
                }
                self.properties(depth)?;
            },
        }

        let own = (self.pos - start) as u64;
        self.complexes[index] = Some(own.saturating_add(self.expanded - expanded_before));
        Ok(())
    }

    /// Key/value pairs up to the empty key and object-end marker.
    fn properties(&mut self, depth: usize) -> Result<(), &'static str> {
        loop {
            let len = self.u16()?;
            self.take(len)?;
            if len == 0 && self.buf.get(self.pos) == Some(&OBJECT_END) {
                self.pos += 1;
                return Ok(());
            }
            self.value(depth + 1)?;
        }
    }
}

#[cfg(test)]
fn encoded(value: &crate::amf0::Value) -> std::vec::Vec<u8> {
    let mut buf = std::vec::Vec::new();
    value.write_to(&mut buf).unwrap();
    buf
}

#[test]
fn accepts_what_the_encoder_writes() {
    use crate::amf0::Value;

    let value = Value::EcmaArray {
        entries: vec![
            amf::Pair { key: "duration".into(), value: Value::Number(12.0) },
            amf::Pair { key: "encoder".into(), value: Value::String("x".repeat(70_000)) },
            amf::Pair {
                key: "keyframes".into(),
                value: Value::Object {
                    class_name: Some("kf".into()),
                    entries: vec![amf::Pair {
                        key: "times".into(),
                        value: Value::Array { entries: vec![Value::Number(0.0), Value::Null, Value::Undefined] },
                    }],
                },
            },
            amf::Pair { key: "stereo".into(), value: Value::Boolean(true) },
        ],
    };
    let mut buf = encoded(&value);
    let len = buf.len();
    buf.extend_from_slice(&[0x05, 0x05]);
    assert_eq!(check_value(&buf, u64::MAX), Ok(len));
}

#[test]
fn length_prefix_past_the_end() {
    // long string claiming 0xfffffff0 bytes
    assert!(check_value(&[0x0c, 0xff, 0xff, 0xff, 0xf0], u64::MAX).is_err());
    assert!(check_value(&[0x0f, 0x00, 0x00, 0x00, 0x02, b'a'], u64::MAX).is_err());
    assert!(check_value(&[0x02, 0x00, 0x05, b'a'], u64::MAX).is_err());
    // typed object class name
    assert!(check_value(&[0x10, 0xff, 0xff, b'a'], u64::MAX).is_err());
    // object key
    assert!(check_value(&[0x03, 0x00, 0x09, b'k', 0x05], u64::MAX).is_err());
    assert!(check_value(&[0x00, 0x01, 0x02], u64::MAX).is_err());
}

#[test]
fn strict_array_count_past_the_end() {
    assert!(check_value(&[0x0a, 0xff, 0xff, 0xff, 0xff, 0x05, 0x05], u64::MAX).is_err());
    assert_eq!(check_value(&[0x0a, 0x00, 0x00, 0x00, 0x02, 0x05, 0x05], u64::MAX), Ok(7));
}

#[test]
fn deep_nesting() {
    let mut buf = std::vec::Vec::new();
    for _ in 0..=MAX_NESTING {
        buf.extend_from_slice(&[0x0a, 0x00, 0x00, 0x00, 0x01]);
    }
    buf.push(0x05);
    assert_eq!(check_value(&buf, u64::MAX), Err("values nested too deeply"));
    assert_eq!(check_value(&buf[5..], u64::MAX), Ok(buf.len() - 5));
}

#[test]
fn reference_expansion() {
    // [ [null, null], ref 1, ref 1, ref 1 ]
    let buf = [
        0x0a, 0x00, 0x00, 0x00, 0x04, //
        0x0a, 0x00, 0x00, 0x00, 0x02, 0x05, 0x05, //
        0x07, 0x00, 0x01, 0x07, 0x00, 0x01, 0x07, 0x00, 0x01,
    ];
    assert_eq!(check_value(&buf, 1024), Ok(buf.len()));
    // each reference adds the 7 bytes of the inner array
    assert_eq!(check_value(&buf, 20), Err("references expand past the size limit"));

    // reference to the array that is still open
    assert!(check_value(&[0x0a, 0x00, 0x00, 0x00, 0x01, 0x07, 0x00, 0x00], 1024).is_err());
    assert!(check_value(&[0x07, 0x00, 0x00], 1024).is_err());
}

#[test]
fn unsupported_markers() {
    for marker in [0x04, 0x09, 0x0d, 0x0e, 0x11, 0xff] {
        assert_eq!(check_value(&[marker, 0, 0, 0, 0], u64::MAX), Err("unsupported AMF0 marker"));
    }
}
