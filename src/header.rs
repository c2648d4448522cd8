// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::warn;

use crate::{DecodeConfig, Error, Result};

/// "FLV"
pub const SIGNATURE: [u8; 3] = *b"FLV";

/// Size of the fixed file header, and the only body offset we write.
pub const HEADER_LENGTH: u32 = 9;

/// Stream capability flags from byte 4 of the file header.
///
/// Only bit 2 (audio) and bit 0 (video) carry meaning; the reserved bits
/// are dropped on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Self = Self(0);
    pub const AUDIO: Self = Self(0x04);
    pub const VIDEO: Self = Self(0x01);

    const MASK: u8 = Self::AUDIO.0 | Self::VIDEO.0;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn has_audio(self) -> bool {
        self.contains(Self::AUDIO)
    }

    pub const fn has_video(self) -> bool {
        self.contains(Self::VIDEO)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The fixed FLV file header.
///
/// See FLV spec § E.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: Flags,
    /// Offset of the first back-pointer from the start of the stream.
    pub body_offset: u32,
}

impl Header {
    /// A version 1 header with the canonical body offset.
    pub fn new(flags: Flags) -> Self {
        Self { version: 1, flags, body_offset: HEADER_LENGTH }
    }

    /// Number of extension bytes between the fixed header and the body.
    pub fn padding(&self) -> u32 {
        self.body_offset.saturating_sub(HEADER_LENGTH)
    }
}

/// Read and validate the fixed 9-byte header.
///
/// Padding up to `body_offset` is left in `src`; [`crate::Decoder`] skips it.
pub fn read_header<T: Read>(src: &mut T) -> Result<Header> {
    read_header_with_config(src, &DecodeConfig::default())
}

pub(crate) fn read_header_with_config<T: Read>(src: &mut T, config: &DecodeConfig) -> Result<Header> {
    let mut buf = [0u8; HEADER_LENGTH as usize];
    src.read_exact(&mut buf).map_err(|e| match Error::from(e) {
        Error::UnexpectedEOF => Error::MalformedHeader("truncated header"),
        e => e,
    })?;
    if buf[0..3] != SIGNATURE {
        return Err(Error::MalformedHeader("bad signature"));
    }

    let version = buf[3];
    let flags = Flags::from_bits(buf[4]);
    let mut body_offset = BigEndian::read_u32(&buf[5..9]);

    if body_offset < HEADER_LENGTH {
        if !config.lenient {
            return Err(Error::MalformedHeader("body offset inside fixed header"));
        }
        warn!("body offset {body_offset} is smaller than the header, assuming {HEADER_LENGTH}");
        body_offset = HEADER_LENGTH;
    }

    Ok(Header { version, flags, body_offset })
}

/// Write the fixed header. Extension regions are not supported, so the
/// body offset is always written as [`HEADER_LENGTH`].
pub fn write_header<W: Write>(dst: &mut W, header: &Header) -> Result<()> {
    dst.write_all(&SIGNATURE)?;
    dst.write_u8(header.version)?;
    dst.write_u8(header.flags.bits())?;
    dst.write_u32::<BigEndian>(HEADER_LENGTH)?;
    Ok(())
}

#[test]
fn header_round_trip() {
    let header = Header::new(Flags::AUDIO | Flags::VIDEO);
    let mut buf = std::vec::Vec::new();
    write_header(&mut buf, &header).unwrap();
    assert_eq!(buf, [0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09]);
    assert_eq!(read_header(&mut buf.as_slice()).unwrap(), header);
}

#[test]
fn header_flags() {
    let src = &mut [0x46, 0x4c, 0x56, 0x01, 0xfc, 0x00, 0x00, 0x00, 0x09].as_slice();
    let header = read_header(src).unwrap();
    assert!(header.flags.has_audio());
    assert!(!header.flags.has_video());
    assert_eq!(header.flags, Flags::AUDIO);
}

#[test]
fn header_bad_signature() {
    let src = &mut [0x46, 0x4c, 0x57, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09].as_slice();
    assert!(matches!(read_header(src), Err(Error::MalformedHeader(_))));
}

#[test]
fn header_truncated() {
    let src = &mut [0x46, 0x4c, 0x56, 0x01].as_slice();
    assert!(matches!(read_header(src), Err(Error::MalformedHeader("truncated header"))));
}

#[test]
fn header_small_body_offset() {
    let bin = [0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x04];
    assert!(matches!(read_header(&mut bin.as_slice()), Err(Error::MalformedHeader(_))));

    let config = DecodeConfig::default().lenient(true);
    let header = read_header_with_config(&mut bin.as_slice(), &config).unwrap();
    assert_eq!(header.body_offset, HEADER_LENGTH);
}
