#![deny(unsafe_code)]
//! Module for reading and writing FLV streams.
//!
//! An FLV stream is a short file header followed by tags, each preceded by
//! the size of the tag before it. [`Decoder`] yields one [`Tag`] per call
//! and leaves audio and video payloads in the source behind a
//! [`PayloadReader`], so frames pass through without being buffered.
//! [`Encoder`] writes tags back out from any [`Read`] payload.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::warn;

use std::io::Read;

mod amf_check;
mod codec;
mod framer;
mod header;
mod payload;
mod tag;
mod types;

pub use amf::amf0;

pub use crate::framer::{Decoder, Encoder, MAX_DATA_SIZE, TAG_HEADER_LENGTH};
pub use crate::header::{Flags, HEADER_LENGTH, Header, SIGNATURE, read_header, write_header};
pub use crate::payload::PayloadReader;
pub use crate::tag::{AudioData, ScriptData, Tag, TagData, VideoData};
pub use crate::types::{
    AacPacketType, AvcPacketType, CodecId, FrameType, SoundFormat, SoundRate, SoundSize, SoundType, TagType,
};

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

/// Describes codec failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own framing states and those of crates we use.
#[derive(Debug)]
pub enum Error {
    /// The file header is not an FLV header.
    MalformedHeader(&'static str),
    /// The tag sequence is broken. Decoding cannot continue.
    Framing(&'static str),
    /// An audio or video sub-header is shorter than its format requires.
    TruncatedPayload,
    /// The tag type byte is not audio, video or script data.
    UnsupportedTagType(u8),
    /// A script data (name, value) pair failed to decode.
    ScriptData {
        /// Index of the failing pair.
        pair: usize,
        /// Byte offset of the failing pair within the tag data.
        offset: u64,
        reason: ScriptDataError,
    },
    /// A value cannot be represented on the wire.
    InvalidData(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during decoding
    ResourceLimitExceeded(&'static str),
}

/// Why a script data pair was rejected.
#[derive(Debug)]
pub enum ScriptDataError {
    /// The AMF0 codec failed.
    Value(amf::error::DecodeError),
    /// A length, count, reference or nesting level does not fit in the tag.
    Malformed(&'static str),
    /// The first element of a pair was not a string.
    NameNotString,
}

impl Error {
    /// True when [`Decoder::decode`] has already skipped past the failing
    /// tag, so decoding may continue with the next one.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TruncatedPayload
                | Self::UnsupportedTagType(_)
                | Self::ScriptData { .. }
                | Self::ResourceLimitExceeded(_)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::MalformedHeader(s) | Self::Framing(s) | Self::InvalidData(s) | Self::ResourceLimitExceeded(s) => *s,
            Self::TruncatedPayload => "truncated sub-header",
            Self::UnsupportedTagType(t) => return write!(f, "unsupported tag type {t}"),
            Self::ScriptData { pair, offset, reason } => {
                return write!(f, "script data pair {pair} at offset {offset}: {reason}");
            },
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::fmt::Display for ScriptDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(err) => err.fmt(f),
            Self::Malformed(s) => f.write_str(s),
            Self::NameNotString => f.write_str("name is not a string"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::ScriptData { reason: ScriptDataError::Value(err), .. } => Some(err),
            _ => None,
        }
    }
}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::MalformedHeader(_) | Error::Framing(_) | Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<fallible_collections::TryReserveError> for Error {
    fn from(_: fallible_collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration for decoding FLV streams with resource limits and validation options
///
/// # Examples
///
/// ```rust
/// use zenflv::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input
/// let config = DecodeConfig::default()
///     .with_max_script_data_size(64 * 1024)
///     .with_peak_memory_limit(100_000_000);
///
/// // No limits
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Largest script data tag that will be decoded; bigger ones are skipped
    /// with [`Error::ResourceLimitExceeded`].
    /// Default: 4 MiB
    pub max_script_data_size: Option<u32>,

    /// Maximum total payload bytes buffered by [`read_flv_with_config`].
    /// Default: 1GB (1,000,000,000 bytes)
    pub peak_memory_limit: Option<u64>,

    /// Enable lenient decoding mode.
    ///
    /// Accepts a header whose body offset points inside the fixed header,
    /// and makes [`read_flv_with_config`] skip tags that fail with a
    /// recoverable error instead of stopping.
    /// Default: false (strict validation)
    pub lenient: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_script_data_size: Some(4 << 20),
            peak_memory_limit: Some(1_000_000_000),
            lenient: false,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self { max_script_data_size: None, peak_memory_limit: None, lenient: false }
    }

    /// Set the largest script data tag to decode
    pub fn with_max_script_data_size(mut self, bytes: u32) -> Self {
        self.max_script_data_size = Some(bytes);
        self
    }

    /// Set the peak memory limit in bytes
    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    /// Enable lenient decoding mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }
}

/// A tag with its payload read into memory.
pub type OwnedTag = Tag<TryVec<u8>>;

/// Every tag of a stream, read eagerly.
#[derive(Debug)]
pub struct FlvFile {
    pub header: Header,
    pub tags: TryVec<OwnedTag>,
}

/// Read a whole FLV stream into memory.
///
/// Prefer [`Decoder`] for large or live streams.
pub fn read_flv<T: Read>(f: &mut T) -> Result<FlvFile> {
    read_flv_with_config(f, &DecodeConfig::default())
}

/// Read a whole FLV stream into memory with resource limits.
pub fn read_flv_with_config<T: Read>(f: &mut T, config: &DecodeConfig) -> Result<FlvFile> {
    let mut decoder = Decoder::with_config(f, config.clone())?;
    let mut tags = TryVec::new();
    let mut buffered = 0u64;

    loop {
        let tag = match decoder.decode() {
            Ok(Some(tag)) => tag,
            Ok(None) => break,
            Err(e) if config.lenient && e.is_recoverable() => {
                warn!("skipping tag {}: {e}", tags.len());
                continue;
            },
            Err(e) => return Err(e),
        };
        let tag = tag.map_payload(|mut payload| -> Result<TryVec<u8>> {
            buffered = buffered.saturating_add(payload.bytes_left());
            if let Some(limit) = config.peak_memory_limit {
                if buffered > limit {
                    return Err(Error::ResourceLimitExceeded("peak memory limit exceeded"));
                }
            }
            Ok(payload.read_into_try_vec()?)
        })?;
        tags.push(tag)?;
    }

    Ok(FlvFile { header: *decoder.header(), tags })
}

/// Skip a number of bytes that we don't care to parse.
/// Returns how many were actually there.
fn skip<T: Read>(src: &mut T, bytes: u64) -> Result<u64> {
    Ok(std::io::copy(&mut src.take(bytes), &mut std::io::sink())?)
}

#[cfg(test)]
const BROKEN_THEN_VIDEO: &[u8] = &[
    0x46, 0x4c, 0x56, // FLV
    0x01, // version
    0x05, // flags (audio + video)
    0x00, 0x00, 0x00, 0x09, // header size
    0x00, 0x00, 0x00, 0x00, // previous tag size
    // script data (broken)
    0x12, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0xff, 0xff,
    0x00, 0x00, 0x00, 0x10,
    // video data
    0x09, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x02, 0x03, 0x04, 0x05,
    0x00, 0x00, 0x00, 0x10,
];

#[test]
fn error_display() {
    assert_eq!(Error::UnsupportedTagType(7).to_string(), "unsupported tag type 7");
    let err = Error::ScriptData { pair: 2, offset: 40, reason: ScriptDataError::NameNotString };
    assert_eq!(err.to_string(), "script data pair 2 at offset 40: name is not a string");
    assert!(err.is_recoverable());
    assert!(!Error::Framing("x").is_recoverable());
}

#[test]
fn io_error_round_trip() {
    let err: Error = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
    assert!(matches!(err, Error::UnexpectedEOF));
    let io: std::io::Error = Error::Framing("bad").into();
    assert_eq!(io.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn read_flv_strict_stops_on_bad_tag() {
    assert!(matches!(read_flv(&mut &BROKEN_THEN_VIDEO[..]), Err(Error::ScriptData { .. })));
}

#[test]
fn read_flv_lenient_skips_bad_tag() {
    let config = DecodeConfig::default().lenient(true);
    let flv = read_flv_with_config(&mut &BROKEN_THEN_VIDEO[..], &config).unwrap();
    assert_eq!(flv.tags.len(), 1);
    let tag = &flv.tags[0];
    assert_eq!(tag.tag_type(), TagType::Video);
    match &tag.data {
        TagData::Video(v) => {
            assert_eq!(v.frame_type, FrameType::Unknown(0));
            assert_eq!(v.codec_id, CodecId::Jpeg);
            assert_eq!(v.data, [0x02u8, 0x03, 0x04, 0x05].as_ref());
        },
        _ => panic!("expected video"),
    }
}

#[test]
fn read_flv_memory_limit() {
    let config = DecodeConfig::default().lenient(true).with_peak_memory_limit(3);
    assert!(matches!(
        read_flv_with_config(&mut &BROKEN_THEN_VIDEO[..], &config),
        Err(Error::ResourceLimitExceeded(_))
    ));
}

#[test]
fn script_data_size_limit_is_skipped() {
    let config = DecodeConfig::default().with_max_script_data_size(4);
    let mut dec = Decoder::with_config(BROKEN_THEN_VIDEO, config).unwrap();
    assert!(matches!(dec.decode(), Err(Error::ResourceLimitExceeded(_))));
    assert_eq!(dec.decode().unwrap().unwrap().tag_type(), TagType::Video);
}
