// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Read, Write};

use arrayvec::ArrayVec;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::{debug, warn};

use crate::codec::{attach_payload, read_tag_data, write_tag_data};
use crate::header::{Flags, HEADER_LENGTH, Header, read_header_with_config, write_header};
use crate::tag::Tag;
use crate::types::TagType;
use crate::{DecodeConfig, Error, PayloadReader, Result, skip};

/// tag type + data size + timestamp + timestamp extension + stream id
pub const TAG_HEADER_LENGTH: u32 = 11;

/// Largest value of the 24-bit data size field.
pub const MAX_DATA_SIZE: u32 = 0x00ff_ffff;

/// Position of the framer relative to the back-pointer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    /// Nothing after the header has been read or written yet.
    AwaitingFirstPointer,
    /// At least one pointer is done. Holds the encoded size of the last tag.
    Streaming { previous_tag_size: u32 },
}

/// Fields of the 11-byte tag header.
#[derive(Debug, Clone, Copy)]
struct TagHeader {
    tag_type: u8,
    data_size: u32,
    timestamp: u32,
    stream_id: u32,
}

impl TagHeader {
    fn parse(buf: &[u8; TAG_HEADER_LENGTH as usize]) -> Self {
        let base = BigEndian::read_u24(&buf[4..7]);
        Self {
            tag_type: buf[0],
            data_size: BigEndian::read_u24(&buf[1..4]),
            timestamp: u32::from(buf[7]) << 24 | base,
            stream_id: BigEndian::read_u24(&buf[8..11]),
        }
    }

    fn encoded_size(&self) -> u32 {
        TAG_HEADER_LENGTH + self.data_size
    }
}

/// Fill `buf` completely, or report `false` if the source was already at its end.
fn read_frame_field<T: Read>(src: &mut T, buf: &mut [u8], truncated: &'static str) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(false),
        n if n == buf.len() => Ok(true),
        _ => Err(Error::Framing(truncated)),
    }
}

/// Reads tags one at a time from an FLV stream.
///
/// Each decoded [`Tag`] borrows the decoder, so it has to be dropped before
/// the next call to [`Decoder::decode`]. Payload bytes the caller did not
/// read are skipped at that point.
pub struct Decoder<R> {
    src: R,
    header: Header,
    config: DecodeConfig,
    state: FramerState,
    /// Unread bytes of the current tag's data.
    pending: u64,
}

impl<R: Read> Decoder<R> {
    /// Read the file header and position the decoder at the first tag.
    pub fn new(src: R) -> Result<Self> {
        Self::with_config(src, DecodeConfig::default())
    }

    pub fn with_config(mut src: R, config: DecodeConfig) -> Result<Self> {
        let header = read_header_with_config(&mut src, &config)?;
        let padding = header.padding();
        if padding > 0 {
            debug!("skipping {padding} header extension bytes");
            if skip(&mut src, u64::from(padding))? != u64::from(padding) {
                return Err(Error::MalformedHeader("truncated header extension"));
            }
        }
        Ok(Self { src, header, config, state: FramerState::AwaitingFirstPointer, pending: 0 })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Decode the next tag.
    ///
    /// Returns `Ok(None)` when the stream ends on a tag boundary. After an
    /// error for which [`Error::is_recoverable`] is true, the decoder sits
    /// at the start of the next tag and can be called again.
    pub fn decode(&mut self) -> Result<Option<Tag<PayloadReader<'_, R>>>> {
        if self.pending > 0 {
            debug!("skipping {} bytes left in the previous tag", self.pending);
            PayloadReader::new(&mut self.src, &mut self.pending).discard()?;
        }

        let mut pointer = [0u8; 4];
        if !read_frame_field(&mut self.src, &mut pointer, "truncated tag size field")? {
            return Ok(None);
        }
        let pointer = BigEndian::read_u32(&pointer);
        match self.state {
            FramerState::AwaitingFirstPointer => {
                if pointer != 0 {
                    return Err(Error::Framing("non-zero initial pointer"));
                }
            },
            FramerState::Streaming { previous_tag_size } => {
                if pointer != previous_tag_size {
                    debug!("previous tag size field is {pointer}, expected {previous_tag_size}");
                }
            },
        }

        let mut buf = [0u8; TAG_HEADER_LENGTH as usize];
        if !read_frame_field(&mut self.src, &mut buf, "truncated tag header")? {
            return Ok(None);
        }
        let head = TagHeader::parse(&buf);
        self.state = FramerState::Streaming { previous_tag_size: head.encoded_size() };
        self.pending = u64::from(head.data_size);

        let tag_type = TagType::from(head.tag_type);
        let mut payload = PayloadReader::new(&mut self.src, &mut self.pending);

        let decoded = match self.config.max_script_data_size {
            Some(limit) if tag_type == TagType::ScriptData && head.data_size > limit => {
                Err(Error::ResourceLimitExceeded("script data size limit exceeded"))
            },
            _ => read_tag_data(tag_type, &mut payload, &self.config),
        };

        match decoded {
            Ok(data) => Ok(Some(Tag {
                timestamp: head.timestamp,
                stream_id: head.stream_id,
                data: attach_payload(data, payload),
            })),
            Err(e) => {
                if let Err(skip_err) = payload.discard() {
                    warn!("tag failed to decode ({e}) and its remainder could not be skipped");
                    return Err(skip_err);
                }
                Err(e)
            },
        }
    }

    /// Give back the source, positioned wherever decoding stopped.
    pub fn into_inner(self) -> R {
        self.src
    }
}

/// Writes an FLV stream one tag at a time.
///
/// Call [`Encoder::finish`] after the last tag so the stream ends with that
/// tag's size field.
pub struct Encoder<W> {
    dst: W,
    header: Header,
    state: FramerState,
    buf: std::vec::Vec<u8>,
}

impl<W: Write> Encoder<W> {
    /// Write a version 1 header with the given flags.
    pub fn new(dst: W, flags: Flags) -> Result<Self> {
        Self::with_header(dst, Header::new(flags))
    }

    /// Write `header`. Its body offset is always written as 9.
    pub fn with_header(mut dst: W, mut header: Header) -> Result<Self> {
        header.body_offset = HEADER_LENGTH;
        write_header(&mut dst, &header)?;
        Ok(Self { dst, header, state: FramerState::AwaitingFirstPointer, buf: std::vec::Vec::new() })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Write the size field for the previous tag, then `tag`.
    ///
    /// The payload is read to its end. Returns the encoded size of the tag,
    /// which is what the next size field will hold.
    pub fn encode<P: Read>(&mut self, mut tag: Tag<P>) -> Result<u32> {
        if tag.stream_id > MAX_DATA_SIZE {
            return Err(Error::InvalidData("stream id exceeds 24 bits"));
        }

        self.buf.clear();
        write_tag_data(&mut self.buf, &mut tag.data)?;
        let data_size = u32::try_from(self.buf.len())
            .ok()
            .filter(|&size| size <= MAX_DATA_SIZE)
            .ok_or(Error::InvalidData("tag data exceeds 24-bit size"))?;

        let mut head = ArrayVec::<u8, 15>::new();
        let mut field = [0u8; 4];
        BigEndian::write_u32(&mut field, self.previous_tag_size());
        head.extend(field);
        head.push(tag.tag_type().into());
        BigEndian::write_u32(&mut field, data_size);
        head.extend(field[1..].iter().copied());
        BigEndian::write_u32(&mut field, tag.timestamp);
        // low 24 bits, then the extension byte
        head.extend(field[1..].iter().copied());
        head.push(field[0]);
        BigEndian::write_u32(&mut field, tag.stream_id);
        head.extend(field[1..].iter().copied());

        self.dst.write_all(&head)?;
        self.dst.write_all(&self.buf)?;

        let encoded_size = TAG_HEADER_LENGTH + data_size;
        self.state = FramerState::Streaming { previous_tag_size: encoded_size };
        Ok(encoded_size)
    }

    fn previous_tag_size(&self) -> u32 {
        match self.state {
            FramerState::AwaitingFirstPointer => 0,
            FramerState::Streaming { previous_tag_size } => previous_tag_size,
        }
    }

    /// Write the trailing size field, flush, and give back the sink.
    pub fn finish(mut self) -> Result<W> {
        let size = self.previous_tag_size();
        self.dst.write_u32::<BigEndian>(size)?;
        self.dst.flush()?;
        Ok(self.dst)
    }
}

#[cfg(test)]
const TWO_TAGS: &[u8] = &[
    0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09,
    0x00, 0x00, 0x00, 0x00,
    // audio, AAC raw, "test"
    0x08, 0x00, 0x00, 0x06, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x00,
    0xaf, 0x01, b't', b'e', b's', b't',
    0x00, 0x00, 0x00, 0x11,
    // video, VP6 inter frame, 2 bytes
    0x09, 0x00, 0x00, 0x03, 0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00,
    0x24, 0x01, 0x02,
    0x00, 0x00, 0x00, 0x0e,
];

#[test]
fn tag_header_extended_timestamp() {
    let head = TagHeader::parse(&[0x09, 0x00, 0x00, 0x01, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(head.timestamp, 16_777_215);
    let head = TagHeader::parse(&[0x09, 0x00, 0x00, 0x01, 0xff, 0xff, 0xff, 0xf0, 0x00, 0x00, 0x00]);
    assert_eq!(head.timestamp, 0xf0ff_ffff);
    assert_eq!(head.encoded_size(), 12);
}

#[test]
fn decode_two_tags() {
    let mut dec = Decoder::new(TWO_TAGS).unwrap();
    assert!(dec.header().flags.has_audio());

    let mut tag = dec.decode().unwrap().unwrap();
    assert_eq!(tag.tag_type(), TagType::Audio);
    assert_eq!(tag.timestamp, 10);
    let payload = tag.data.payload_mut().unwrap().read_into_try_vec().unwrap();
    assert_eq!(payload, b"test".as_ref());
    drop(tag);

    let tag = dec.decode().unwrap().unwrap();
    assert_eq!(tag.tag_type(), TagType::Video);
    assert_eq!(tag.timestamp, 20);
    drop(tag);

    assert!(dec.decode().unwrap().is_none());
    assert!(dec.decode().unwrap().is_none());
}

#[test]
fn decode_skips_unread_payload() {
    let mut dec = Decoder::new(TWO_TAGS).unwrap();
    // payload left untouched
    assert_eq!(dec.decode().unwrap().unwrap().tag_type(), TagType::Audio);
    assert_eq!(dec.decode().unwrap().unwrap().tag_type(), TagType::Video);
}

#[test]
fn decode_non_zero_first_pointer() {
    let mut bin = TWO_TAGS.to_vec();
    bin[12] = 0x01;
    let mut dec = Decoder::new(bin.as_slice()).unwrap();
    assert!(matches!(dec.decode(), Err(Error::Framing("non-zero initial pointer"))));
}

#[test]
fn decode_ignores_wrong_later_pointer() {
    use crate::tag::{TagData, VideoData};
    use crate::types::{AvcPacketType, CodecId, FrameType};

    let mut bin = TWO_TAGS.to_vec();
    bin[30..34].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    let mut dec = Decoder::new(bin.as_slice()).unwrap();
    assert_eq!(dec.decode().unwrap().unwrap().tag_type(), TagType::Audio);

    let tag = dec
        .decode()
        .unwrap()
        .unwrap()
        .map_payload(|mut p| p.read_into_try_vec())
        .unwrap();
    assert_eq!(tag.timestamp, 20);
    assert_eq!(tag.stream_id, 0);
    match tag.data {
        TagData::Video(VideoData { frame_type, codec_id, avc_packet_type, composition_time, data }) => {
            assert_eq!(frame_type, FrameType::InterFrame);
            assert_eq!(codec_id, CodecId::Vp6);
            assert_eq!(avc_packet_type, AvcPacketType::SequenceHeader);
            assert_eq!(composition_time, 0);
            assert_eq!(data, [0x01u8, 0x02].as_ref());
        },
        _ => panic!("expected video"),
    }
    assert!(dec.decode().unwrap().is_none());
}

#[test]
fn decode_truncated_header_extension() {
    let mut bin = TWO_TAGS[..9].to_vec();
    bin[8] = 0x0d;
    bin.extend_from_slice(&[0xee, 0xee]);
    assert!(matches!(Decoder::new(bin.as_slice()).err(), Some(Error::MalformedHeader("truncated header extension"))));

    bin.extend_from_slice(&[0xee, 0xee, 0x00, 0x00, 0x00, 0x00]);
    let mut dec = Decoder::new(bin.as_slice()).unwrap();
    assert!(dec.decode().unwrap().is_none());
}

#[test]
fn decode_truncated_pointer() {
    let mut dec = Decoder::new(&TWO_TAGS[..11]).unwrap();
    assert!(matches!(dec.decode(), Err(Error::Framing("truncated tag size field"))));
}

#[test]
fn decode_truncated_payload_source() {
    let mut dec = Decoder::new(&TWO_TAGS[..27]).unwrap();
    let mut tag = dec.decode().unwrap().unwrap();
    assert!(tag.data.payload_mut().unwrap().read_into_try_vec().is_err());
}

#[test]
fn encode_two_tags() {
    let mut dec = Decoder::new(TWO_TAGS).unwrap();
    let mut enc = Encoder::new(std::vec::Vec::new(), Flags::AUDIO | Flags::VIDEO).unwrap();
    while let Some(tag) = dec.decode().unwrap() {
        enc.encode(tag).unwrap();
    }
    assert_eq!(enc.finish().unwrap(), TWO_TAGS);
}

#[test]
fn encode_nothing() {
    let out = Encoder::new(std::vec::Vec::new(), Flags::NONE).unwrap().finish().unwrap();
    assert_eq!(out, [0x46, 0x4c, 0x56, 0x01, 0x00, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00]);
    let mut dec = Decoder::new(out.as_slice()).unwrap();
    assert!(dec.decode().unwrap().is_none());
}
