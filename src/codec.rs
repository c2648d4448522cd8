// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sub-header codec for the three tag kinds.
//!
//! Decoding only consumes the sub-header of audio and video tags; the rest
//! of the bounded range stays in the source for the caller to stream.

use std::io::{Read, Write};

use arrayvec::ArrayVec;
use bitreader::BitReader;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::amf0::Value;
use crate::amf_check::check_value;
use crate::framer::MAX_DATA_SIZE;
use crate::tag::{AudioData, ScriptData, TagData, VideoData};
use crate::types::{
    AacPacketType, AvcPacketType, CodecId, FrameType, SoundFormat, SoundRate, SoundSize, SoundType, TagType,
};
use crate::{DecodeConfig, Error, PayloadReader, Result, ScriptDataError, ToU64};

const COMPOSITION_TIME_MIN: i32 = -(1 << 23);
const COMPOSITION_TIME_MAX: i32 = (1 << 23) - 1;

/// AMF0 object-end marker, written after script data by some muxers.
const OBJECT_END: [u8; 3] = [0x00, 0x00, 0x09];

/// Fill `buf` from a sub-header, reporting a short range as `TruncatedPayload`.
fn read_sub_header<T: Read>(src: &mut T, buf: &mut [u8]) -> Result<()> {
    src.read_exact(buf).map_err(|e| match Error::from(e) {
        Error::UnexpectedEOF => Error::TruncatedPayload,
        e => e,
    })
}

/// Decode the sub-header of a tag body, dispatching on the tag type.
///
/// Script data is decoded in full. For audio and video the returned value
/// has no payload yet; see [`attach_payload`].
pub(crate) fn read_tag_data<T: Read>(
    tag_type: TagType,
    src: &mut PayloadReader<'_, T>,
    config: &DecodeConfig,
) -> Result<TagData<()>> {
    Ok(match tag_type {
        TagType::Audio => TagData::Audio(read_audio_data(src)?),
        TagType::Video => TagData::Video(read_video_data(src)?),
        TagType::ScriptData => {
            let limit = config.max_script_data_size.unwrap_or(MAX_DATA_SIZE);
            TagData::ScriptData(read_script_data(src, u64::from(limit))?)
        },
        TagType::Unknown(raw) => return Err(Error::UnsupportedTagType(raw)),
    })
}

pub(crate) fn attach_payload<P>(data: TagData<()>, payload: P) -> TagData<P> {
    match data {
        TagData::Audio(a) => TagData::Audio(AudioData {
            sound_format: a.sound_format,
            sound_rate: a.sound_rate,
            sound_size: a.sound_size,
            sound_type: a.sound_type,
            aac_packet_type: a.aac_packet_type,
            data: payload,
        }),
        TagData::Video(v) => TagData::Video(VideoData {
            frame_type: v.frame_type,
            codec_id: v.codec_id,
            avc_packet_type: v.avc_packet_type,
            composition_time: v.composition_time,
            data: payload,
        }),
        TagData::ScriptData(s) => TagData::ScriptData(s),
    }
}

/// Parse an audio sub-header.
/// See FLV spec § E.4.2.1
pub(crate) fn read_audio_data<T: Read>(src: &mut T) -> Result<AudioData<()>> {
    let mut byte = [0u8; 1];
    read_sub_header(src, &mut byte)?;

    let mut bits = BitReader::new(&byte);
    let sound_format = SoundFormat::from(bits.read_u8(4)?);
    let sound_rate = SoundRate::from(bits.read_u8(2)?);
    let sound_size = SoundSize::from(bits.read_u8(1)?);
    let sound_type = SoundType::from(bits.read_u8(1)?);

    let aac_packet_type = if sound_format == SoundFormat::Aac {
        read_sub_header(src, &mut byte)?;
        AacPacketType::from(byte[0])
    } else {
        AacPacketType::default()
    };

    Ok(AudioData { sound_format, sound_rate, sound_size, sound_type, aac_packet_type, data: () })
}

/// Parse a video sub-header.
/// See FLV spec § E.4.3.1
pub(crate) fn read_video_data<T: Read>(src: &mut T) -> Result<VideoData<()>> {
    let mut byte = [0u8; 1];
    read_sub_header(src, &mut byte)?;

    let mut bits = BitReader::new(&byte);
    let frame_type = FrameType::from(bits.read_u8(4)?);
    let codec_id = CodecId::from(bits.read_u8(4)?);

    let (avc_packet_type, composition_time) = if codec_id == CodecId::Avc {
        let mut avc = [0u8; 4];
        read_sub_header(src, &mut avc)?;
        let mut rest = &avc[1..];
        // 24-bit two's complement
        (AvcPacketType::from(avc[0]), rest.read_i24::<BigEndian>()?)
    } else {
        (AvcPacketType::default(), 0)
    };

    Ok(VideoData { frame_type, codec_id, avc_packet_type, composition_time, data: () })
}

/// Parse (name, value) pairs until the tag's range is used up.
///
/// `expansion_limit` caps how large a single value may grow once AMF0
/// references are resolved.
/// See FLV spec § E.4.4.1
pub(crate) fn read_script_data<T: Read>(
    src: &mut PayloadReader<'_, T>,
    expansion_limit: u64,
) -> Result<ScriptData> {
    let buf = src.read_into_try_vec()?;
    let mut rest: &[u8] = &buf;
    let mut entries = std::vec::Vec::new();

    while !rest.is_empty() {
        let pair = entries.len();
        let offset = (buf.len() - rest.len()).to_u64();
        let fail = |reason: ScriptDataError| Error::ScriptData { pair, offset, reason };

        if rest == OBJECT_END {
            break;
        }

        let name = match read_value(&mut rest, expansion_limit).map_err(fail)? {
            Value::String(name) => name,
            _ => return Err(fail(ScriptDataError::NameNotString)),
        };
        let value = read_value(&mut rest, expansion_limit).map_err(fail)?;

        entries.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        entries.push((name, value));
    }

    Ok(ScriptData { entries })
}

/// Decode one AMF0 value from the front of `src` once its lengths are known to fit.
fn read_value(src: &mut &[u8], expansion_limit: u64) -> std::result::Result<Value, ScriptDataError> {
    let bytes: &[u8] = *src;
    let len = check_value(bytes, expansion_limit).map_err(ScriptDataError::Malformed)?;
    let (head, tail) = bytes.split_at(len);
    *src = tail;
    Value::read_from(head).map_err(ScriptDataError::Value)
}

/// Write the sub-header and payload of a tag body.
pub(crate) fn write_tag_data<W: Write, P: Read>(dst: &mut W, data: &mut TagData<P>) -> Result<()> {
    match data {
        TagData::Audio(a) => write_audio_data(dst, a),
        TagData::Video(v) => write_video_data(dst, v),
        TagData::ScriptData(s) => write_script_data(dst, s),
    }
}

fn packed(value: u8, bits: u32, field: &'static str) -> Result<u8> {
    if u32::from(value) >> bits != 0 {
        return Err(Error::InvalidData(field));
    }
    Ok(value)
}

pub(crate) fn write_audio_data<W: Write, P: Read>(dst: &mut W, audio: &mut AudioData<P>) -> Result<()> {
    let mut head = ArrayVec::<u8, 2>::new();
    head.push(
        packed(audio.sound_format.into(), 4, "sound format exceeds 4 bits")? << 4
            | packed(audio.sound_rate.into(), 2, "sound rate exceeds 2 bits")? << 2
            | packed(audio.sound_size.into(), 1, "sound size exceeds 1 bit")? << 1
            | packed(audio.sound_type.into(), 1, "sound type exceeds 1 bit")?,
    );
    if audio.sound_format == SoundFormat::Aac {
        head.push(audio.aac_packet_type.into());
    }
    dst.write_all(&head)?;
    std::io::copy(&mut audio.data, dst)?;
    Ok(())
}

pub(crate) fn write_video_data<W: Write, P: Read>(dst: &mut W, video: &mut VideoData<P>) -> Result<()> {
    let mut head = ArrayVec::<u8, 5>::new();
    head.push(
        packed(video.frame_type.into(), 4, "frame type exceeds 4 bits")? << 4
            | packed(video.codec_id.into(), 4, "codec id exceeds 4 bits")?,
    );
    dst.write_all(&head)?;
    if video.codec_id == CodecId::Avc {
        if !(COMPOSITION_TIME_MIN..=COMPOSITION_TIME_MAX).contains(&video.composition_time) {
            return Err(Error::InvalidData("composition time exceeds 24 bits"));
        }
        dst.write_u8(video.avc_packet_type.into())?;
        dst.write_i24::<BigEndian>(video.composition_time)?;
    }
    std::io::copy(&mut video.data, dst)?;
    Ok(())
}

pub(crate) fn write_script_data<W: Write>(dst: &mut W, script: &ScriptData) -> Result<()> {
    for (name, value) in &script.entries {
        Value::String(name.clone()).write_to(&mut *dst)?;
        value.write_to(&mut *dst)?;
    }
    Ok(())
}

#[cfg(test)]
fn decode_script(bin: &[u8]) -> Result<ScriptData> {
    let src = &mut &bin[..];
    let mut left = bin.len() as u64;
    read_script_data(&mut PayloadReader::new(src, &mut left), u64::from(MAX_DATA_SIZE))
}

#[test]
fn audio_pcm() {
    let src = &mut [0x3f, 0x01, 0x02].as_slice();
    let audio = read_audio_data(src).unwrap();
    assert_eq!(audio.sound_format, SoundFormat::LinearPcmLittleEndian);
    assert_eq!(audio.sound_rate, SoundRate::Rate44kHz);
    assert_eq!(audio.sound_size, SoundSize::Bits16);
    assert_eq!(audio.sound_type, SoundType::Stereo);
    assert_eq!(audio.aac_packet_type, AacPacketType::SequenceHeader);
    assert_eq!(*src, [0x01, 0x02]);
}

#[test]
fn audio_aac() {
    let src = &mut [0xaf, 0x01, 0xff].as_slice();
    let audio = read_audio_data(src).unwrap();
    assert_eq!(audio.sound_format, SoundFormat::Aac);
    assert_eq!(audio.aac_packet_type, AacPacketType::Raw);
    assert_eq!(*src, [0xff]);
}

#[test]
fn audio_empty() {
    let src = &mut [].as_slice();
    assert!(matches!(read_audio_data(src), Err(Error::TruncatedPayload)));
}

#[test]
fn audio_aac_without_packet_type() {
    let src = &mut [0xa0].as_slice();
    assert!(matches!(read_audio_data(src), Err(Error::TruncatedPayload)));
}

#[test]
fn audio_aac_encode() {
    let mut audio = AudioData {
        sound_format: SoundFormat::Aac,
        sound_rate: SoundRate::Rate44kHz,
        sound_size: SoundSize::Bits16,
        sound_type: SoundType::Stereo,
        aac_packet_type: AacPacketType::SequenceHeader,
        data: b"test".as_slice(),
    };
    let mut out = std::vec::Vec::new();
    write_audio_data(&mut out, &mut audio).unwrap();
    assert_eq!(out, [0xaf, 0x00, b't', b'e', b's', b't']);
}

#[test]
fn audio_encode_rejects_wide_fields() {
    let mut audio = AudioData {
        sound_format: SoundFormat::Unknown(16),
        sound_rate: SoundRate::Rate5_5kHz,
        sound_size: SoundSize::Bits8,
        sound_type: SoundType::Mono,
        aac_packet_type: AacPacketType::SequenceHeader,
        data: [].as_slice(),
    };
    let mut out = std::vec::Vec::new();
    assert!(matches!(write_audio_data(&mut out, &mut audio), Err(Error::InvalidData(_))));
}

#[test]
fn video_avc_composition_time() {
    let src = &mut [0x17, 0x01, 0xff, 0xff, 0x00, 0xaa].as_slice();
    let video = read_video_data(src).unwrap();
    assert_eq!(video.frame_type, FrameType::KeyFrame);
    assert_eq!(video.codec_id, CodecId::Avc);
    assert_eq!(video.avc_packet_type, AvcPacketType::Nalu);
    assert_eq!(video.composition_time, -256);
    assert_eq!(*src, [0xaa]);

    let src = &mut [0x27, 0x00, 0x00, 0x00, 0x00].as_slice();
    let video = read_video_data(src).unwrap();
    assert_eq!(video.frame_type, FrameType::InterFrame);
    assert_eq!(video.composition_time, 0);

    let src = &mut [0x27, 0x01, 0x80, 0x00, 0x00].as_slice();
    assert_eq!(read_video_data(src).unwrap().composition_time, -8_388_608);
    let src = &mut [0x27, 0x01, 0x7f, 0xff, 0xff].as_slice();
    assert_eq!(read_video_data(src).unwrap().composition_time, 8_388_607);
}

#[test]
fn video_non_avc() {
    let src = &mut [0x22, 0x01, 0x02].as_slice();
    let video = read_video_data(src).unwrap();
    assert_eq!(video.frame_type, FrameType::InterFrame);
    assert_eq!(video.codec_id, CodecId::SorensonH263);
    assert_eq!(video.avc_packet_type, AvcPacketType::SequenceHeader);
    assert_eq!(video.composition_time, 0);
    assert_eq!(*src, [0x01, 0x02]);
}

#[test]
fn video_truncated() {
    assert!(matches!(read_video_data(&mut [].as_slice()), Err(Error::TruncatedPayload)));
    // AVC needs at least 5 bytes
    assert!(matches!(read_video_data(&mut [0x07].as_slice()), Err(Error::TruncatedPayload)));
    assert!(matches!(read_video_data(&mut [0x17, 0x01, 0x00].as_slice()), Err(Error::TruncatedPayload)));
}

#[test]
fn video_avc_encode() {
    let mut video = VideoData {
        frame_type: FrameType::KeyFrame,
        codec_id: CodecId::Avc,
        avc_packet_type: AvcPacketType::Nalu,
        composition_time: -256,
        data: [0x65].as_slice(),
    };
    let mut out = std::vec::Vec::new();
    write_video_data(&mut out, &mut video).unwrap();
    assert_eq!(out, [0x17, 0x01, 0xff, 0xff, 0x00, 0x65]);

    video.composition_time = 1 << 23;
    video.data = [].as_slice();
    assert!(matches!(write_video_data(&mut std::vec::Vec::new(), &mut video), Err(Error::InvalidData(_))));
}

#[test]
fn script_data_empty() {
    assert_eq!(decode_script(&[]).unwrap(), ScriptData::default());
}

#[test]
fn script_data_pairs() {
    let script = ScriptData {
        entries: vec![
            ("onMetaData".into(), Value::Number(1.5)),
            ("onMetaData".into(), Value::Boolean(true)),
            ("title".into(), Value::String("clip".into())),
        ],
    };
    let mut bin = std::vec::Vec::new();
    write_script_data(&mut bin, &script).unwrap();
    assert_eq!(&bin[..4], [0x02, 0x00, 0x0a, b'o']);
    assert_eq!(decode_script(&bin).unwrap(), script);
}

#[test]
fn script_data_object_end() {
    let script = ScriptData { entries: vec![("a".into(), Value::Null)] };
    let mut bin = std::vec::Vec::new();
    write_script_data(&mut bin, &script).unwrap();
    bin.extend_from_slice(&OBJECT_END);
    assert_eq!(decode_script(&bin).unwrap(), script);
}

#[test]
fn script_data_broken() {
    // boolean marker without its byte
    match decode_script(&[0x01]) {
        Err(Error::ScriptData { pair: 0, offset: 0, .. }) => {},
        other => panic!("unexpected {other:?}"),
    }
    match decode_script(&[0xff, 0xff, 0xff, 0xff, 0xff]) {
        Err(Error::ScriptData { pair: 0, offset: 0, .. }) => {},
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn script_data_name_not_string() {
    let mut bin = std::vec::Vec::new();
    Value::String("ok".into()).write_to(&mut bin).unwrap();
    Value::Null.write_to(&mut bin).unwrap();
    let second = bin.len() as u64;
    Value::Number(3.0).write_to(&mut bin).unwrap();
    Value::Null.write_to(&mut bin).unwrap();
    match decode_script(&bin) {
        Err(Error::ScriptData { pair: 1, offset, reason: ScriptDataError::NameNotString }) => {
            assert_eq!(offset, second);
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn script_data_length_past_tag_end() {
    // name "a", then a long string claiming 0xfffffff0 bytes
    match decode_script(&[0x02, 0x00, 0x01, b'a', 0x0c, 0xff, 0xff, 0xff, 0xf0]) {
        Err(Error::ScriptData { pair: 0, offset: 0, reason: ScriptDataError::Malformed(_) }) => {},
        other => panic!("unexpected {other:?}"),
    }
    // XML document on the second pair
    match decode_script(&[0x02, 0x00, 0x01, b'a', 0x05, 0x02, 0x00, 0x01, b'b', 0x0f, 0x7f, 0xff, 0xff, 0xff]) {
        Err(Error::ScriptData { pair: 1, offset: 5, reason: ScriptDataError::Malformed(_) }) => {},
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn script_data_reference_expansion_limit() {
    // name "a", then [ [null x 10], ref 1 x 5 ]
    let mut bin = vec![0x02, 0x00, 0x01, b'a', 0x0a, 0x00, 0x00, 0x00, 0x06, 0x0a, 0x00, 0x00, 0x00, 0x0a];
    bin.extend_from_slice(&[0x05; 10]);
    for _ in 0..5 {
        bin.extend_from_slice(&[0x07, 0x00, 0x01]);
    }
    let mut left = bin.len() as u64;
    match read_script_data(&mut PayloadReader::new(&mut bin.as_slice(), &mut left), 64) {
        Err(Error::ScriptData { pair: 0, reason: ScriptDataError::Malformed(_), .. }) => {},
        other => panic!("unexpected {other:?}"),
    }

    let script = decode_script(&bin).unwrap();
    match script.get("a") {
        Some(Value::Array { entries }) => {
            assert_eq!(entries.len(), 6);
            assert_eq!(entries[5], entries[0]);
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn unknown_spelling_of_aac_and_avc_encodes_sub_header() {
    let mut audio = AudioData {
        sound_format: SoundFormat::Unknown(10),
        sound_rate: SoundRate::Rate44kHz,
        sound_size: SoundSize::Bits16,
        sound_type: SoundType::Stereo,
        aac_packet_type: AacPacketType::Raw,
        data: [0x21].as_slice(),
    };
    let mut out = std::vec::Vec::new();
    write_audio_data(&mut out, &mut audio).unwrap();
    assert_eq!(out, [0xaf, 0x01, 0x21]);
    let decoded = read_audio_data(&mut out.as_slice()).unwrap();
    assert_eq!(decoded.sound_format, audio.sound_format);
    assert_eq!(decoded.aac_packet_type, AacPacketType::Raw);

    let mut video = VideoData {
        frame_type: FrameType::KeyFrame,
        codec_id: CodecId::Unknown(7),
        avc_packet_type: AvcPacketType::Nalu,
        composition_time: 5,
        data: [].as_slice(),
    };
    let mut out = std::vec::Vec::new();
    write_video_data(&mut out, &mut video).unwrap();
    assert_eq!(out, [0x17, 0x01, 0x00, 0x00, 0x05]);
    let decoded = read_video_data(&mut out.as_slice()).unwrap();
    assert_eq!(decoded.codec_id, video.codec_id);
    assert_eq!(decoded.composition_time, 5);
}
