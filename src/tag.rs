// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::amf0::Value;
use crate::types::{
    AacPacketType, AvcPacketType, CodecId, FrameType, SoundFormat, SoundRate, SoundSize, SoundType, TagType,
};

/// One framed unit of an FLV stream.
///
/// `P` is the payload carried by audio and video tags: a
/// [`PayloadReader`](crate::PayloadReader) when decoding, any
/// [`std::io::Read`] when encoding, or an owned buffer.
///
/// See FLV spec § E.4.1
#[derive(Debug, PartialEq)]
pub struct Tag<P> {
    /// Milliseconds since the start of the stream.
    pub timestamp: u32,
    /// 24 bits on the wire.
    pub stream_id: u32,
    pub data: TagData<P>,
}

#[derive(Debug, PartialEq)]
pub enum TagData<P> {
    Audio(AudioData<P>),
    Video(VideoData<P>),
    ScriptData(ScriptData),
}

/// See FLV spec § E.4.2
#[derive(Debug, PartialEq)]
pub struct AudioData<P> {
    pub sound_format: SoundFormat,
    pub sound_rate: SoundRate,
    pub sound_size: SoundSize,
    pub sound_type: SoundType,
    /// Only present on the wire for AAC.
    pub aac_packet_type: AacPacketType,
    pub data: P,
}

/// See FLV spec § E.4.3
#[derive(Debug, PartialEq)]
pub struct VideoData<P> {
    pub frame_type: FrameType,
    pub codec_id: CodecId,
    /// Only present on the wire for AVC.
    pub avc_packet_type: AvcPacketType,
    /// Presentation offset in milliseconds. Only present on the wire for AVC.
    pub composition_time: i32,
    pub data: P,
}

/// Named values from a script data tag, in stream order.
///
/// Duplicate names are all kept.
///
/// See FLV spec § E.4.4
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScriptData {
    pub entries: std::vec::Vec<(std::string::String, Value)>,
}

impl ScriptData {
    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

impl<P> Tag<P> {
    pub fn tag_type(&self) -> TagType {
        self.data.tag_type()
    }

    /// Replace the payload, keeping every header field.
    pub fn map_payload<Q, E>(self, f: impl FnOnce(P) -> Result<Q, E>) -> Result<Tag<Q>, E> {
        Ok(Tag { timestamp: self.timestamp, stream_id: self.stream_id, data: self.data.map_payload(f)? })
    }
}

impl<P: std::ops::Deref<Target = [u8]>> Tag<P> {
    /// Borrow a buffered tag in a form [`Encoder::encode`](crate::Encoder::encode) accepts.
    pub fn as_reader(&self) -> Tag<&[u8]> {
        let data = match &self.data {
            TagData::Audio(a) => TagData::Audio(AudioData {
                sound_format: a.sound_format,
                sound_rate: a.sound_rate,
                sound_size: a.sound_size,
                sound_type: a.sound_type,
                aac_packet_type: a.aac_packet_type,
                data: &*a.data,
            }),
            TagData::Video(v) => TagData::Video(VideoData {
                frame_type: v.frame_type,
                codec_id: v.codec_id,
                avc_packet_type: v.avc_packet_type,
                composition_time: v.composition_time,
                data: &*v.data,
            }),
            TagData::ScriptData(s) => TagData::ScriptData(s.clone()),
        };
        Tag { timestamp: self.timestamp, stream_id: self.stream_id, data }
    }
}

impl<P> TagData<P> {
    pub fn tag_type(&self) -> TagType {
        match self {
            Self::Audio(_) => TagType::Audio,
            Self::Video(_) => TagType::Video,
            Self::ScriptData(_) => TagType::ScriptData,
        }
    }

    /// The audio or video payload, if this kind carries one.
    pub fn payload_mut(&mut self) -> Option<&mut P> {
        match self {
            Self::Audio(a) => Some(&mut a.data),
            Self::Video(v) => Some(&mut v.data),
            Self::ScriptData(_) => None,
        }
    }

    pub fn map_payload<Q, E>(self, f: impl FnOnce(P) -> Result<Q, E>) -> Result<TagData<Q>, E> {
        Ok(match self {
            Self::Audio(a) => TagData::Audio(AudioData {
                sound_format: a.sound_format,
                sound_rate: a.sound_rate,
                sound_size: a.sound_size,
                sound_type: a.sound_type,
                aac_packet_type: a.aac_packet_type,
                data: f(a.data)?,
            }),
            Self::Video(v) => TagData::Video(VideoData {
                frame_type: v.frame_type,
                codec_id: v.codec_id,
                avc_packet_type: v.avc_packet_type,
                composition_time: v.composition_time,
                data: f(v.data)?,
            }),
            Self::ScriptData(s) => TagData::ScriptData(s),
        })
    }
}

#[test]
fn script_data_keeps_duplicates() {
    let data = ScriptData {
        entries: vec![
            ("duration".into(), Value::Number(1.0)),
            ("duration".into(), Value::Number(2.0)),
        ],
    };
    assert_eq!(data.entries.len(), 2);
    assert_eq!(data.get("duration"), Some(&Value::Number(1.0)));
    assert_eq!(data.get("width"), None);
}

#[test]
fn map_payload_keeps_fields() {
    let tag = Tag {
        timestamp: 42,
        stream_id: 0,
        data: TagData::Video(VideoData {
            frame_type: FrameType::KeyFrame,
            codec_id: CodecId::Avc,
            avc_packet_type: AvcPacketType::Nalu,
            composition_time: -3,
            data: "abc",
        }),
    };
    let mapped = tag.map_payload(|s| Ok::<_, ()>(s.len())).unwrap();
    assert_eq!(mapped.tag_type(), TagType::Video);
    assert_eq!(mapped.timestamp, 42);
    match mapped.data {
        TagData::Video(v) => {
            assert_eq!(v.composition_time, -3);
            assert_eq!(v.data, 3);
        },
        _ => panic!("expected video"),
    }
}
