// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::io::Read;

use zenflv::amf0::Value;
use zenflv::{
    AacPacketType, AudioData, AvcPacketType, CodecId, DecodeConfig, Decoder, Encoder, Error, Flags, FrameType,
    Header, PayloadReader, ScriptData, ScriptDataError, SoundFormat, SoundRate, SoundSize, SoundType, Tag, TagData,
    TagType, VideoData,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

fn buffered<R: Read>(tag: Tag<PayloadReader<'_, R>>) -> Tag<Vec<u8>> {
    tag.map_payload(|mut payload| {
        let mut data = Vec::new();
        payload.read_to_end(&mut data).map(|_| data)
    })
    .expect("payload read failed")
}

fn encode_all(tags: &[Tag<Vec<u8>>]) -> Vec<u8> {
    let mut enc = Encoder::new(Vec::new(), Flags::AUDIO | Flags::VIDEO).expect("header");
    for tag in tags {
        enc.encode(tag.as_reader()).expect("encode failed");
    }
    enc.finish().expect("finish failed")
}

fn decode_all(bin: &[u8]) -> Vec<Tag<Vec<u8>>> {
    let mut dec = Decoder::new(bin).expect("header");
    let mut tags = Vec::new();
    while let Some(tag) = dec.decode().expect("decode failed") {
        tags.push(buffered(tag));
    }
    tags
}

fn file_with_tag(tag_body: &[u8]) -> Vec<u8> {
    let mut bin = vec![0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00];
    bin.extend_from_slice(tag_body);
    bin
}

fn aac(packet_type: AacPacketType, timestamp: u32, data: &[u8]) -> Tag<Vec<u8>> {
    Tag {
        timestamp,
        stream_id: 0,
        data: TagData::Audio(AudioData {
            sound_format: SoundFormat::Aac,
            sound_rate: SoundRate::Rate44kHz,
            sound_size: SoundSize::Bits16,
            sound_type: SoundType::Stereo,
            aac_packet_type: packet_type,
            data: data.to_vec(),
        }),
    }
}

fn avc(frame_type: FrameType, composition_time: i32, timestamp: u32, data: &[u8]) -> Tag<Vec<u8>> {
    Tag {
        timestamp,
        stream_id: 0,
        data: TagData::Video(VideoData {
            frame_type,
            codec_id: CodecId::Avc,
            avc_packet_type: AvcPacketType::Nalu,
            composition_time,
            data: data.to_vec(),
        }),
    }
}

#[test]
fn round_trip_mixed_stream() {
    init_logger();
    let tags = vec![
        Tag {
            timestamp: 0,
            stream_id: 0,
            data: TagData::ScriptData(ScriptData {
                entries: vec![
                    ("onMetaData".into(), Value::EcmaArray {
                        entries: vec![amf::Pair { key: "duration".into(), value: Value::Number(12.5) }],
                    }),
                    ("onMetaData".into(), Value::Boolean(false)),
                ],
            }),
        },
        aac(AacPacketType::SequenceHeader, 0, &[0x12, 0x10]),
        avc(FrameType::KeyFrame, 0, 0, &[0x00, 0x00, 0x00, 0x01, 0x65]),
        aac(AacPacketType::Raw, 23, b"frame"),
        avc(FrameType::InterFrame, -8_388_608, 33, &[0x41]),
        avc(FrameType::DisposableInterFrame, 8_388_607, 0xf0ff_ffff, &[]),
        Tag {
            timestamp: 40,
            stream_id: 0x00ab_cdef,
            data: TagData::Audio(AudioData {
                sound_format: SoundFormat::Unknown(12),
                sound_rate: SoundRate::Rate11kHz,
                sound_size: SoundSize::Bits8,
                sound_type: SoundType::Mono,
                aac_packet_type: AacPacketType::SequenceHeader,
                data: vec![1, 2, 3],
            }),
        },
        Tag {
            timestamp: 41,
            stream_id: 0,
            data: TagData::Video(VideoData {
                frame_type: FrameType::Unknown(9),
                codec_id: CodecId::Vp6Alpha,
                avc_packet_type: AvcPacketType::SequenceHeader,
                composition_time: 0,
                data: vec![0xde, 0xad],
            }),
        },
    ];

    let bin = encode_all(&tags);
    assert_eq!(decode_all(&bin), tags);
}

#[test]
fn header_round_trip() {
    let header = Header::new(Flags::VIDEO);
    let mut bin = Vec::new();
    zenflv::write_header(&mut bin, &header).unwrap();
    assert_eq!(zenflv::read_header(&mut bin.as_slice()).unwrap(), header);
    assert_eq!(header.body_offset, 9);
}

#[test]
fn header_padding_is_skipped() {
    let mut bin = vec![0x46, 0x4c, 0x56, 0x01, 0x04, 0x00, 0x00, 0x00, 0x0d, 0xee, 0xee, 0xee, 0xee];
    bin.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    bin.extend_from_slice(&[0x08, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2e]);
    let mut dec = Decoder::new(bin.as_slice()).unwrap();
    assert_eq!(dec.header().body_offset, 13);
    assert_eq!(dec.header().flags, Flags::AUDIO);
    let tag = buffered(dec.decode().unwrap().unwrap());
    match tag.data {
        TagData::Audio(a) => {
            assert_eq!(a.sound_format, SoundFormat::Mp3);
            assert_eq!(a.sound_rate, SoundRate::Rate44kHz);
            assert_eq!(a.sound_size, SoundSize::Bits16);
            assert_eq!(a.sound_type, SoundType::Mono);
            assert!(a.data.is_empty());
        },
        _ => panic!("expected audio"),
    }
}

#[test]
fn non_zero_first_pointer() {
    let mut bin = vec![0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x0b];
    bin.extend_from_slice(&[0x08, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2e]);
    let mut dec = Decoder::new(bin.as_slice()).unwrap();
    match dec.decode() {
        Err(Error::Framing(_)) => {},
        other => panic!("unexpected {:?}", other.map(|t| t.map(|t| t.tag_type()))),
    }
}

#[test]
fn bad_signature() {
    let bin = [0x46, 0x4c, 0x41, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00];
    assert!(matches!(Decoder::new(&bin[..]).err(), Some(Error::MalformedHeader(_))));
}

#[test]
fn skip_broken_tag() {
    init_logger();
    let bin: &[u8] = &[
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
        0x09, 0x00, 0x00, 0x05, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00,
        0x12, 0x02, 0x03, 0x04, 0x05,
        0x00, 0x00, 0x00, 0x10,
    ];
    let mut dec = Decoder::new(bin).unwrap();

    let err = dec.decode().err().expect("script data is broken");
    assert!(matches!(err, Error::ScriptData { pair: 0, offset: 0, .. }));
    assert!(err.is_recoverable());

    let tag = buffered(dec.decode().unwrap().unwrap());
    assert_eq!(tag.tag_type(), TagType::Video);
    assert_eq!(tag, Tag {
        timestamp: 7,
        stream_id: 0,
        data: TagData::Video(VideoData {
            frame_type: FrameType::KeyFrame,
            codec_id: CodecId::SorensonH263,
            avc_packet_type: AvcPacketType::SequenceHeader,
            composition_time: 0,
            data: vec![0x02, 0x03, 0x04, 0x05],
        }),
    });
    assert!(dec.decode().unwrap().is_none());
}

#[test]
fn skip_truncated_avc_and_unknown_type() {
    let mut body = vec![
        // AVC tag with only 2 data bytes
        0x09, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x17, 0x01,
        0x00, 0x00, 0x00, 0x0d,
        // tag type 0x0f
        0x0f, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xaa, 0xbb, 0xcc,
        0x00, 0x00, 0x00, 0x0e,
    ];
    body.extend_from_slice(&[0x08, 0x00, 0x00, 0x02, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0xaf, 0x01]);
    let bin = file_with_tag(&body);
    let mut dec = Decoder::new(bin.as_slice()).unwrap();

    assert!(matches!(dec.decode().err(), Some(Error::TruncatedPayload)));
    assert!(matches!(dec.decode().err(), Some(Error::UnsupportedTagType(0x0f))));
    assert_eq!(buffered(dec.decode().unwrap().unwrap()), aac(AacPacketType::Raw, 5, &[]));
    assert!(dec.decode().unwrap().is_none());
}

#[test]
fn extended_timestamp() {
    let bin = file_with_tag(&[
        0x08, 0x00, 0x00, 0x01, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x2e,
        0x00, 0x00, 0x00, 0x0c,
        0x08, 0x00, 0x00, 0x01, 0xff, 0xff, 0xff, 0xf0, 0x00, 0x00, 0x00, 0x2e,
    ]);
    let tags = decode_all(&bin);
    assert_eq!(tags[0].timestamp, 16_777_215);
    assert_eq!(tags[1].timestamp, 4_043_309_055);
    assert_eq!(encode_all(&tags), [&bin[..], &[0x00, 0x00, 0x00, 0x0c]].concat());
}

#[test]
fn signed_composition_time() {
    let bin = file_with_tag(&[
        0x09, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x27, 0x01, 0xff, 0xff, 0x00,
        0x00, 0x00, 0x00, 0x10,
        0x09, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x27, 0x01, 0x00, 0x00, 0x00,
    ]);
    let tags = decode_all(&bin);
    let times: Vec<i32> = tags
        .iter()
        .map(|t| match &t.data {
            TagData::Video(v) => v.composition_time,
            _ => panic!("expected video"),
        })
        .collect();
    assert_eq!(times, [-256, 0]);
}

#[test]
fn aac_sequence_header_bytes() {
    let bin = encode_all(&[aac(AacPacketType::SequenceHeader, 0, b"test")]);
    // header + first pointer + tag header
    let body = &bin[9 + 4 + 11..];
    assert_eq!(&body[..6], [0xaf, 0x00, b't', b'e', b's', b't']);
    assert_eq!(&body[6..], [0x00, 0x00, 0x00, 0x11]);
}

#[test]
fn empty_script_data() {
    let bin = file_with_tag(&[0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    let tags = decode_all(&bin);
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].data, TagData::ScriptData(ScriptData::default()));
}

#[test]
fn streamed_payload_passthrough() {
    let frame: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();
    let bin = encode_all(&[avc(FrameType::KeyFrame, 0, 0, &frame), aac(AacPacketType::Raw, 1, b"x")]);

    let mut dec = Decoder::new(bin.as_slice()).unwrap();
    let mut out = Encoder::new(Vec::new(), Flags::AUDIO | Flags::VIDEO).unwrap();
    {
        let mut tag = dec.decode().unwrap().unwrap();
        let payload = tag.data.payload_mut().unwrap();
        assert_eq!(payload.bytes_left(), 100_000);
        let mut start = [0u8; 10];
        payload.read_exact(&mut start).unwrap();
        assert_eq!(payload.bytes_left(), 99_990);
        // the rest is left for the decoder to skip
    }
    let tag = dec.decode().unwrap().unwrap();
    assert_eq!(tag.tag_type(), TagType::Audio);
    out.encode(tag).unwrap();
    let out = out.finish().unwrap();
    assert_eq!(decode_all(&out), vec![aac(AacPacketType::Raw, 1, b"x")]);
}

#[test]
fn explicit_discard() {
    let bin = encode_all(&[avc(FrameType::KeyFrame, 0, 0, &[9; 64]), aac(AacPacketType::Raw, 2, b"y")]);
    let mut dec = Decoder::new(bin.as_slice()).unwrap();
    let mut tag = dec.decode().unwrap().unwrap();
    tag.data.payload_mut().unwrap().discard().unwrap();
    assert_eq!(tag.data.payload_mut().unwrap().bytes_left(), 0);
    drop(tag);
    assert_eq!(buffered(dec.decode().unwrap().unwrap()), aac(AacPacketType::Raw, 2, b"y"));
}

#[test]
fn eager_read_and_rewrite() {
    let tags = vec![aac(AacPacketType::SequenceHeader, 0, &[0x12, 0x10]), avc(FrameType::KeyFrame, 40, 0, b"idr")];
    let bin = encode_all(&tags);
    let flv = zenflv::read_flv(&mut bin.as_slice()).unwrap();
    assert_eq!(flv.header, Header::new(Flags::AUDIO | Flags::VIDEO));
    assert_eq!(flv.tags.len(), 2);

    let mut enc = Encoder::new(Vec::new(), flv.header.flags).unwrap();
    for tag in flv.tags.iter() {
        enc.encode(tag.as_reader()).unwrap();
    }
    assert_eq!(enc.finish().unwrap(), bin);
}

#[test]
fn oversized_stream_id_is_rejected() {
    let mut tag = aac(AacPacketType::Raw, 0, b"");
    tag.stream_id = 0x0100_0000;
    let mut enc = Encoder::new(Vec::new(), Flags::AUDIO).unwrap();
    assert!(matches!(enc.encode(tag.as_reader()), Err(Error::InvalidData(_))));
}

#[test]
fn lenient_config_accepts_short_body_offset() {
    let bin = [0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    assert!(Decoder::new(&bin[..]).is_err());
    let mut dec = Decoder::with_config(&bin[..], DecodeConfig::default().lenient(true)).unwrap();
    assert_eq!(dec.header().body_offset, 9);
    assert!(dec.decode().unwrap().is_none());
}

#[test]
fn script_length_prefix_beyond_tag() {
    init_logger();
    let config = DecodeConfig::default().with_max_script_data_size(64).with_peak_memory_limit(1024);
    let mut body = vec![
        0x12, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x02, 0x00, 0x01, b'a', 0x0c, 0xff, 0xff, 0xff, 0xf0,
        0x00, 0x00, 0x00, 0x14,
    ];
    body.extend_from_slice(&[0x08, 0x00, 0x00, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x2e]);
    let bin = file_with_tag(&body);

    let mut dec = Decoder::with_config(bin.as_slice(), config.clone()).unwrap();
    let err = dec.decode().err().expect("length prefix overruns the tag");
    assert!(matches!(err, Error::ScriptData { pair: 0, offset: 0, reason: ScriptDataError::Malformed(_) }));
    assert!(err.is_recoverable());
    assert_eq!(dec.decode().unwrap().unwrap().timestamp, 3);
    assert!(dec.decode().unwrap().is_none());

    let flv = zenflv::read_flv_with_config(&mut bin.as_slice(), &config.lenient(true)).unwrap();
    assert_eq!(flv.tags.len(), 1);
}

#[test]
fn wrong_back_pointer_after_first_tag() {
    let bin = file_with_tag(&[
        0x08, 0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2e,
        0xde, 0xad, 0xbe, 0xef,
        0x09, 0x00, 0x00, 0x06, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x07, 0x17, 0x01, 0x00, 0x00, 0x00, 0x21,
    ]);
    let tags = decode_all(&bin);
    assert_eq!(tags.len(), 2);
    assert_eq!(tags[1], Tag {
        timestamp: 2,
        stream_id: 7,
        data: TagData::Video(VideoData {
            frame_type: FrameType::KeyFrame,
            codec_id: CodecId::Avc,
            avc_packet_type: AvcPacketType::Nalu,
            composition_time: 0,
            data: vec![0x21],
        }),
    });
}
