// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire enumerations for the FLV tag header and the audio/video sub-headers.
//!
//! Every field keeps the raw value in `Unknown` when no symbolic name
//! matches, so reserved values survive a decode/encode cycle. Values compare
//! by what they put on the wire: `SoundFormat::Unknown(10) == SoundFormat::Aac`.

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $value:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )*
            /// A value without an assigned meaning, kept as read.
            Unknown(u8),
        }

        impl From<u8> for $name {
            fn from(v: u8) -> Self {
                match v {
                    $( $value => Self::$variant, )*
                    _ => Self::Unknown(v),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(v: $name) -> u8 {
                match v {
                    $( $name::$variant => $value, )*
                    $name::Unknown(v) => v,
                }
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                u8::from(*self) == u8::from(*other)
            }
        }

        impl Eq for $name {}

        impl std::hash::Hash for $name {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                u8::from(*self).hash(state);
            }
        }
    };
}

wire_enum! {
    /// Tag type byte. See FLV spec § E.4.1
    TagType {
        Audio => 8,
        Video => 9,
        ScriptData => 18,
    }
}

wire_enum! {
    /// Upper nibble of the audio sub-header.
    SoundFormat {
        LinearPcmPlatformEndian => 0,
        Adpcm => 1,
        Mp3 => 2,
        LinearPcmLittleEndian => 3,
        Nellymoser16kHzMono => 4,
        Nellymoser8kHzMono => 5,
        Nellymoser => 6,
        G711ALaw => 7,
        G711MuLaw => 8,
        Reserved => 9,
        Aac => 10,
        Speex => 11,
        Mp3At8kHz => 14,
        DeviceSpecific => 15,
    }
}

wire_enum! {
    SoundRate {
        Rate5_5kHz => 0,
        Rate11kHz => 1,
        Rate22kHz => 2,
        Rate44kHz => 3,
    }
}

wire_enum! {
    SoundSize {
        Bits8 => 0,
        Bits16 => 1,
    }
}

wire_enum! {
    SoundType {
        Mono => 0,
        Stereo => 1,
    }
}

wire_enum! {
    /// Only meaningful when the sound format is AAC.
    AacPacketType {
        SequenceHeader => 0,
        Raw => 1,
    }
}

wire_enum! {
    /// Upper nibble of the video sub-header.
    FrameType {
        KeyFrame => 1,
        InterFrame => 2,
        DisposableInterFrame => 3,
        GeneratedKeyFrame => 4,
        InfoCommandFrame => 5,
    }
}

wire_enum! {
    /// Lower nibble of the video sub-header.
    CodecId {
        Jpeg => 1,
        SorensonH263 => 2,
        ScreenVideo => 3,
        Vp6 => 4,
        Vp6Alpha => 5,
        ScreenVideo2 => 6,
        Avc => 7,
    }
}

wire_enum! {
    /// Only meaningful when the codec is AVC.
    AvcPacketType {
        SequenceHeader => 0,
        Nalu => 1,
        EndOfSequence => 2,
    }
}

impl Default for AacPacketType {
    fn default() -> Self {
        Self::SequenceHeader
    }
}

impl Default for AvcPacketType {
    fn default() -> Self {
        Self::SequenceHeader
    }
}

#[test]
fn known_values_map_both_ways() {
    assert_eq!(TagType::from(18), TagType::ScriptData);
    assert_eq!(u8::from(TagType::Video), 9);
    assert_eq!(SoundFormat::from(10), SoundFormat::Aac);
    assert_eq!(u8::from(CodecId::Avc), 7);
    assert_eq!(AvcPacketType::from(2), AvcPacketType::EndOfSequence);
}

#[test]
fn reserved_values_are_kept() {
    assert_eq!(SoundFormat::from(12), SoundFormat::Unknown(12));
    assert_eq!(u8::from(SoundFormat::Unknown(13)), 13);
    assert_eq!(FrameType::from(0), FrameType::Unknown(0));
    assert_eq!(TagType::from(0x2a), TagType::Unknown(0x2a));
}

#[test]
fn unknown_spelling_of_a_known_value() {
    assert_eq!(SoundFormat::Unknown(10), SoundFormat::Aac);
    assert_eq!(CodecId::Unknown(7), CodecId::Avc);
    assert_ne!(CodecId::Unknown(8), CodecId::Avc);

    let mut seen = std::collections::HashSet::new();
    seen.insert(TagType::Unknown(9));
    assert!(seen.contains(&TagType::Video));
}
