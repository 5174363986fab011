use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::MemoryError;

/// Text encodings understood by string reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// Byte order taken from a leading BOM, big-endian without one.
    Utf16,
    Utf16Le,
    Utf16Be,
    Ascii,
    Latin1,
}

impl Encoding {
    pub fn platform_default() -> Self {
        Self::Utf8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Utf8 => "UTF-8",
            Self::Utf16 => "UTF-16",
            Self::Utf16Le => "UTF-16LE",
            Self::Utf16Be => "UTF-16BE",
            Self::Ascii => "US-ASCII",
            Self::Latin1 => "ISO-8859-1",
        }
    }

    /// Decodes `bytes`, stopping at the first NUL character. Invalid sequences become
    /// U+FFFD.
    pub fn decode(self, bytes: &[u8]) -> String {
        let mut text = match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Utf16 => match bytes {
                [0xFE, 0xFF, rest @ ..] => decode_utf16::<BigEndian>(rest),
                [0xFF, 0xFE, rest @ ..] => decode_utf16::<LittleEndian>(rest),
                _ => decode_utf16::<BigEndian>(bytes),
            },
            Self::Utf16Le => decode_utf16::<LittleEndian>(bytes),
            Self::Utf16Be => decode_utf16::<BigEndian>(bytes),
            Self::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                .collect(),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };

        if let Some(end) = text.find('\0') {
            text.truncate(end);
        }
        text
    }

    /// Encodes `text`. Characters the encoding cannot represent become `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Utf16 => {
                let mut bytes = vec![0xFE, 0xFF];
                bytes.extend(encode_utf16::<BigEndian>(text));
                bytes
            }
            Self::Utf16Le => encode_utf16::<LittleEndian>(text),
            Self::Utf16Be => encode_utf16::<BigEndian>(text),
            Self::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

fn decode_utf16<B: ByteOrder>(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(B::read_u16).collect();
    String::from_utf16_lossy(&units)
}

fn encode_utf16<B: ByteOrder>(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        let mut buf = [0u8; 2];
        B::write_u16(&mut buf, unit);
        bytes.extend_from_slice(&buf);
    }
    bytes
}

impl FromStr for Encoding {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "utf-16" | "utf16" => Ok(Self::Utf16),
            "utf-16le" | "utf16le" => Ok(Self::Utf16Le),
            "utf-16be" | "utf16be" => Ok(Self::Utf16Be),
            "us-ascii" | "ascii" => Ok(Self::Ascii),
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Ok(Self::Latin1),
            _ => Err(MemoryError::UnsupportedEncoding(s.to_string())),
        }
    }
}
