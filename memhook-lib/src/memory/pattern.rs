use std::str::FromStr;

use crate::MemoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternByte {
    Byte(u8),
    Any,
}

impl FromStr for PatternByte {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "??" | "?" => Ok(Self::Any),
            _ => {
                let byte = u8::from_str_radix(s, 16)
                    .map_err(|e| MemoryError::InvalidPattern(format!("{s}: {e}")))?;
                Ok(Self::Byte(byte))
            }
        }
    }
}

impl PartialEq<u8> for PatternByte {
    fn eq(&self, other: &u8) -> bool {
        match self {
            Self::Byte(byte) => byte == other,
            Self::Any => true,
        }
    }
}

/// Byte signature with wildcards, written as hex pairs: `"F8 01 ?? 04 83 65"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<PatternByte>,
}

impl Pattern {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[PatternByte] {
        &self.bytes
    }

    pub fn matches(&self, candidate: &[u8]) -> bool {
        candidate.len() >= self.len()
            && Iterator::zip(self.bytes.iter(), candidate.iter()).all(|(a, b)| a == b)
    }

    /// Offset of the first match in `haystack`.
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        haystack
            .windows(self.len())
            .position(|window| self.matches(window))
    }
}

impl FromStr for Pattern {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s
            .split_ascii_whitespace()
            .map(PatternByte::from_str)
            .collect::<Result<Vec<PatternByte>, MemoryError>>()?;

        if bytes.is_empty() {
            return Err(MemoryError::InvalidPattern("pattern is empty".to_string()));
        }

        Ok(Self { bytes })
    }
}
