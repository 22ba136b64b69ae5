//! Firmware memory images.
//!
//! A [`MemoryImage`] maps 16-bit device addresses to bytes. Addresses that
//! were never loaded are unset and are never sent to the device.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;

use ihex::Record;
use thiserror::Error;

use crate::protocol::ADDRESS_SPACE;

#[derive(Clone, PartialEq, Debug, Error)]
pub enum ImageError {
    #[error("line {line}: {reason}")]
    Format { line: usize, reason: String },

    #[error("range 0x{address:05x}+{length} is outside the image")]
    Range { address: u32, length: usize },

    #[error("could not detect the firmware file format")]
    UnknownFormat,
}

/// Firmware file formats
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Format {
    /// Detect Intel HEX or TI-Text from the first character
    Auto,
    IntelHex,
    TiText,
    /// Raw bytes loaded from a base address
    Binary { base: u16 },
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Format::Auto),
            "ihex" | "intelhex" => Ok(Format::IntelHex),
            "titext" | "ti-text" => Ok(Format::TiText),
            _ => Err(format!("unknown firmware format '{}'", s)),
        }
    }
}

/// A contiguous run of bytes
#[derive(Clone, PartialEq, Debug)]
pub struct Segment {
    pub address: u16,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> u32 {
        self.address as u32 + self.data.len() as u32
    }
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct MemoryImage {
    bytes: BTreeMap<u16, u8>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a firmware description
    pub fn load(source: &[u8], format: Format) -> Result<Self, ImageError> {
        let format = match format {
            Format::Auto => detect(source)?,
            f => f,
        };

        let mut image = Self::new();
        match format {
            Format::Binary { base } => image.insert(base, source)?,
            Format::IntelHex => image.load_ihex(text(source)?)?,
            Format::TiText => image.load_titext(text(source)?)?,
            Format::Auto => return Err(ImageError::UnknownFormat),
        }

        debug!(
            "Loaded {} bytes in {} segments",
            image.len(),
            image.segments().len()
        );

        Ok(image)
    }

    /// Number of set bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, address: u16) -> Option<u8> {
        self.bytes.get(&address).copied()
    }

    /// Store `data` from `address` on, overwriting anything already present
    pub fn insert(&mut self, address: u16, data: &[u8]) -> Result<(), ImageError> {
        if address as u64 + data.len() as u64 > ADDRESS_SPACE as u64 {
            return Err(ImageError::Range {
                address: address as u32,
                length: data.len(),
            });
        }

        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(address + i as u16, *b);
        }

        Ok(())
    }

    /// Exactly `length` bytes from `start`, every one of which must be set
    pub fn get_range(&self, start: u16, length: usize) -> Result<Vec<u8>, ImageError> {
        let range_err = ImageError::Range {
            address: start as u32,
            length,
        };

        if start as u64 + length as u64 > ADDRESS_SPACE as u64 {
            return Err(range_err);
        }

        (0..length)
            .map(|i| self.get(start + i as u16).ok_or_else(|| range_err.clone()))
            .collect()
    }

    /// Overwrite-combine `other` into this image
    pub fn merge(&mut self, other: &MemoryImage) {
        self.bytes.extend(other.bytes.iter());
    }

    /// Contiguous runs in ascending address order
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments: Vec<Segment> = Vec::new();

        for (&address, &b) in &self.bytes {
            match segments.last_mut() {
                Some(s) if s.end() == address as u32 => s.data.push(b),
                _ => segments.push(Segment {
                    address,
                    data: vec![b],
                }),
            }
        }

        segments
    }

    fn load_ihex(&mut self, text: &str) -> Result<(), ImageError> {
        let mut base = 0u32;

        for (n, record) in ihex::Reader::new(text).enumerate() {
            let line = n + 1;
            let record = record.map_err(|e| ImageError::Format {
                line,
                reason: e.to_string(),
            })?;

            match record {
                Record::Data { offset, value } => {
                    let address = base + offset as u32;
                    if address as u64 + value.len() as u64 > ADDRESS_SPACE as u64 {
                        return Err(ImageError::Range {
                            address,
                            length: value.len(),
                        });
                    }
                    self.insert(address as u16, &value)?;
                }
                Record::ExtendedSegmentAddress(segment) => base = (segment as u32) * 16,
                Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
                Record::EndOfFile => break,
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => (),
            }
        }

        Ok(())
    }

    fn load_titext(&mut self, text: &str) -> Result<(), ImageError> {
        let mut address: Option<u32> = None;

        for (n, l) in text.lines().enumerate() {
            let line = n + 1;
            let l = l.trim();

            if l.is_empty() {
                continue;
            }
            if l.eq_ignore_ascii_case("q") {
                break;
            }

            if let Some(a) = l.strip_prefix('@') {
                let a = u32::from_str_radix(a.trim(), 16).map_err(|e| ImageError::Format {
                    line,
                    reason: format!("bad address '{}': {}", a, e),
                })?;
                address = Some(a);
                continue;
            }

            let start = address.ok_or_else(|| ImageError::Format {
                line,
                reason: "data before the first address line".to_string(),
            })?;

            let data = l
                .split_whitespace()
                .map(|b| {
                    u8::from_str_radix(b, 16).map_err(|e| ImageError::Format {
                        line,
                        reason: format!("bad byte '{}': {}", b, e),
                    })
                })
                .collect::<Result<Vec<u8>, _>>()?;

            if start as u64 + data.len() as u64 > ADDRESS_SPACE as u64 {
                return Err(ImageError::Range {
                    address: start,
                    length: data.len(),
                });
            }
            self.insert(start as u16, &data)?;
            address = Some(start + data.len() as u32);
        }

        Ok(())
    }

    /// Encode as Intel HEX, 16 bytes per record
    pub fn to_ihex(&self) -> Result<String, ImageError> {
        let mut records = Vec::new();

        for s in self.segments() {
            for (i, chunk) in s.data.chunks(16).enumerate() {
                records.push(Record::Data {
                    offset: s.address + (i * 16) as u16,
                    value: chunk.to_vec(),
                });
            }
        }
        records.push(Record::EndOfFile);

        ihex::create_object_file_representation(&records).map_err(|e| ImageError::Format {
            line: 0,
            reason: e.to_string(),
        })
    }

    /// Encode as TI-Text, 16 bytes per line
    pub fn to_titext(&self) -> String {
        let mut out = String::new();

        for s in self.segments() {
            let _ = writeln!(out, "@{:04X}", s.address);
            for chunk in s.data.chunks(16) {
                let line: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
                let _ = writeln!(out, "{}", line.join(" "));
            }
        }
        out.push_str("q\n");

        out
    }
}

fn text(source: &[u8]) -> Result<&str, ImageError> {
    std::str::from_utf8(source).map_err(|e| ImageError::Format {
        line: 0,
        reason: e.to_string(),
    })
}

fn detect(source: &[u8]) -> Result<Format, ImageError> {
    match source.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b':') => Ok(Format::IntelHex),
        Some(b'@') => Ok(Format::TiText),
        _ => Err(ImageError::UnknownFormat),
    }
}
