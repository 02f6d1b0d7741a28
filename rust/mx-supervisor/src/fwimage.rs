//! Firmware image loading, header parsing and integrity checks.
//!
//! Default header layout (little-endian):
//!
//! ```text
//!  0  magic "smxf"        4  header_crc32     8  hdr_major u16   10 hdr_minor u16
//! 12  api_major u16      14  api_minor u16   16  entry_point     20 runtime_length
//! 24  fw_crc32           28  const_crc32     32  const_length    36 header_length
//! 40  r4_panic_record    44  m4_panic_record
//! ```
//!
//! The header CRC covers `[8, header_length)`, the const CRC covers the
//! `const_length` bytes right after the header and the firmware CRC covers
//! everything after the header.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use mif_primitives::{MifRamRef, Region};
use tracing::{debug, warn};

use crate::config::MxConfig;
use crate::error::MxError;

pub const FW_MAGIC: [u8; 4] = *b"smxf";
pub const FW_HEADER_MIN_LEN: u32 = 48;

pub const SUPPORTED_HEADER_MAJOR: u16 = 1;
pub const SUPPORTED_HEADER_MINOR_MAX: u16 = 1;
pub const SUPPORTED_API_MAJOR: u16 = 1;

/// Offset the header CRC starts at: everything after the magic and the CRC itself.
const HEADER_CRC_START: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareHeader {
    pub header_crc32: u32,
    pub header_major: u16,
    pub header_minor: u16,
    pub api_major: u16,
    pub api_minor: u16,
    pub entry_point: u32,
    pub runtime_length: u32,
    pub fw_crc32: u32,
    pub const_crc32: u32,
    pub const_length: u32,
    pub header_length: u32,
    /// Panic record offset per core, indexed by `IrqTarget::index()`.
    pub panic_record_offsets: [u32; 2],
}

/// Turns the start of an image into a [`FirmwareHeader`].
pub trait HeaderParser: Send + Sync {
    fn parse(&self, image: &[u8]) -> Result<FirmwareHeader, MxError>;
}

/// Source of the firmware bytes.
pub trait FirmwareLoader: Send + Sync {
    fn load(&self) -> io::Result<Vec<u8>>;

    /// For logs.
    fn describe(&self) -> String;
}

/// Little-endian parser for the default header layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct FwHeaderParser;

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl HeaderParser for FwHeaderParser {
    fn parse(&self, image: &[u8]) -> Result<FirmwareHeader, MxError> {
        if image.len() < FW_HEADER_MIN_LEN as usize {
            return Err(MxError::ValidationFailed(format!(
                "image of {} bytes is shorter than a header",
                image.len()
            )));
        }
        if image[..4] != FW_MAGIC {
            return Err(MxError::ValidationFailed(format!(
                "bad magic {:02x?}",
                &image[..4]
            )));
        }
        Ok(FirmwareHeader {
            header_crc32: le_u32(image, 4),
            header_major: le_u16(image, 8),
            header_minor: le_u16(image, 10),
            api_major: le_u16(image, 12),
            api_minor: le_u16(image, 14),
            entry_point: le_u32(image, 16),
            runtime_length: le_u32(image, 20),
            fw_crc32: le_u32(image, 24),
            const_crc32: le_u32(image, 28),
            const_length: le_u32(image, 32),
            header_length: le_u32(image, 36),
            panic_record_offsets: [le_u32(image, 40), le_u32(image, 44)],
        })
    }
}

/// Firmware read from a file on every boot.
#[derive(Debug, Clone)]
pub struct FileFirmware {
    path: PathBuf,
}

impl FileFirmware {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl FirmwareLoader for FileFirmware {
    fn load(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Firmware held in memory.
#[derive(Debug, Clone)]
pub struct StaticFirmware(pub Vec<u8>);

impl FirmwareLoader for StaticFirmware {
    fn load(&self) -> io::Result<Vec<u8>> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        format!("<{} byte image>", self.0.len())
    }
}

/// Which section failed an integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcSection {
    Header,
    Const,
    Firmware,
}

impl CrcSection {
    fn name(self) -> &'static str {
        match self {
            CrcSection::Header => "header",
            CrcSection::Const => "const section",
            CrcSection::Firmware => "firmware",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcMismatch {
    pub section: CrcSection,
    pub expected: u32,
    pub actual: u32,
}

impl std::fmt::Display for CrcMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} crc {:#010x}, expected {:#010x}",
            self.section.name(),
            self.actual,
            self.expected
        )
    }
}

impl std::error::Error for CrcMismatch {}

impl FirmwareHeader {
    fn const_range(&self) -> std::ops::Range<usize> {
        let start = self.header_length as usize;
        start..start + self.const_length as usize
    }

    /// Version and geometry checks. Needs the image and region sizes.
    pub fn check_layout(&self, image_len: usize, region_len: usize) -> Result<(), MxError> {
        if self.header_major != SUPPORTED_HEADER_MAJOR
            || self.header_minor > SUPPORTED_HEADER_MINOR_MAX
        {
            return Err(MxError::ValidationFailed(format!(
                "header version {}.{} not supported",
                self.header_major, self.header_minor
            )));
        }
        if self.api_major != SUPPORTED_API_MAJOR {
            return Err(MxError::ValidationFailed(format!(
                "api version {}.{} not supported",
                self.api_major, self.api_minor
            )));
        }
        if self.header_length < FW_HEADER_MIN_LEN || self.header_length as usize > image_len {
            return Err(MxError::ValidationFailed(format!(
                "header length {} out of range",
                self.header_length
            )));
        }
        if self.const_range().end > image_len {
            return Err(MxError::ValidationFailed(format!(
                "const section of {} bytes runs past the image",
                self.const_length
            )));
        }
        let runtime = self.runtime_length as usize;
        if runtime < image_len || runtime > region_len {
            return Err(MxError::ValidationFailed(format!(
                "runtime length {runtime} outside [{image_len}, {region_len}]"
            )));
        }
        for offset in self.panic_record_offsets {
            if offset != 0 && offset as usize >= runtime {
                return Err(MxError::ValidationFailed(format!(
                    "panic record offset {offset:#x} outside runtime area"
                )));
            }
        }
        if self.entry_point as usize >= runtime {
            return Err(MxError::ValidationFailed(format!(
                "entry point {:#x} outside runtime area",
                self.entry_point
            )));
        }
        Ok(())
    }

    /// Check the CRCs selected by `config` over `bytes`, which holds the
    /// header and at least everything the selected checks cover.
    pub fn check_crcs(
        &self,
        bytes: &[u8],
        config: &MxConfig,
        whole_image: bool,
    ) -> Result<(), CrcMismatch> {
        let header_end = self.header_length as usize;
        if !config.skip_header_crc {
            compare(
                CrcSection::Header,
                self.header_crc32,
                &bytes[HEADER_CRC_START..header_end],
            )?;
        }
        if !config.skip_const_crc {
            compare(CrcSection::Const, self.const_crc32, &bytes[self.const_range()])?;
        }
        if whole_image && !config.skip_fw_crc {
            compare(CrcSection::Firmware, self.fw_crc32, &bytes[header_end..])?;
        }
        Ok(())
    }

    /// Re-check the header and const CRCs against the copy resident in shared RAM.
    pub fn check_resident(&self, region: &Region, config: &MxConfig) -> Result<(), MxError> {
        let len = self.const_range().end;
        let bytes = unsafe { region.slice(MifRamRef::new(0), len)? };
        self.check_crcs(bytes, config, false)
            .map_err(|e| MxError::ValidationFailed(e.to_string()))
    }
}

fn compare(section: CrcSection, expected: u32, bytes: &[u8]) -> Result<(), CrcMismatch> {
    let actual = crc32fast::hash(bytes);
    if actual != expected {
        return Err(CrcMismatch {
            section,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Parse and validate a freshly loaded image.
pub fn validate(
    parser: &dyn HeaderParser,
    image: &[u8],
    region_len: usize,
    config: &MxConfig,
) -> Result<FirmwareHeader, MxError> {
    let header = parser.parse(image)?;
    header.check_layout(image.len(), region_len)?;
    if let Err(e) = header.check_crcs(image, config, true) {
        warn!(error = %e, "firmware integrity check failed");
        return Err(MxError::ValidationFailed(e.to_string()));
    }
    debug!(
        header_major = header.header_major,
        header_minor = header.header_minor,
        api_major = header.api_major,
        api_minor = header.api_minor,
        entry = %format_args!("{:#x}", header.entry_point),
        runtime_length = header.runtime_length,
        "firmware header ok"
    );
    Ok(header)
}

/// Produces images in the default layout with correct CRCs.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    pub header_version: (u16, u16),
    pub api_version: (u16, u16),
    pub entry_point: u32,
    pub runtime_length: u32,
    pub const_section: Vec<u8>,
    pub code: Vec<u8>,
    pub panic_record_offsets: [u32; 2],
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            header_version: (1, 0),
            api_version: (1, 0),
            entry_point: FW_HEADER_MIN_LEN,
            runtime_length: 64 * 1024,
            const_section: b"mx firmware const section".to_vec(),
            code: vec![0x5a; 512],
            panic_record_offsets: [0, 0],
        }
    }
}

impl ImageBuilder {
    pub fn build(&self) -> Vec<u8> {
        let header_length = FW_HEADER_MIN_LEN;
        let mut image = vec![0u8; header_length as usize];
        image.extend_from_slice(&self.const_section);
        image.extend_from_slice(&self.code);

        let put16 = |image: &mut Vec<u8>, at: usize, v: u16| {
            image[at..at + 2].copy_from_slice(&v.to_le_bytes())
        };
        let put32 = |image: &mut Vec<u8>, at: usize, v: u32| {
            image[at..at + 4].copy_from_slice(&v.to_le_bytes())
        };

        image[..4].copy_from_slice(&FW_MAGIC);
        put16(&mut image, 8, self.header_version.0);
        put16(&mut image, 10, self.header_version.1);
        put16(&mut image, 12, self.api_version.0);
        put16(&mut image, 14, self.api_version.1);
        put32(&mut image, 16, self.entry_point);
        put32(&mut image, 20, self.runtime_length);
        let fw_crc = crc32fast::hash(&image[header_length as usize..]);
        put32(&mut image, 24, fw_crc);
        let const_end = header_length as usize + self.const_section.len();
        let const_crc = crc32fast::hash(&image[header_length as usize..const_end]);
        put32(&mut image, 28, const_crc);
        put32(&mut image, 32, self.const_section.len() as u32);
        put32(&mut image, 36, header_length);
        put32(&mut image, 40, self.panic_record_offsets[0]);
        put32(&mut image, 44, self.panic_record_offsets[1]);
        let header_crc = crc32fast::hash(&image[HEADER_CRC_START..header_length as usize]);
        put32(&mut image, 4, header_crc);
        image
    }
}
