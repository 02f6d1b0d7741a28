//! Panic codes and the per-core panic records the firmware leaves behind.

use std::fmt;

use mif_primitives::{MifRamRef, Region};

/// A 16-bit panic code. Bit 15 set means the host declared the failure;
/// the low 15 bits are the subcode.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PanicCode(u16);

impl PanicCode {
    pub const HOST_ORIGIN: u16 = 0x8000;
    pub const SUBCODE_MASK: u16 = 0x7fff;

    /// Host-side subcodes.
    pub const CRC_MISMATCH: u16 = 0x01;
    pub const SERVICE_FAILURE: u16 = 0x02;
    pub const BOOT_FAILURE: u16 = 0x03;

    pub const fn host(subcode: u16) -> Self {
        Self(Self::HOST_ORIGIN | (subcode & Self::SUBCODE_MASK))
    }

    /// Fold a firmware full panic code into 15 bits.
    pub const fn firmware(full: u32) -> Self {
        Self(full as u16 & Self::SUBCODE_MASK)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn is_host(self) -> bool {
        self.0 & Self::HOST_ORIGIN != 0
    }

    #[inline]
    pub const fn subcode(self) -> u16 {
        self.0 & Self::SUBCODE_MASK
    }
}

impl fmt::Debug for PanicCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = if self.is_host() { "host" } else { "fw" };
        write!(f, "PanicCode({origin}:{:#06x})", self.subcode())
    }
}

impl fmt::Display for PanicCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

pub const PANIC_RECORD_VERSION: u32 = 1;
/// `version, full_panic_code, r0..r15, reserved, checksum`
pub const PANIC_RECORD_WORDS: usize = 20;
pub const PANIC_RECORD_BYTES: usize = PANIC_RECORD_WORDS * 4;
pub const PANIC_RECORD_CHECKSUM_SEED: u32 = 0xa5a5_a5a5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicRecordError {
    OutOfBounds,
    BadVersion(u32),
    BadChecksum { expected: u32, found: u32 },
}

impl fmt::Display for PanicRecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanicRecordError::OutOfBounds => write!(f, "panic record outside shared RAM"),
            PanicRecordError::BadVersion(v) => write!(f, "panic record version {v}"),
            PanicRecordError::BadChecksum { expected, found } => write!(
                f,
                "panic record checksum {found:#010x}, expected {expected:#010x}"
            ),
        }
    }
}

impl std::error::Error for PanicRecordError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanicRecord {
    pub full_panic_code: u32,
    pub registers: [u32; 16],
}

fn checksum(words: &[u32]) -> u32 {
    words.iter().fold(PANIC_RECORD_CHECKSUM_SEED, |acc, w| acc ^ w)
}

impl PanicRecord {
    pub fn from_words(words: &[u32; PANIC_RECORD_WORDS]) -> Result<Self, PanicRecordError> {
        if words[0] != PANIC_RECORD_VERSION {
            return Err(PanicRecordError::BadVersion(words[0]));
        }
        let expected = checksum(&words[..PANIC_RECORD_WORDS - 1]);
        let found = words[PANIC_RECORD_WORDS - 1];
        if expected != found {
            return Err(PanicRecordError::BadChecksum { expected, found });
        }
        let mut registers = [0u32; 16];
        registers.copy_from_slice(&words[2..18]);
        Ok(Self {
            full_panic_code: words[1],
            registers,
        })
    }

    pub fn to_words(&self) -> [u32; PANIC_RECORD_WORDS] {
        let mut words = [0u32; PANIC_RECORD_WORDS];
        words[0] = PANIC_RECORD_VERSION;
        words[1] = self.full_panic_code;
        words[2..18].copy_from_slice(&self.registers);
        words[PANIC_RECORD_WORDS - 1] = checksum(&words[..PANIC_RECORD_WORDS - 1]);
        words
    }

    pub fn read(region: &Region, at: MifRamRef) -> Result<Self, PanicRecordError> {
        let mut words = [0u32; PANIC_RECORD_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let r = at
                .checked_add(i as u32 * 4)
                .ok_or(PanicRecordError::OutOfBounds)?;
            *word = region
                .read_u32(r)
                .map_err(|_| PanicRecordError::OutOfBounds)?;
        }
        Self::from_words(&words)
    }

    pub fn write(&self, region: &Region, at: MifRamRef) -> Result<(), PanicRecordError> {
        for (i, word) in self.to_words().iter().enumerate() {
            let r = at
                .checked_add(i as u32 * 4)
                .ok_or(PanicRecordError::OutOfBounds)?;
            region
                .write_u32(r, *word)
                .map_err(|_| PanicRecordError::OutOfBounds)?;
        }
        Ok(())
    }

    pub fn code(&self) -> PanicCode {
        PanicCode::firmware(self.full_panic_code)
    }
}

/// What the failure worker learned about the last failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    pub code: PanicCode,
    /// One entry per core that left a valid record.
    pub records: Vec<(crate::hal::IrqTarget, PanicRecord)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mif_primitives::HeapRegion;

    #[test]
    fn code_origin_bits() {
        let host = PanicCode::host(PanicCode::CRC_MISMATCH);
        assert!(host.is_host());
        assert_eq!(host.raw(), 0x8001);
        assert_eq!(host.subcode(), 1);

        let fw = PanicCode::firmware(0xdead_f123);
        assert!(!fw.is_host());
        assert_eq!(fw.raw(), 0x7123);
    }

    #[test]
    fn record_checksum() {
        let record = PanicRecord {
            full_panic_code: 0x1234,
            registers: core::array::from_fn(|i| i as u32 * 0x11),
        };
        let mut words = record.to_words();
        assert_eq!(PanicRecord::from_words(&words), Ok(record));

        words[5] ^= 0x100;
        assert!(matches!(
            PanicRecord::from_words(&words),
            Err(PanicRecordError::BadChecksum { .. })
        ));
        words[0] = 2;
        assert_eq!(
            PanicRecord::from_words(&words),
            Err(PanicRecordError::BadVersion(2))
        );
    }

    #[test]
    fn record_in_shared_ram() {
        let heap = HeapRegion::new_zeroed(4096);
        let region = heap.region();
        let record = PanicRecord {
            full_panic_code: 0xbeef,
            registers: [7; 16],
        };
        record.write(&region, MifRamRef::new(0x100)).unwrap();
        assert_eq!(PanicRecord::read(&region, MifRamRef::new(0x100)), Ok(record));
        // Zeroed memory is not a record.
        assert_eq!(
            PanicRecord::read(&region, MifRamRef::new(0x800)),
            Err(PanicRecordError::BadVersion(0))
        );
        assert_eq!(
            PanicRecord::read(&region, MifRamRef::new(4090)),
            Err(PanicRecordError::OutOfBounds)
        );
    }
}
