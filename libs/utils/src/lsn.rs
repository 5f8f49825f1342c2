//! [`Lsn`] is the 64-bit logical byte offset into the WAL described in
//! spec §3 as `XLogPosition`. It is conventionally displayed as two 32-bit
//! hex fields `hi/lo`, and segment arithmetic is always relative to a
//! caller-supplied segment size (the default is 16 MiB, see
//! `postgres_ffi::DEFAULT_WAL_SEGMENT_SIZE`, but `Lsn` itself knows nothing
//! about the default so that tests can exercise small segment sizes).

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

#[derive(Debug, thiserror::Error)]
#[error("invalid LSN literal: {0:?}")]
pub struct LsnParseError(String);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn lo(self) -> u32 {
        self.0 as u32
    }

    /// `floor(position_lo / segment_size)`, the `segNo` field of spec §3's
    /// `SegmentName`.
    pub fn segment_number(self, seg_sz: u64) -> u64 {
        self.0 / seg_sz
    }

    /// Byte offset of this position within its segment.
    pub fn segment_offset(self, seg_sz: u64) -> u64 {
        self.0 % seg_sz
    }

    /// True when `self` sits exactly on a segment boundary (spec §3's
    /// invariant for any position used to start streaming).
    pub fn is_segment_aligned(self, seg_sz: u64) -> bool {
        self.segment_offset(seg_sz) == 0
    }

    /// Round down to the start of the segment containing `self` (spec
    /// §4.5 step 3: "align the starting position down to the nearest
    /// segment boundary").
    pub fn align_down(self, seg_sz: u64) -> Lsn {
        Lsn(self.0 - self.segment_offset(seg_sz))
    }

    /// Bytes remaining until the end of the segment containing `self`.
    pub fn remaining_in_segment(self, seg_sz: u64) -> u64 {
        seg_sz - self.segment_offset(seg_sz)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.hi(), self.lo())
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Parses the `hi/lo` hex format used by `IDENTIFY_SYSTEM`'s `xlogpos`
    /// column and by `START_REPLICATION`'s position argument (spec §4.5
    /// step 1).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| LsnParseError(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.to_string()))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;
    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl Sub<u64> for Lsn {
    type Output = Lsn;
    fn sub(self, rhs: u64) -> Lsn {
        Lsn(self.0 - rhs)
    }
}

impl Sub<Lsn> for Lsn {
    type Output = u64;
    fn sub(self, rhs: Lsn) -> u64 {
        self.0 - rhs.0
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Lsn {
        Lsn(v)
    }
}

impl From<Lsn> for u64 {
    fn from(v: Lsn) -> u64 {
        v.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrip() {
        let lsn = Lsn(0x0001_800000);
        assert_eq!(lsn.to_string(), "1/800000");
        assert_eq!("1/800000".parse::<Lsn>().unwrap(), lsn);
    }

    #[test]
    fn zero_padding_is_not_assumed_on_parse() {
        // PostgreSQL always prints lo zero-padded to 8 hex digits, but the
        // parser must also accept the unpadded form.
        assert_eq!("0/1800000".parse::<Lsn>().unwrap(), Lsn(0x01800000));
        assert_eq!("0/01800000".parse::<Lsn>().unwrap(), Lsn(0x01800000));
    }

    #[test]
    fn segment_alignment() {
        const SEG: u64 = 16 * 1024 * 1024;
        let lsn = Lsn(0x0001_800000);
        assert_eq!(lsn.segment_number(SEG), 1);
        assert!(!lsn.is_segment_aligned(SEG));
        assert_eq!(lsn.align_down(SEG), Lsn(0x0001_000000));
        assert!(lsn.align_down(SEG).is_segment_aligned(SEG));
        assert_eq!(lsn.remaining_in_segment(SEG), SEG - 0x800000);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("garbage".parse::<Lsn>().is_err());
        assert!("1/zz".parse::<Lsn>().is_err());
    }
}
