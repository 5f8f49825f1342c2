//! Constants and naming conventions borrowed from PostgreSQL's own WAL and
//! tar framing (spec §3, §4.2, §6). This crate does not link against, or
//! decode the contents of, actual PostgreSQL WAL records — see spec §1's
//! explicit non-goal ("does not interpret WAL record contents").

use utils::lsn::Lsn;

/// Default WAL segment size PostgreSQL clusters are initialized with.
/// Spec §3 calls this a "build-time constant"; we keep it as a regular
/// `const` but every API that depends on it also accepts an explicit
/// segment size so tests can exercise non-default sizes.
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Size of one ustar header or padding block (spec §4.2).
pub const TAR_BLOCK_SIZE: u64 = 512;

/// Number of all-zero blocks that terminate a tar archive (spec §4.2, §4.4).
pub const TAR_END_BLOCKS: usize = 2;

/// Suffix applied to a WAL segment file that hasn't reached
/// [`DEFAULT_WAL_SEGMENT_SIZE`]/the configured segment size yet (spec §3's
/// `PartialSegment`).
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Length of a rendered `SegmentName` (spec §3): `TTTTTTTTLLLLLLLLSSSSSSSS`.
pub const XLOG_FNAME_LEN: usize = 24;

/// How many segments of `seg_sz` bytes fit in one 32-bit "log" (the high
/// half of an LSN). PostgreSQL's on-disk segment filenames split the
/// absolute segment number into `(logId, seg)` this way so the filename
/// stays a fixed width regardless of segment size.
fn segments_per_xlogid(seg_sz: u64) -> u64 {
    0x1_0000_0000u64 / seg_sz
}

/// Render the fixed 24-character uppercase hex filename for segment
/// `segno` (the absolute, zero-based segment number since LSN 0) on
/// timeline `tli` (spec §3's `SegmentName`).
#[allow(non_snake_case)]
pub fn XLogFileName(tli: u32, segno: u64, seg_sz: u64) -> String {
    let segs_per_id = segments_per_xlogid(seg_sz);
    format!(
        "{:08X}{:08X}{:08X}",
        tli,
        segno / segs_per_id,
        segno % segs_per_id
    )
}

/// Inverse of [`XLogFileName`]: parse a segment filename (without any
/// `.partial` suffix) into `(timeline, absolute segno)`. Returns `None` for
/// anything that isn't exactly [`XLOG_FNAME_LEN`] uppercase hex digits,
/// matching spec §4.5's resume-discovery scan ("filenames exactly 24
/// hex-uppercase characters").
pub fn parse_segment_name(name: &str, seg_sz: u64) -> Option<(u32, u64)> {
    if name.len() != XLOG_FNAME_LEN
        || !name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
    {
        return None;
    }
    let tli = u32::from_str_radix(&name[0..8], 16).ok()?;
    let log = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..24], 16).ok()?;
    let segs_per_id = segments_per_xlogid(seg_sz);
    Some((tli, log.checked_mul(segs_per_id)?.checked_add(seg)?))
}

/// The LSN of the first byte of segment `segno` on disk.
pub fn segment_start_lsn(segno: u64, seg_sz: u64) -> Lsn {
    Lsn(segno * seg_sz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_roundtrip() {
        const SEG: u64 = DEFAULT_WAL_SEGMENT_SIZE;
        let name = XLogFileName(1, 1, SEG);
        assert_eq!(name, "000000010000000000000001");
        assert_eq!(parse_segment_name(&name, SEG), Some((1, 1)));
    }

    #[test]
    fn filename_crosses_log_boundary() {
        const SEG: u64 = DEFAULT_WAL_SEGMENT_SIZE;
        let segs_per_id = segments_per_xlogid(SEG);
        let name = XLogFileName(1, segs_per_id, SEG);
        assert_eq!(name, "000000010000000100000000");
        assert_eq!(parse_segment_name(&name, SEG), Some((1, segs_per_id)));
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(parse_segment_name("short", DEFAULT_WAL_SEGMENT_SIZE), None);
        assert_eq!(
            parse_segment_name("00000001000000000000000g", DEFAULT_WAL_SEGMENT_SIZE),
            None
        );
        // lowercase must be rejected, even though it parses as valid hex
        assert_eq!(
            parse_segment_name("000000010000000000000001".to_lowercase().as_str(), DEFAULT_WAL_SEGMENT_SIZE),
            None
        );
    }

    #[test]
    fn segment_start_matches_filename() {
        const SEG: u64 = DEFAULT_WAL_SEGMENT_SIZE;
        let lsn = segment_start_lsn(1, SEG);
        assert_eq!(lsn, Lsn(SEG));
        assert!(lsn.is_segment_aligned(SEG));
    }
}
