//! `SegmentWriter`: crash-safe creation of one WAL segment file (spec §4.3,
//! §8's "segment integrity" property). Grounded on the
//! exclusive-create-then-rename pattern safekeeper uses for its own WAL
//! segments, generalized here to a standalone filesystem operation with no
//! server-side state to coordinate with.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use postgres_ffi::PARTIAL_SUFFIX;

use crate::error::{IoResultExt, Result};

pub struct SegmentWriter {
    file: Option<File>,
    open_path: PathBuf,
    final_path: PathBuf,
    rename_on_finish: bool,
    seg_sz: u64,
    bytes_written: u64,
}

impl SegmentWriter {
    /// Creates `segment_name` exclusively under `base_dir`. When
    /// `as_partial` is set the file is created with [`PARTIAL_SUFFIX`] and
    /// renamed to its final name only once `finish_segment` has received
    /// exactly `seg_sz` bytes; otherwise the file is created under its
    /// final name directly (used for a segment recovered to a known-good
    /// length, spec §4.5's resume path).
    pub fn create(base_dir: &Path, segment_name: &str, seg_sz: u64, as_partial: bool) -> Result<Self> {
        let final_path = base_dir.join(segment_name);
        let open_path = if as_partial {
            base_dir.join(format!("{segment_name}{PARTIAL_SUFFIX}"))
        } else {
            final_path.clone()
        };
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&open_path)
            .io_context(format!("creating segment file {}", open_path.display()))?;
        Ok(SegmentWriter {
            file: Some(file),
            open_path,
            final_path,
            rename_on_finish: as_partial,
            seg_sz,
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.open_path
    }

    /// The name the segment will have on disk once finished (identical to
    /// `path()` when it wasn't opened as `.partial`).
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Appends `buf`, retrying on short writes. Fails if this would push
    /// the segment past `seg_sz` — the caller is responsible for only ever
    /// handing this writer bytes that belong to its own segment (spec
    /// §4.5's per-frame split at segment boundaries).
    pub fn write(&mut self, mut buf: &[u8]) -> Result<()> {
        if self.bytes_written + buf.len() as u64 > self.seg_sz {
            return Err(crate::error::ReplError::Protocol(format!(
                "write of {} bytes would overflow segment {} ({} of {} already written)",
                buf.len(),
                self.open_path.display(),
                self.bytes_written,
                self.seg_sz
            )));
        }
        let file = self.file.as_mut().expect("write after finish/abort");
        while !buf.is_empty() {
            let n = file
                .write(buf)
                .io_context(format!("writing segment {}", self.open_path.display()))?;
            if n == 0 {
                return Err(crate::error::ReplError::Io(format!(
                    "short write with no progress to {}",
                    self.open_path.display()
                )));
            }
            buf = &buf[n..];
            self.bytes_written += n as u64;
        }
        Ok(())
    }

    /// Fsyncs, closes, and (if the segment was opened as `.partial`)
    /// renames to its final name, fsyncing the containing directory
    /// afterwards. Must be called exactly once, with the segment full.
    pub fn finish_segment(mut self) -> Result<()> {
        assert_eq!(
            self.bytes_written, self.seg_sz,
            "finish_segment called on a non-full segment"
        );
        let file = self.file.take().expect("already finished");
        file.sync_all()
            .io_context(format!("fsyncing segment {}", self.open_path.display()))?;
        drop(file);
        if self.rename_on_finish {
            fs::rename(&self.open_path, &self.final_path).io_context(format!(
                "renaming {} to {}",
                self.open_path.display(),
                self.final_path.display()
            ))?;
            if let Some(dir) = self.final_path.parent() {
                fsync_dir(dir)?;
            }
        }
        Ok(())
    }

    /// Abandons the segment: the file is simply closed (dropped) in
    /// whatever state it reached, left on disk under its open name.
    /// `WalStreamEngine` uses this when a `SegmentHook` asks to stop
    /// mid-segment (spec §4.5, §4.3's abort path).
    pub fn abort_open(mut self) {
        self.file.take();
    }
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let dirfile = File::open(dir).io_context(format!("opening directory {}", dir.display()))?;
    dirfile
        .sync_all()
        .io_context(format!("fsyncing directory {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn finish_renames_partial_to_final() {
        let dir = tempdir().unwrap();
        let name = "000000010000000000000001";
        let mut w = SegmentWriter::create(dir.path().as_std_path(), name, 8, true).unwrap();
        w.write(b"12345678").unwrap();
        w.finish_segment().unwrap();

        assert!(!dir.path().join(format!("{name}.partial")).exists());
        assert_eq!(
            fs::read(dir.path().join(name)).unwrap(),
            b"12345678".to_vec()
        );
    }

    #[test]
    fn abort_leaves_partial_file_in_place() {
        let dir = tempdir().unwrap();
        let name = "000000010000000000000001";
        let mut w = SegmentWriter::create(dir.path().as_std_path(), name, 8, true).unwrap();
        w.write(b"1234").unwrap();
        w.abort_open();

        assert_eq!(
            fs::read(dir.path().join(format!("{name}.partial"))).unwrap(),
            b"1234".to_vec()
        );
        assert!(!dir.path().join(name).exists());
    }

    #[test]
    fn overflowing_write_is_rejected() {
        let dir = tempdir().unwrap();
        let name = "000000010000000000000001";
        let mut w = SegmentWriter::create(dir.path().as_std_path(), name, 4, true).unwrap();
        assert!(w.write(b"12345").is_err());
    }

    #[test]
    fn exclusive_create_rejects_existing_file() {
        let dir = tempdir().unwrap();
        let name = "000000010000000000000001";
        let _w = SegmentWriter::create(dir.path().as_std_path(), name, 8, true).unwrap();
        assert!(SegmentWriter::create(dir.path().as_std_path(), name, 8, true).is_err());
    }
}
