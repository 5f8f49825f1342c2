//! `TarStreamParser`: a hand-rolled, restartable ustar reader (spec §4.2).
//!
//! This deliberately does not sit on top of the `tar` crate's own reader:
//! that type wants a blocking `Read` over a complete archive, not a state
//! machine that is fed arbitrarily-sized chunks as they arrive off the
//! wire and can report entry/body/end-of-entry events as soon as each is
//! known. The `tar` crate is still used elsewhere in this workspace, for
//! writing tar archives in `basebackup::TarFileSink`.

use bytes::Bytes;

use crate::error::{ReplError, Result};

const HEADER_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    SymlinkToDir,
}

#[derive(Debug, Clone)]
pub struct TarEntry {
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
    pub kind: EntryKind,
    pub link_target: Option<String>,
}

#[derive(Debug)]
pub enum TarEvent {
    Header(TarEntry),
    Body(Bytes),
    EndOfEntry,
}

enum State {
    AwaitHeader,
    InBody { remaining: u64, padding: u64 },
    InPadding { padding: u64 },
    Done,
}

pub struct TarStreamParser {
    state: State,
    header_buf: Vec<u8>,
}

impl TarStreamParser {
    pub fn new() -> Self {
        TarStreamParser {
            state: State::AwaitHeader,
            header_buf: Vec::with_capacity(HEADER_LEN),
        }
    }

    /// True once the parser has seen the end-of-archive marker, or is
    /// sitting cleanly between entries with no partial header buffered.
    /// Used by the caller to tell a legitimate end of input from a
    /// mid-entry truncation (spec §4.4's "truncated entry body" case).
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::AwaitHeader | State::Done) && self.header_buf.is_empty()
    }

    /// Feeds the next chunk of archive bytes, returning the events it
    /// produced. A chunk may complete zero, one, or many entries, and may
    /// also leave a partial header or body tail buffered for the next
    /// call.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<TarEvent>> {
        let mut events = Vec::new();
        while !chunk.is_empty() {
            match &mut self.state {
                State::Done => break,
                State::AwaitHeader => {
                    let need = HEADER_LEN - self.header_buf.len();
                    let take = need.min(chunk.len());
                    self.header_buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if self.header_buf.len() < HEADER_LEN {
                        break;
                    }
                    let block = std::mem::replace(&mut self.header_buf, Vec::with_capacity(HEADER_LEN));
                    if block.iter().all(|&b| b == 0) {
                        self.state = State::Done;
                        continue;
                    }
                    let entry = parse_header(&block)?;
                    match entry.kind {
                        EntryKind::Regular if entry.size == 0 => {
                            events.push(TarEvent::Header(entry));
                            events.push(TarEvent::EndOfEntry);
                        }
                        EntryKind::Regular => {
                            let padding = padding_for(entry.size);
                            let remaining = entry.size;
                            events.push(TarEvent::Header(entry));
                            self.state = State::InBody { remaining, padding };
                        }
                        EntryKind::Directory | EntryKind::SymlinkToDir => {
                            events.push(TarEvent::Header(entry));
                            events.push(TarEvent::EndOfEntry);
                        }
                    }
                }
                State::InBody { remaining, padding } => {
                    let take = (*remaining as usize).min(chunk.len());
                    if take > 0 {
                        events.push(TarEvent::Body(Bytes::copy_from_slice(&chunk[..take])));
                        *remaining -= take as u64;
                        chunk = &chunk[take..];
                    }
                    if *remaining == 0 {
                        if *padding == 0 {
                            events.push(TarEvent::EndOfEntry);
                            self.state = State::AwaitHeader;
                        } else {
                            self.state = State::InPadding { padding: *padding };
                        }
                    }
                }
                State::InPadding { padding } => {
                    let take = (*padding as usize).min(chunk.len());
                    *padding -= take as u64;
                    chunk = &chunk[take..];
                    if *padding == 0 {
                        events.push(TarEvent::EndOfEntry);
                        self.state = State::AwaitHeader;
                    }
                }
            }
        }
        Ok(events)
    }
}

impl Default for TarStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

fn padding_for(size: u64) -> u64 {
    let block = HEADER_LEN as u64;
    (block - size % block) % block
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let s = field
        .iter()
        .take_while(|&&b| b != 0 && b != b' ')
        .collect::<Vec<_>>();
    if s.is_empty() {
        return Some(0);
    }
    let s: String = s.iter().map(|&&b| b as char).collect();
    u64::from_str_radix(s.trim(), 8).ok()
}

fn cstr_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Parses one 512-byte ustar header. Field offsets follow the POSIX
/// layout: name 0..100, mode 100..108, size 124..136, mtime 136..148,
/// typeflag at 156, linkname 157..257. The checksum field is present but
/// deliberately not verified (spec §4.2).
fn parse_header(block: &[u8]) -> Result<TarEntry> {
    debug_assert_eq!(block.len(), HEADER_LEN);

    let name = cstr_field(&block[0..100]);
    let mode = parse_octal(&block[100..108])
        .ok_or_else(|| ReplError::Protocol("malformed tar mode field".into()))? as u32;
    let size = parse_octal(&block[124..136])
        .ok_or_else(|| ReplError::Protocol("malformed tar size field".into()))?;
    let mtime = parse_octal(&block[136..148])
        .ok_or_else(|| ReplError::Protocol("malformed tar mtime field".into()))?;
    let typeflag = block[156];
    let linkname = cstr_field(&block[157..257]);

    let kind = match typeflag {
        0 | b'0' => EntryKind::Regular,
        b'5' => EntryKind::Directory,
        b'2' => {
            if linkname.is_empty() {
                return Err(ReplError::Protocol(format!(
                    "symlink entry {name:?} has an empty link target"
                )));
            }
            if !name.ends_with('/') {
                return Err(ReplError::Protocol(format!(
                    "unsupported tar extension: symlink {name:?} does not name a directory"
                )));
            }
            EntryKind::SymlinkToDir
        }
        other => {
            return Err(ReplError::Protocol(format!(
                "unsupported tar typeflag {other:?} for entry {name:?}"
            )))
        }
    };

    let link_target = if kind == EntryKind::SymlinkToDir {
        Some(linkname)
    } else {
        None
    };

    Ok(TarEntry {
        name,
        mode,
        size,
        mtime,
        kind,
        link_target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_block(name: &str, mode: u32, size: u64, typeflag: u8, linkname: &str) -> [u8; 512] {
        let mut b = [0u8; 512];
        b[0..name.len()].copy_from_slice(name.as_bytes());
        let mode_s = format!("{:07o}\0", mode);
        b[100..100 + mode_s.len()].copy_from_slice(mode_s.as_bytes());
        let size_s = format!("{:011o} ", size);
        b[124..124 + size_s.len()].copy_from_slice(size_s.as_bytes());
        let mtime_s = format!("{:011o} ", 0u64);
        b[136..136 + mtime_s.len()].copy_from_slice(mtime_s.as_bytes());
        b[156] = typeflag;
        b[157..157 + linkname.len()].copy_from_slice(linkname.as_bytes());
        b
    }

    #[test]
    fn single_file_entry_roundtrip() {
        let mut parser = TarStreamParser::new();
        let header = header_block("PG_VERSION", 0o644, 3, b'0', "");
        let mut archive = header.to_vec();
        archive.extend_from_slice(b"16\n");
        archive.extend_from_slice(&[0u8; 509]); // pad to 512
        archive.extend_from_slice(&[0u8; 1024]); // two zero blocks

        let events = parser.feed(&archive).unwrap();
        assert!(matches!(&events[0], TarEvent::Header(e) if e.name == "PG_VERSION" && e.size == 3));
        assert!(matches!(&events[1], TarEvent::Body(b) if b.as_ref() == b"16\n"));
        assert!(matches!(&events[2], TarEvent::EndOfEntry));
        assert!(parser.is_complete());
    }

    #[test]
    fn directory_and_symlink_entries_have_no_body() {
        let mut parser = TarStreamParser::new();
        let dir = header_block("base/", 0o755, 0, b'5', "");
        let link = header_block("pg_wal/", 0o777, 0, b'2', "../pg_wal/");
        let mut archive = dir.to_vec();
        archive.extend_from_slice(&link);
        archive.extend_from_slice(&[0u8; 1024]);

        let events = parser.feed(&archive).unwrap();
        assert!(matches!(&events[0], TarEvent::Header(e) if e.kind == EntryKind::Directory));
        assert!(matches!(&events[1], TarEvent::EndOfEntry));
        assert!(matches!(&events[2], TarEvent::Header(e) if e.kind == EntryKind::SymlinkToDir));
        assert!(matches!(&events[3], TarEvent::EndOfEntry));
    }

    #[test]
    fn header_spanning_two_chunks_is_buffered() {
        let mut parser = TarStreamParser::new();
        let header = header_block("a", 0o644, 0, b'0', "");
        let events1 = parser.feed(&header[..200]).unwrap();
        assert!(events1.is_empty());
        let events2 = parser.feed(&header[200..]).unwrap();
        assert!(matches!(&events2[0], TarEvent::Header(e) if e.name == "a"));
    }

    #[test]
    fn body_spanning_multiple_chunks() {
        let mut parser = TarStreamParser::new();
        let header = header_block("f", 0o644, 600, b'0', "");
        let mut events = parser.feed(&header).unwrap();
        events.extend(parser.feed(&vec![b'x'; 300]).unwrap());
        let mut tail = vec![b'y'; 300];
        tail.extend(std::iter::repeat(0u8).take(padding_for(600) as usize));
        events.extend(parser.feed(&tail).unwrap());

        let bodies: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                TarEvent::Body(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(bodies.len(), 600);
        assert!(matches!(events.last(), Some(TarEvent::EndOfEntry)));
    }

    #[test]
    fn rejects_unknown_typeflag() {
        let mut parser = TarStreamParser::new();
        let header = header_block("f", 0o644, 0, b'x', "");
        assert!(parser.feed(&header).is_err());
    }

    #[test]
    fn rejects_symlink_not_to_directory() {
        let mut parser = TarStreamParser::new();
        let header = header_block("f", 0o777, 0, b'2', "target-without-trailing-slash");
        assert!(parser.feed(&header).is_err());
    }
}
