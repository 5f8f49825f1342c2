//! Client-side engine for PostgreSQL physical replication: base backups
//! and WAL streaming, driven over a connection the caller has already
//! established with `tokio-postgres`. This crate does not parse WAL
//! record contents, manage timelines, or perform any server-side role —
//! see each module for its slice of the wire protocol.

pub mod basebackup;
pub mod error;
pub mod segment;
pub mod tar;
pub mod wire;
pub mod walstream;

pub use basebackup::{
    BackupTarget, BaseBackupConnection, BaseBackupEngine, BaseBackupOptions, TablespaceCopyStreams,
    TablespaceDescriptor,
};
pub use error::{ReplError, Result};
pub use segment::SegmentWriter;
pub use tar::{EntryKind, TarEntry, TarEvent, TarStreamParser};
pub use walstream::{identify_system, IdentifySystem, NoopHook, SegmentHook, WalStreamEngine, WalStreamOptions};
pub use wire::{Frame, WireReader};
