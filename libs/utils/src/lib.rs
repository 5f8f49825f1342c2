//! Small, dependency-light primitives shared between `repl_client` and the
//! `pg_basebackup_rs`/`pg_receivewal_rs` binaries.

pub mod lsn;

pub use lsn::Lsn;
