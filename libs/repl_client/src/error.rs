//! Error kinds from spec §7. Each is a plain data-carrying variant rather
//! than a class hierarchy; all of them are terminal for the current
//! session (§7's propagation policy: "no in-engine retry").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplError {
    /// Missing/conflicting flags, a non-empty target directory, or an
    /// unsupported compression configuration. Raised before any connection
    /// is made.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected result status, malformed frame, wrong frame type byte,
    /// short header, offset mismatch, unknown tar typeflag, truncated
    /// entry body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// open/write/read/fsync/rename/readdir failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Server-reported failure in a result or COPY stream.
    #[error("server error: {0}")]
    Server(String),

    /// The `SegmentHook` requested termination. Not an error: the engine
    /// returns the last streamed position as success.
    #[error("stopped by segment hook")]
    UserStop,
}

pub type Result<T> = std::result::Result<T, ReplError>;

impl ReplError {
    pub fn is_user_stop(&self) -> bool {
        matches!(self, ReplError::UserStop)
    }
}

impl From<std::io::Error> for ReplError {
    fn from(e: std::io::Error) -> Self {
        ReplError::Io(e.to_string())
    }
}

impl From<tokio_postgres::Error> for ReplError {
    fn from(e: tokio_postgres::Error) -> Self {
        ReplError::Server(e.to_string())
    }
}

/// Helper for attaching a bit of context to an I/O failure, in the style
/// of `anyhow::Context` but producing our own typed error.
pub(crate) trait IoResultExt<T> {
    fn io_context<C: std::fmt::Display>(self, ctx: C) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context<C: std::fmt::Display>(self, ctx: C) -> Result<T> {
        self.map_err(|e| ReplError::Io(format!("{ctx}: {e}")))
    }
}
