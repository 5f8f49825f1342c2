//! `WireReader`: a thin adapter over a single COPY OUT or COPY BOTH stream
//! that yields one payload frame at a time (spec §4.1). It knows nothing
//! about tar structure or WAL framing — those live in `tar` and
//! `walstream` respectively.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use tokio_postgres::{CopyBothDuplex, CopyOutStream};

use crate::error::{ReplError, Result};

pub enum Frame {
    Data(Bytes),
    EndOfStream,
}

enum Source {
    CopyOut(Pin<Box<CopyOutStream>>),
    CopyBoth(Pin<Box<CopyBothDuplex<Bytes>>>),
}

pub struct WireReader {
    source: Source,
    finished: bool,
}

impl WireReader {
    pub fn from_copy_out(stream: CopyOutStream) -> Self {
        WireReader {
            source: Source::CopyOut(Box::pin(stream)),
            finished: false,
        }
    }

    pub fn from_copy_both(stream: CopyBothDuplex<Bytes>) -> Self {
        WireReader {
            source: Source::CopyBoth(Box::pin(stream)),
            finished: false,
        }
    }

    /// Reads the next frame, or `EndOfStream` once the server has closed
    /// the COPY and the underlying client library has confirmed a clean
    /// command completion.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        if self.finished {
            return Ok(Frame::EndOfStream);
        }
        let item = match &mut self.source {
            Source::CopyOut(s) => s.next().await,
            Source::CopyBoth(s) => s.next().await,
        };
        match item {
            Some(Ok(bytes)) => Ok(Frame::Data(bytes)),
            Some(Err(e)) => Err(ReplError::Server(e.to_string())),
            None => {
                self.finished = true;
                Ok(Frame::EndOfStream)
            }
        }
    }

    /// Sends a frame back on the duplex half of a COPY BOTH stream (used
    /// for standby status updates / keepalive replies, spec §4.5 step 6).
    /// Returns a protocol error if called on a COPY OUT-only reader.
    pub async fn send_reply(&mut self, bytes: Bytes) -> Result<()> {
        match &mut self.source {
            Source::CopyBoth(s) => s
                .send(bytes)
                .await
                .map_err(|e| ReplError::Server(e.to_string())),
            Source::CopyOut(_) => Err(ReplError::Protocol(
                "cannot send a reply on a COPY OUT stream".into(),
            )),
        }
    }

    /// Asserts the stream actually ran to completion. The client library
    /// already validates the server's final command status while draining
    /// messages, so by the time `next_frame` returns `EndOfStream` without
    /// a prior error, the command is known to have succeeded; this just
    /// guards against calling it too early.
    pub fn finalize(&self) -> Result<()> {
        if self.finished {
            Ok(())
        } else {
            Err(ReplError::Protocol(
                "finalize() called before end of stream".into(),
            ))
        }
    }
}
