//! Temporary capture sinks.
//!
//! A sink receives a copy of every byte written to the client while a
//! response is being captured, and turns it into a [`Payload`] once the
//! response completes.

use std::io::{self, Write};
use std::path::PathBuf;

use bytes::BytesMut;
use tempfile::NamedTempFile;
use tokio::runtime::{Handle, RuntimeFlavor};

use super::content::{Payload, SpooledPayload};

pub trait CaptureSink: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Bytes accepted so far.
    fn written(&self) -> u64;

    fn finish(self: Box<Self>) -> io::Result<Payload>;
}

fn limit_exceeded(limit: u64) -> io::Error {
    io::Error::other(format!("capture limit of {limit} bytes exceeded"))
}

/// Bounded in-memory buffer.
#[derive(Debug)]
pub struct MemorySink {
    buf: BytesMut,
    limit: Option<u64>,
}

impl MemorySink {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }
}

impl CaptureSink for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if let Some(limit) = self.limit
            && self.buf.len() as u64 + buf.len() as u64 > limit
        {
            return Err(limit_exceeded(limit));
        }
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn written(&self) -> u64 {
        self.buf.len() as u64
    }

    fn finish(self: Box<Self>) -> io::Result<Payload> {
        Ok(Payload::Inline(self.buf.freeze()))
    }
}

/// Spilled bytes are written in chunks of this size.
const SPILL_CHUNK: usize = 64 * 1024;

/// Run blocking file work without parking the other tasks on this worker.
///
/// Sinks are driven from synchronous body polling, so the work cannot be
/// awaited. On a multi-thread runtime the worker hands its tasks off for the
/// duration; elsewhere the work runs inline.
fn off_worker<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

/// Buffers in memory up to `threshold` bytes, then spills to a temp file.
///
/// Once spilling, bytes collect in memory and reach the file a chunk at a
/// time, so a streamed body costs one blocking write per [`SPILL_CHUNK`].
#[derive(Debug)]
pub struct SpoolSink {
    threshold: usize,
    limit: Option<u64>,
    dir: Option<PathBuf>,
    pending: BytesMut,
    file: Option<NamedTempFile>,
    written: u64,
}

impl SpoolSink {
    pub fn new(threshold: usize, limit: Option<u64>, dir: Option<PathBuf>) -> Self {
        Self {
            threshold,
            limit,
            dir,
            pending: BytesMut::new(),
            file: None,
            written: 0,
        }
    }

    fn spilling(&self) -> bool {
        self.file.is_some() || self.pending.len() > self.threshold
    }

    /// Move pending bytes into the spool file, creating it on first use.
    fn drain(&mut self) -> io::Result<()> {
        let dir = self.dir.as_deref();
        let slot = &mut self.file;
        let pending = &mut self.pending;
        off_worker(|| {
            if slot.is_none() {
                let mut builder = tempfile::Builder::new();
                builder.prefix(".capture-");
                *slot = Some(match dir {
                    Some(dir) => builder.tempfile_in(dir)?,
                    None => builder.tempfile()?,
                });
            }
            let file = slot
                .as_mut()
                .ok_or_else(|| io::Error::other("spool file unavailable"))?;
            file.write_all(pending)?;
            pending.clear();
            file.flush()
        })
    }
}

impl CaptureSink for SpoolSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let next = self.written + buf.len() as u64;
        if let Some(limit) = self.limit
            && next > limit
        {
            return Err(limit_exceeded(limit));
        }

        self.pending.extend_from_slice(buf);
        self.written = next;
        if self.pending.len() >= SPILL_CHUNK && self.spilling() {
            self.drain()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.file.is_some() && !self.pending.is_empty() {
            self.drain()?;
        }
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    fn finish(mut self: Box<Self>) -> io::Result<Payload> {
        if !self.spilling() {
            return Ok(Payload::Inline(self.pending.split().freeze()));
        }
        self.drain()?;
        let this = *self;
        match this.file {
            Some(file) => {
                let path = file.into_temp_path();
                Ok(Payload::Spooled(SpooledPayload::new(path, this.written)))
            }
            None => Err(io::Error::other("spool file unavailable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn memory_sink_enforces_limit() {
        let mut sink = MemorySink::new(Some(4));
        sink.write(b"abc").expect("within limit");
        assert!(sink.write(b"de").is_err());
        assert_eq!(sink.written(), 3);
    }

    #[tokio::test]
    async fn spool_sink_stays_inline_below_threshold() {
        let mut sink = Box::new(SpoolSink::new(16, None, None));
        sink.write(b"hello").expect("write");
        let payload = sink.finish().expect("finish");

        assert!(matches!(payload, Payload::Inline(_)));
        assert_eq!(payload.load().await.expect("load"), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn spool_sink_spills_past_threshold() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut sink = Box::new(SpoolSink::new(4, None, Some(dir.path().to_path_buf())));
        sink.write(b"abc").expect("write");
        sink.write(b"defgh").expect("write");
        assert_eq!(sink.written(), 8);

        let payload = sink.finish().expect("finish");
        assert!(matches!(payload, Payload::Spooled(_)));
        assert_eq!(payload.len(), 8);
        assert_eq!(payload.load().await.expect("load"), Bytes::from("abcdefgh"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spool_sink_spills_in_chunks_on_a_multi_thread_runtime() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut sink = Box::new(SpoolSink::new(16, None, Some(dir.path().to_path_buf())));
        let block = vec![b'z'; SPILL_CHUNK / 2 + 1];
        for _ in 0..4 {
            sink.write(&block).expect("write");
        }
        assert!(sink.file.is_some(), "full chunks reach the file while streaming");
        assert!(sink.pending.len() < SPILL_CHUNK);

        let payload = sink.finish().expect("finish");
        assert!(matches!(payload, Payload::Spooled(_)));
        assert_eq!(payload.len(), 4 * block.len() as u64);
        assert_eq!(payload.load().await.expect("load"), Bytes::from(block.repeat(4)));
    }

    #[test]
    fn spool_sink_runs_without_a_runtime() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut sink = Box::new(SpoolSink::new(2, None, Some(dir.path().to_path_buf())));
        sink.write(b"outside tokio").expect("write");
        sink.flush().expect("flush");
        let payload = sink.finish().expect("finish");
        assert!(matches!(payload, Payload::Spooled(_)));
        assert_eq!(payload.len(), 13);
    }

    #[test]
    fn spool_sink_enforces_limit() {
        let mut sink = SpoolSink::new(2, Some(5), None);
        sink.write(b"abcd").expect("write");
        assert!(sink.write(b"ef").is_err());
    }
}
