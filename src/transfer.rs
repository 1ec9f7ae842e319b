//! Chunked streaming of a local file onto an open connection.
//!
//! The protocol has no per-chunk acknowledgement or checksum, so the only
//! integrity guarantee is that every byte read from the source was accepted
//! by the writer. A failed chunk is never retried; the caller restarts the
//! whole upload.

use std::io::{ErrorKind, Read, Write};

use tracing::debug;

/// Upper bound for a single read/write cycle.
pub const CHUNK_SIZE: usize = 1024;

/// Consecutive empty reads tolerated before the source is considered
/// exhausted.
const MAX_EMPTY_READS: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("error during buffer read after {read} bytes: {source}")]
    Read {
        read: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("error during write after {written} bytes: {source}")]
    Write {
        written: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out writing to server after {written} bytes")]
    TimedOut { written: u64 },
    #[error("source ended after {read} of {size} bytes")]
    SourceExhausted { read: u64, size: u64 },
    #[error("byte count read from file ({read}) does not match bytes written to server ({written})")]
    ShortTransfer { read: u64, written: u64 },
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Receives byte-count updates while a stream is in flight.
pub trait ProgressSink {
    fn advance(&mut self, bytes: u64);

    fn finish(&mut self) {}

    fn abandon(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferState {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub chunk_size: usize,
    pub chunks: u64,
}

/// Copies exactly `size` bytes from `source` to `dest` in chunks of at most
/// [`CHUNK_SIZE`] bytes, reporting each written chunk to `progress`.
pub fn put_stream<R, W, P>(
    source: &mut R,
    dest: &mut W,
    size: u64,
    progress: &mut P,
) -> Result<TransferState>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    P: ProgressSink + ?Sized,
{
    let result = stream_chunks(source, dest, size, progress);
    match &result {
        Ok(_) => progress.finish(),
        Err(_) => progress.abandon(),
    }
    result
}

fn stream_chunks<R, W, P>(
    source: &mut R,
    dest: &mut W,
    size: u64,
    progress: &mut P,
) -> Result<TransferState>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    P: ProgressSink + ?Sized,
{
    let mut state = TransferState {
        bytes_read: 0,
        bytes_written: 0,
        chunk_size: CHUNK_SIZE,
        chunks: 0,
    };

    // Never larger than what is left to send.
    let mut buf = vec![0u8; (CHUNK_SIZE as u64).min(size) as usize];
    let mut empty_reads = 0;

    while state.bytes_read < size {
        let n = match source.read(&mut buf) {
            Ok(0) => {
                empty_reads += 1;
                if empty_reads >= MAX_EMPTY_READS {
                    return Err(TransferError::SourceExhausted {
                        read: state.bytes_read,
                        size,
                    });
                }
                continue;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(TransferError::Read {
                    read: state.bytes_read,
                    source,
                })
            }
        };
        empty_reads = 0;
        state.bytes_read += n as u64;

        let written = write_chunk(dest, &buf[..n], state.bytes_written)?;
        state.bytes_written += written as u64;
        state.chunks += 1;
        progress.advance(written as u64);

        let remaining = size - state.bytes_read;
        if remaining > 0 && remaining < buf.len() as u64 {
            buf.truncate(remaining as usize);
        }
    }

    debug!(
        read = state.bytes_read,
        written = state.bytes_written,
        chunks = state.chunks,
        chunk_size = state.chunk_size,
        "Stream finished"
    );

    if state.bytes_read != state.bytes_written {
        return Err(TransferError::ShortTransfer {
            read: state.bytes_read,
            written: state.bytes_written,
        });
    }
    Ok(state)
}

/// One write per chunk; a short count is recorded, not completed.
fn write_chunk<W: Write + ?Sized>(dest: &mut W, chunk: &[u8], written: u64) -> Result<usize> {
    loop {
        match dest.write(chunk) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(TransferError::TimedOut { written })
            }
            Err(source) => return Err(TransferError::Write { written, source }),
        }
    }
}
