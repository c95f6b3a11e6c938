//! Newline framing with a length cap

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// One unit read from a connection
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete record, line terminator stripped
    Record(Vec<u8>),
    /// A line longer than the cap; its length in bytes was skipped
    Oversized(usize),
}

/// Splits a byte stream into newline-delimited frames
///
/// Lines whose content, terminator excluded, is longer than `max_len` are
/// skipped up to the next newline without buffering them. Blank lines are
/// ignored. A final line without a trailing newline is returned at end of
/// stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_len: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            max_len,
            buf: Vec::new(),
        }
    }

    /// Next frame, or `None` at end of stream
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            self.buf.clear();
            // Room for a full-length record plus its CRLF terminator
            let limit = self.max_len as u64 + 2;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if read == 0 {
                return Ok(None);
            }

            let terminated = self.buf.last() == Some(&b'\n');
            if terminated {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
            }
            if self.buf.len() > self.max_len {
                let skipped = if terminated {
                    read
                } else {
                    read + self.skip_line().await?
                };
                return Ok(Some(Frame::Oversized(skipped)));
            }
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(Frame::Record(std::mem::take(&mut self.buf))));
        }
    }

    /// Discard input up to and including the next newline
    async fn skip_line(&mut self) -> std::io::Result<usize> {
        let mut skipped = 0;
        loop {
            let (found, used) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    return Ok(skipped);
                }
                match available.iter().position(|b| *b == b'\n') {
                    Some(idx) => (true, idx + 1),
                    None => (false, available.len()),
                }
            };
            self.reader.consume(used);
            skipped += used;
            if found {
                return Ok(skipped);
            }
        }
    }
}
