//! Request-body decoders shared by both parser strategies.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

/// What a decoder produced from the buffered bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Data(Bytes),
    End,
    NeedData,
}

#[derive(Debug)]
pub enum BodyDecoder {
    ContentLength { remaining: u64 },
    Chunked(ChunkedDecoder),
}

impl BodyDecoder {
    pub fn content_length(length: u64) -> Self {
        BodyDecoder::ContentLength { remaining: length }
    }

    pub fn chunked(max_line: usize) -> Self {
        BodyDecoder::Chunked(ChunkedDecoder::new(max_line))
    }

    /// Consumes as much of `buf` as forms the next event.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, ProtocolError> {
        match self {
            BodyDecoder::ContentLength { remaining } => {
                if *remaining == 0 {
                    return Ok(Decoded::End);
                }
                if buf.is_empty() {
                    return Ok(Decoded::NeedData);
                }
                let take = usize::try_from(*remaining)
                    .unwrap_or(usize::MAX)
                    .min(buf.len());
                *remaining -= take as u64;
                Ok(Decoded::Data(buf.split_to(take).freeze()))
            }
            BodyDecoder::Chunked(decoder) => decoder.decode(buf),
        }
    }

    /// Error message for a peer that hung up before the body was complete.
    pub fn eof_message(&self) -> String {
        match self {
            BodyDecoder::ContentLength { remaining } => format!(
                "peer closed connection without sending complete message body: incomplete content-length ({remaining} bytes missing)"
            ),
            BodyDecoder::Chunked(_) => {
                "peer closed connection without sending complete message body: incomplete chunked read".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// `Transfer-Encoding: chunked` decoder.
///
/// Chunk extensions and trailer fields are accepted and dropped.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    max_line: usize,
}

impl ChunkedDecoder {
    pub fn new(max_line: usize) -> Self {
        Self {
            state: ChunkState::Size,
            max_line,
        }
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, ProtocolError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = self.take_line(buf)? else {
                        return Ok(Decoded::NeedData);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedData);
                    }
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(buf.len());
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    return Ok(Decoded::Data(buf.split_to(take).freeze()));
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedData);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ProtocolError::remote("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(line) = self.take_line(buf)? else {
                        return Ok(Decoded::NeedData);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(Decoded::End),
            }
        }
    }

    /// Pops one CRLF-terminated line, without the terminator.
    fn take_line(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        match buf.windows(2).position(|w| w == b"\r\n") {
            Some(end) => {
                if end > self.max_line {
                    return Err(ProtocolError::remote("chunk line too long"));
                }
                let line = buf.split_to(end).freeze();
                buf.advance(2);
                Ok(Some(line))
            }
            None if buf.len() > self.max_line => {
                Err(ProtocolError::remote("chunk line too long"))
            }
            None => Ok(None),
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProtocolError> {
    let digits = match line.iter().position(|b| *b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    let digits = digits.trim_ascii();
    if digits.is_empty() || digits.len() > 16 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ProtocolError::remote("illegal chunk header"));
    }
    // At most 16 hex digits, so this always fits.
    let text = std::str::from_utf8(digits).map_err(|_| ProtocolError::remote("illegal chunk header"))?;
    u64::from_str_radix(text, 16).map_err(|_| ProtocolError::remote("illegal chunk header"))
}
