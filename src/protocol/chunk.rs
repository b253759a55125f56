//! RTMP chunk-stream framing
//!
//! Messages are carried as interleaved chunks, each with a basic header
//! (format + chunk stream id), a format-dependent message header, and up to
//! `chunk_size` payload bytes:
//!
//! ```text
//! fmt 0: timestamp(3) length(3) type(1) stream_id(4, LE)   full header
//! fmt 1: delta(3)     length(3) type(1)                    same stream id
//! fmt 2: delta(3)                                          same length/type
//! fmt 3: (none)                                            continuation
//! ```
//!
//! A timestamp or delta of 0xFFFFFF moves the real value into a 4-byte
//! extended field after the header; encoders that used it also prepend it to
//! fmt-3 continuation chunks, which is honoured here.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::{DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE};
use crate::error::{Error, ProtocolError};

/// A fully assembled RTMP message
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub type_id: u8,
    pub message_stream_id: u32,
    /// Absolute timestamp in milliseconds
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Per-chunk-stream decoder state
#[derive(Debug, Default)]
struct ChunkStreamState {
    timestamp: u32,
    timestamp_delta: u32,
    message_length: u32,
    message_type: u8,
    message_stream_id: u32,
    uses_extended_timestamp: bool,
    partial: BytesMut,
}

/// Reads chunks from the peer and assembles complete messages
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: u32,
    streams: HashMap<u32, ChunkStreamState>,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            bytes_read: 0,
        }
    }

    /// Apply a peer Set Chunk Size.
    pub fn set_chunk_size(&mut self, size: u32) -> Result<(), Error> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::ChunkSizeOutOfRange(size).into());
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Total bytes consumed from the wire, for window acknowledgements.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read chunks until one message completes.
    pub async fn read_message(&mut self) -> Result<RawMessage, Error> {
        loop {
            if let Some(message) = self.read_chunk().await? {
                return Ok(message);
            }
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<RawMessage>, Error> {
        let (fmt, csid) = self.read_basic_header().await?;

        let state = self.streams.entry(csid).or_default();
        let message_in_progress = !state.partial.is_empty();

        match fmt {
            0 => {
                let timestamp = read_u24(&mut self.reader, &mut self.bytes_read).await?;
                let length = read_u24(&mut self.reader, &mut self.bytes_read).await?;
                let type_id = read_u8(&mut self.reader, &mut self.bytes_read).await?;
                let stream_id = read_u32_le(&mut self.reader, &mut self.bytes_read).await?;

                let state = self.streams.get_mut(&csid).unwrap();
                state.message_length = length;
                state.message_type = type_id;
                state.message_stream_id = stream_id;
                state.uses_extended_timestamp = timestamp == EXTENDED_TIMESTAMP;
                state.timestamp = if state.uses_extended_timestamp {
                    read_u32_be(&mut self.reader, &mut self.bytes_read).await?
                } else {
                    timestamp
                };
                state.timestamp_delta = 0;
            }
            1 => {
                let delta = read_u24(&mut self.reader, &mut self.bytes_read).await?;
                let length = read_u24(&mut self.reader, &mut self.bytes_read).await?;
                let type_id = read_u8(&mut self.reader, &mut self.bytes_read).await?;

                let state = self.streams.get_mut(&csid).unwrap();
                state.message_length = length;
                state.message_type = type_id;
                state.uses_extended_timestamp = delta == EXTENDED_TIMESTAMP;
                let delta = if state.uses_extended_timestamp {
                    read_u32_be(&mut self.reader, &mut self.bytes_read).await?
                } else {
                    delta
                };
                state.timestamp_delta = delta;
                state.timestamp = state.timestamp.wrapping_add(delta);
            }
            2 => {
                let delta = read_u24(&mut self.reader, &mut self.bytes_read).await?;
                let state = self.streams.get_mut(&csid).unwrap();
                state.uses_extended_timestamp = delta == EXTENDED_TIMESTAMP;
                let delta = if state.uses_extended_timestamp {
                    read_u32_be(&mut self.reader, &mut self.bytes_read).await?
                } else {
                    delta
                };
                state.timestamp_delta = delta;
                state.timestamp = state.timestamp.wrapping_add(delta);
            }
            3 => {
                let state = self.streams.get_mut(&csid).unwrap();
                if state.uses_extended_timestamp {
                    // Encoders that used the extended field repeat it on
                    // every continuation chunk
                    let ext = read_u32_be(&mut self.reader, &mut self.bytes_read).await?;
                    if !message_in_progress {
                        state.timestamp = ext;
                    }
                } else if !message_in_progress {
                    // fmt 3 opening a new message repeats the previous delta
                    state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                }
            }
            _ => unreachable!("fmt is two bits"),
        }

        let state = self.streams.get_mut(&csid).unwrap();
        let total = state.message_length as usize;
        if total > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(total).into());
        }

        // A header rewrite mid-message (length shrinking below what was
        // already assembled) is a peer protocol violation
        let remaining = total
            .checked_sub(state.partial.len())
            .ok_or(ProtocolError::MalformedChunk("message length changed mid-message"))?;
        let to_read = remaining.min(self.chunk_size as usize);
        if state.partial.capacity() == 0 {
            state.partial.reserve(total);
        }

        let start = state.partial.len();
        state.partial.resize(start + to_read, 0);
        self.reader.read_exact(&mut state.partial[start..]).await?;
        self.bytes_read += to_read as u64;

        if state.partial.len() == total {
            let payload = std::mem::take(&mut state.partial).freeze();
            return Ok(Some(RawMessage {
                type_id: state.message_type,
                message_stream_id: state.message_stream_id,
                timestamp: state.timestamp,
                payload,
            }));
        }

        Ok(None)
    }

    async fn read_basic_header(&mut self) -> Result<(u8, u32), Error> {
        let first = read_u8(&mut self.reader, &mut self.bytes_read).await?;
        let fmt = first >> 6;
        let csid = match first & 0x3F {
            0 => 64 + read_u8(&mut self.reader, &mut self.bytes_read).await? as u32,
            1 => {
                let b2 = read_u8(&mut self.reader, &mut self.bytes_read).await? as u32;
                let b3 = read_u8(&mut self.reader, &mut self.bytes_read).await? as u32;
                64 + b2 + b3 * 256
            }
            n => n as u32,
        };
        Ok((fmt, csid))
    }
}

/// Writes messages as fmt-0 chunks with fmt-3 continuations
pub struct ChunkWriter<W> {
    writer: W,
    chunk_size: u32,
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Chunk size for outgoing messages; announce the change to the peer
    /// separately via a Set Chunk Size message.
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    pub async fn write_message(
        &mut self,
        csid: u32,
        timestamp: u32,
        type_id: u8,
        message_stream_id: u32,
        payload: &[u8],
    ) -> Result<(), Error> {
        let extended = timestamp >= EXTENDED_TIMESTAMP;
        let header_timestamp = if extended { EXTENDED_TIMESTAMP } else { timestamp };

        let mut header = BytesMut::with_capacity(18);
        put_basic_header(&mut header, 0, csid);
        put_u24(&mut header, header_timestamp);
        put_u24(&mut header, payload.len() as u32);
        header.put_u8(type_id);
        header.put_u32_le(message_stream_id);
        if extended {
            header.put_u32(timestamp);
        }
        self.writer.write_all(&header).await?;

        let mut offset = 0;
        let chunk = self.chunk_size as usize;
        loop {
            let end = (offset + chunk).min(payload.len());
            self.writer.write_all(&payload[offset..end]).await?;
            offset = end;
            if offset >= payload.len() {
                break;
            }
            let mut continuation = BytesMut::with_capacity(7);
            put_basic_header(&mut continuation, 3, csid);
            if extended {
                continuation.put_u32(timestamp);
            }
            self.writer.write_all(&continuation).await?;
        }

        self.writer.flush().await?;
        Ok(())
    }
}

fn put_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        2..=63 => buf.put_u8((fmt << 6) | csid as u8),
        64..=319 => {
            buf.put_u8(fmt << 6);
            buf.put_u8((csid - 64) as u8);
        }
        _ => {
            buf.put_u8((fmt << 6) | 1);
            let rest = csid - 64;
            buf.put_u8((rest % 256) as u8);
            buf.put_u8((rest / 256) as u8);
        }
    }
}

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R, counter: &mut u64) -> Result<u8, Error> {
    let b = reader.read_u8().await?;
    *counter += 1;
    Ok(b)
}

async fn read_u24<R: AsyncRead + Unpin>(reader: &mut R, counter: &mut u64) -> Result<u32, Error> {
    let mut buf = [0u8; 3];
    reader.read_exact(&mut buf).await?;
    *counter += 3;
    Ok(((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32)
}

async fn read_u32_be<R: AsyncRead + Unpin>(reader: &mut R, counter: &mut u64) -> Result<u32, Error> {
    let v = reader.read_u32().await?;
    *counter += 4;
    Ok(v)
}

async fn read_u32_le<R: AsyncRead + Unpin>(reader: &mut R, counter: &mut u64) -> Result<u32, Error> {
    let v = reader.read_u32_le().await?;
    *counter += 4;
    Ok(v)
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}
