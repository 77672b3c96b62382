// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Framing for the build channel.
//!
//! Each frame on the wire is:
//! - length: signed zig-zag varint, max 10 bytes, value = payload length + 1
//! - 1 byte: frame type
//! - N bytes: payload
//!
//! The `+ 1` covers the type byte, so a well-formed frame always
//! decodes a length of at least 1; an empty payload after the type
//! byte is legal. One logical writer per direction — frames are never
//! interleaved on a single stream.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Take};

/// Maximum encoded length of the varint header.
pub const MAX_VARINT_LEN: usize = 10;

/// Maximum payload size for fully-buffered reads (64 MB).
///
/// Streaming transfers via [`read_file_frame`] are not subject to this
/// cap; slugs can be larger than any frame we are willing to hold in
/// memory at once.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Frame types multiplexed over the build channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Build log output, shown to the user. Not necessarily line-aligned.
    User = 0,
    /// An opaque byte blob; the full payload is the file.
    File = 1,
    /// Terminal status, exactly one payload byte.
    Status = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameType::User),
            1 => Ok(FrameType::File),
            2 => Ok(FrameType::Status),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Payload of a `Status` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BuildStatus {
    Success = 0,
    Failure = 1,
}

impl TryFrom<u8> for BuildStatus {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(BuildStatus::Success),
            1 => Ok(BuildStatus::Failure),
            _ => Err(FrameError::InvalidStatus(value)),
        }
    }
}

/// Errors that can occur while framing or deframing the channel.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Decoded length < 1; no room for the type byte.
    #[error("empty frame")]
    EmptyFrame,

    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(u64),

    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("invalid status byte: {0}")]
    InvalidStatus(u8),

    /// A `File` frame was required but something else arrived.
    #[error("expected file frame, got {0:?}")]
    UnexpectedType(FrameType),

    #[error("length header exceeds {MAX_VARINT_LEN} bytes")]
    VarintOverflow,

    /// The stream ended before the announced payload was complete.
    #[error("truncated payload")]
    TruncatedPayload,

    /// Clean EOF at a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully-buffered frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Interpret this frame as a status frame.
    pub fn status(&self) -> Result<BuildStatus, FrameError> {
        if self.frame_type != FrameType::Status {
            return Err(FrameError::InvalidFrameType(self.frame_type as u8));
        }
        match self.payload.first() {
            Some(&b) => BuildStatus::try_from(b),
            None => Err(FrameError::EmptyFrame),
        }
    }
}

fn encode_varint(value: i64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    // Zig-zag, then unsigned LEB128.
    let mut ux = ((value << 1) ^ (value >> 63)) as u64;
    let mut i = 0;
    while ux >= 0x80 {
        buf[i] = (ux as u8) | 0x80;
        ux >>= 7;
        i += 1;
    }
    buf[i] = ux as u8;
    i + 1
}

/// Read one zig-zag varint. A clean EOF before the first byte maps to
/// `ConnectionClosed`; EOF inside the varint is a truncated header.
async fn read_varint<R>(reader: &mut R) -> Result<i64, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut ux: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if i == 0 {
                    return Err(FrameError::ConnectionClosed);
                }
                return Err(FrameError::TruncatedPayload);
            }
            Err(e) => return Err(e.into()),
        }
        let b = byte[0];
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return Err(FrameError::VarintOverflow);
            }
            ux |= (b as u64) << (7 * i);
            let value = ((ux >> 1) as i64) ^ -((ux & 1) as i64);
            return Ok(value);
        }
        ux |= ((b & 0x7f) as u64) << (7 * i);
    }
    Err(FrameError::VarintOverflow)
}

/// Read the frame header: payload length and type.
async fn read_header<R>(reader: &mut R) -> Result<(u64, FrameType), FrameError>
where
    R: AsyncRead + Unpin,
{
    let n = read_varint(reader).await?;
    if n < 1 {
        return Err(FrameError::EmptyFrame);
    }
    let mut type_byte = [0u8; 1];
    match reader.read_exact(&mut type_byte).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::TruncatedPayload);
        }
        Err(e) => return Err(e.into()),
    }
    let frame_type = FrameType::try_from(type_byte[0])?;
    Ok((n as u64 - 1, frame_type))
}

/// Write one complete frame.
///
/// The header and payload are composed into a single buffer and
/// written with one `write_all`, so a reader never observes a partial
/// header between frames.
pub async fn write_frame<W>(
    writer: &mut W,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; MAX_VARINT_LEN];
    let header_len = encode_varint(payload.len() as i64 + 1, &mut header);

    let mut buf = BytesMut::with_capacity(header_len + 1 + payload.len());
    buf.extend_from_slice(&header[..header_len]);
    buf.extend_from_slice(&[frame_type as u8]);
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Stream exactly `n` bytes from `reader` into a single frame without
/// buffering the payload.
pub async fn copy_frame<W, R>(
    writer: &mut W,
    frame_type: FrameType,
    reader: &mut R,
    n: u64,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; MAX_VARINT_LEN];
    let header_len = encode_varint(n as i64 + 1, &mut header);

    let mut buf = BytesMut::with_capacity(header_len + 1);
    buf.extend_from_slice(&header[..header_len]);
    buf.extend_from_slice(&[frame_type as u8]);
    writer.write_all(&buf).await?;

    let mut limited = reader.take(n);
    let copied = tokio::io::copy(&mut limited, writer).await?;
    if copied != n {
        return Err(FrameError::TruncatedPayload);
    }
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame into memory.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let (len, frame_type) = read_header(reader).await?;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::TruncatedPayload);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(Frame {
        frame_type,
        payload: Bytes::from(payload),
    })
}

/// Read the header of a `File` frame and return a reader bounded to
/// its payload. The caller must drain the reader before touching the
/// stream again.
///
/// Fails with [`FrameError::UnexpectedType`] on a non-`File` frame;
/// only the header has been consumed at that point.
pub async fn read_file_frame<R>(reader: &mut R) -> Result<Take<&mut R>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let (len, frame_type) = read_header(reader).await?;
    if frame_type != FrameType::File {
        return Err(FrameError::UnexpectedType(frame_type));
    }
    Ok(reader.take(len))
}

/// Write one `User` frame carrying `text`.
pub async fn write_user<W>(writer: &mut W, text: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, FrameType::User, text.as_bytes()).await
}

/// Write the terminal `Status` frame.
pub async fn write_status<W>(writer: &mut W, status: BuildStatus) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, FrameType::Status, &[status as u8]).await
}

/// Adapter that buffers written bytes and emits one frame per
/// newline-terminated segment, newline included.
///
/// Partial trailing data stays buffered until the next newline.
/// [`LineFramer::finish`] deliberately does not flush the remainder —
/// the channel carries lines only.
pub struct LineFramer<W> {
    sink: W,
    frame_type: FrameType,
    buf: BytesMut,
}

impl<W> LineFramer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(sink: W, frame_type: FrameType) -> Self {
        Self {
            sink,
            frame_type,
            buf: BytesMut::new(),
        }
    }

    /// Append `data`, emitting a frame for every complete line now in
    /// the buffer.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            write_frame(&mut self.sink, self.frame_type, &line).await?;
        }
        Ok(())
    }

    /// Bytes currently buffered without a terminating newline.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Drop any unterminated remainder and hand the sink back.
    pub fn finish(self) -> W {
        self.sink
    }
}
