//! Wire framing for the packet protocol
//!
//! Every packet starts with a fixed 4-byte header: packet-type identifier
//! and declared payload byte length, both little-endian. Payload bytes
//! follow. The stream reader enforces that payload bytes total exactly the
//! declared length before type-specific parsing begins; datagram-style
//! inputs are parsed as-is so the connection state machine can judge
//! declared-vs-actual itself.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed header: u16 packet type + u16 declared payload size
pub const HEADER_SIZE: usize = 4;

/// Upper bound on a single payload; the u16 size field caps it anyway
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Errors that can occur during packet framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Payload too large: {0} bytes (max {1})")]
    PayloadTooLarge(usize, usize),
    #[error("Buffer too short for packet header: {0} bytes")]
    HeaderTooShort(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Packet-type identifier plus declared payload size, as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u16,
    pub size: u16,
}

impl PacketHeader {
    pub fn new(packet_type: u16, size: u16) -> Self {
        Self { packet_type, size }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let t = self.packet_type.to_le_bytes();
        let s = self.size.to_le_bytes();
        [t[0], t[1], s[0], s[1]]
    }

    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        Self {
            packet_type: u16::from_le_bytes([bytes[0], bytes[1]]),
            size: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

/// A complete received packet: header paired with the bytes that actually
/// arrived. `payload.len()` is the *actual* size; `header.size` is what the
/// sender declared.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Parse a datagram-style buffer: header first, everything after it is
    /// the payload regardless of what the header declares
    pub fn parse(buf: &[u8]) -> Result<Frame, FramingError> {
        if buf.len() < HEADER_SIZE {
            return Err(FramingError::HeaderTooShort(buf.len()));
        }
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&buf[..HEADER_SIZE]);
        Ok(Frame {
            header: PacketHeader::from_bytes(header_bytes),
            payload: buf[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Read one framed packet from a stream
///
/// Reads the 4-byte header, then exactly `header.size` payload bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Frame, FramingError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    match stream.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed);
        }
        Err(e) => return Err(FramingError::Io(e)),
    }

    let header = PacketHeader::from_bytes(header_bytes);
    let len = header.size as usize;

    if len == 0 {
        return Ok(Frame {
            header,
            payload: Vec::new(),
        });
    }

    let mut payload = vec![0u8; len];
    match stream.read_exact(&mut payload).await {
        Ok(_) => Ok(Frame { header, payload }),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionClosed),
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Write one framed packet to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    packet_type: u16,
    payload: &[u8],
) -> Result<(), FramingError> {
    let bytes = encode_frame(packet_type, payload)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Build the on-wire bytes for a packet: header followed by payload
pub fn encode_frame(packet_type: u16, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FramingError::PayloadTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
    }
    let header = PacketHeader::new(packet_type, payload.len() as u16);
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&header.to_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Frame builder for constructing payloads
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
        }
    }

    /// Write raw bytes to the payload
    pub fn write(mut self, data: &[u8]) -> Self {
        self.buffer.extend_from_slice(data);
        self
    }

    /// Write a u8
    pub fn write_u8(mut self, value: u8) -> Self {
        self.buffer.push(value);
        self
    }

    /// Write a u16 (little-endian)
    pub fn write_u16(mut self, value: u16) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a u32 (little-endian)
    pub fn write_u32(mut self, value: u32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a u64 (little-endian)
    pub fn write_u64(mut self, value: u64) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write an f32 (little-endian)
    pub fn write_f32(mut self, value: f32) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Get the built payload
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame reader for parsing payloads
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read n bytes
    pub fn read(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.position + n > self.data.len() {
            return None;
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Some(slice)
    }

    /// Read a u8
    pub fn read_u8(&mut self) -> Option<u8> {
        self.read(1).map(|b| b[0])
    }

    /// Read a u16 (little-endian)
    pub fn read_u16(&mut self) -> Option<u16> {
        self.read(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a u32 (little-endian)
    pub fn read_u32(&mut self) -> Option<u32> {
        self.read(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a u64 (little-endian)
    pub fn read_u64(&mut self) -> Option<u64> {
        self.read(8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read an f32 (little-endian)
    pub fn read_f32(&mut self) -> Option<f32> {
        self.read(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Get remaining bytes without advancing
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    /// Check if there are more bytes to read
    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_round_trip() {
        let header = PacketHeader::new(16, 1234);
        let decoded = PacketHeader::from_bytes(header.to_bytes());
        assert_eq!(decoded, header);
    }

    #[tokio::test]
    async fn test_read_write_frame() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, 7, b"payload here").await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let frame = read_frame(&mut cursor).await.unwrap();

        assert_eq!(frame.header.packet_type, 7);
        assert_eq!(frame.header.size, 12);
        assert_eq!(frame.payload, b"payload here");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, 3, b"").await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let frame = read_frame(&mut cursor).await.unwrap();

        assert_eq!(frame.header.size, 0);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn test_read_truncated_header() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_payload() {
        // Header declares 10 payload bytes, only 3 follow
        let mut buffer = PacketHeader::new(1, 10).to_bytes().to_vec();
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buffer);
        let result = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[test]
    fn test_encode_frame_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result = encode_frame(1, &payload);
        assert!(matches!(result, Err(FramingError::PayloadTooLarge(_, _))));
    }

    #[test]
    fn test_parse_datagram_with_size_lie() {
        // Declared size disagrees with the bytes that follow; parse keeps both
        let mut buf = PacketHeader::new(42, 10).to_bytes().to_vec();
        buf.extend_from_slice(&[9, 9, 9]);

        let frame = Frame::parse(&buf).unwrap();
        assert_eq!(frame.header.size, 10);
        assert_eq!(frame.payload.len(), 3);
    }

    #[test]
    fn test_parse_short_buffer() {
        let result = Frame::parse(&[1, 2]);
        assert!(matches!(result, Err(FramingError::HeaderTooShort(2))));
    }

    #[test]
    fn test_builder_reader_round_trip() {
        let payload = FrameBuilder::new()
            .write_u8(42)
            .write_u16(1000)
            .write_u32(999_999)
            .write_u64(1_234_567_890)
            .write_f32(2.5)
            .write(b"tail")
            .build();

        let mut reader = FrameReader::new(&payload);
        assert_eq!(reader.read_u8(), Some(42));
        assert_eq!(reader.read_u16(), Some(1000));
        assert_eq!(reader.read_u32(), Some(999_999));
        assert_eq!(reader.read_u64(), Some(1_234_567_890));
        assert!((reader.read_f32().unwrap() - 2.5).abs() < 0.001);
        assert_eq!(reader.remaining(), b"tail");
    }

    #[test]
    fn test_reader_overflow() {
        let data = vec![1, 2, 3];
        let mut reader = FrameReader::new(&data);
        assert!(reader.read_u16().is_some());
        assert!(reader.read_u16().is_none());
        assert!(reader.has_remaining());
    }

    #[tokio::test]
    async fn test_multiple_frames_on_stream() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, 1, b"first").await.unwrap();
        write_frame(&mut buffer, 2, b"second one").await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let a = read_frame(&mut cursor).await.unwrap();
        let b = read_frame(&mut cursor).await.unwrap();
        assert_eq!(a.header.packet_type, 1);
        assert_eq!(b.header.packet_type, 2);
        assert_eq!(b.payload, b"second one");
    }
}
