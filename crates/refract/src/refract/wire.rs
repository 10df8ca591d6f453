use std::{
    io::{Read, Write},
    net::SocketAddr,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use uuid::Uuid;

use crate::refract::crypto::{Decryptor, Encryptor};

/// Largest frame accepted on either leg (the 3-byte VarInt limit).
pub const MAX_PACKET_BYTES: usize = 2_097_151;
pub const MAX_STRING_BYTES: usize = 32767 * 3;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("varint too long")]
    VarIntTooLong,
    #[error("unexpected end of packet")]
    Eof,
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
    #[error("string too long: {0} bytes")]
    StringTooLong(usize),
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("decompressed length mismatch (declared {declared}, got {actual})")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("connection closed mid-frame")]
    TruncatedFrame,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// True when the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::TruncatedFrame => true,
            WireError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Decodes a VarInt prefix. `Ok(None)` means more bytes are needed.
pub fn read_varint(buf: &[u8]) -> Result<Option<(i32, usize)>, WireError> {
    let mut result: i32 = 0;
    for (i, &read) in buf.iter().enumerate() {
        if i >= 5 {
            return Err(WireError::VarIntTooLong);
        }
        result |= ((read & 0x7F) as i32) << (7 * i);
        if (read & 0x80) == 0 {
            return Ok(Some((result, i + 1)));
        }
    }
    if buf.len() >= 5 {
        return Err(WireError::VarIntTooLong);
    }
    Ok(None)
}

pub fn put_varint(out: &mut BytesMut, value: i32) {
    let mut n = value as u32;
    loop {
        let mut temp = (n & 0x7F) as u8;
        n >>= 7;
        if n != 0 {
            temp |= 0x80;
        }
        out.put_u8(temp);
        if n == 0 {
            break;
        }
    }
}

pub fn varint_len(value: i32) -> usize {
    let mut n = value as u32;
    let mut len = 1;
    while n >= 0x80 {
        n >>= 7;
        len += 1;
    }
    len
}

/// One decoded (decompressed, decrypted) packet: id plus the bytes after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub body: Bytes,
}

impl Packet {
    pub fn new(id: i32, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.body)
    }

    fn encode_payload(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(varint_len(self.id) + self.body.len());
        put_varint(&mut out, self.id);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Cursor over a packet body.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn varint(&mut self) -> Result<i32, WireError> {
        let (v, n) = read_varint(self.buf)?.ok_or(WireError::Eof)?;
        self.buf = &self.buf[n..];
        Ok(v)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Eof);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let mut b = self.take(2)?;
        Ok(b.get_u16())
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        let mut b = self.take(4)?;
        Ok(b.get_i32())
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        let mut b = self.take(8)?;
        Ok(b.get_i64())
    }

    pub fn uuid(&mut self) -> Result<Uuid, WireError> {
        let mut b = self.take(16)?;
        Ok(Uuid::from_u128(b.get_u128()))
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let len = self.varint()?;
        if len < 0 {
            return Err(WireError::NegativeLength(len));
        }
        let len = len as usize;
        if len > MAX_STRING_BYTES {
            return Err(WireError::StringTooLong(len));
        }
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }

    pub fn byte_array(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.varint()?;
        if len < 0 {
            return Err(WireError::NegativeLength(len));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Pre-1.8 byte arrays carry a big-endian i16 length.
    pub fn short_byte_array(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as i16;
        if len < 0 {
            return Err(WireError::NegativeLength(len as i32));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Builder for a packet body.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn varint(&mut self, v: i32) -> &mut Self {
        put_varint(&mut self.buf, v);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(v as u8);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64(v);
        self
    }

    pub fn uuid(&mut self, v: Uuid) -> &mut Self {
        self.buf.put_u128(v.as_u128());
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        put_varint(&mut self.buf, s.len() as i32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn byte_array(&mut self, b: &[u8]) -> &mut Self {
        put_varint(&mut self.buf, b.len() as i32);
        self.buf.extend_from_slice(b);
        self
    }

    pub fn short_byte_array(&mut self, b: &[u8]) -> &mut Self {
        self.buf.put_u16(b.len() as u16);
        self.buf.extend_from_slice(b);
        self
    }

    pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    pub fn finish(&mut self, id: i32) -> Packet {
        Packet::new(id, std::mem::take(&mut self.buf).freeze())
    }
}

/// Encodes one frame: length prefix, optional compression envelope, id and body.
pub fn encode_frame(packet: &Packet, compression: Option<i32>) -> Result<BytesMut, WireError> {
    let payload = packet.encode_payload();

    let inner = match compression {
        Some(threshold) => {
            let mut body = BytesMut::new();
            if threshold >= 0 && payload.len() >= threshold as usize {
                put_varint(&mut body, payload.len() as i32);
                let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
                enc.write_all(&payload)?;
                body.extend_from_slice(&enc.finish()?);
            } else {
                put_varint(&mut body, 0);
                body.extend_from_slice(&payload);
            }
            body
        }
        None => payload,
    };

    if inner.len() > MAX_PACKET_BYTES {
        return Err(WireError::TooLarge(inner.len()));
    }

    let mut frame = BytesMut::with_capacity(varint_len(inner.len() as i32) + inner.len());
    put_varint(&mut frame, inner.len() as i32);
    frame.extend_from_slice(&inner);
    Ok(frame)
}

fn decode_frame(frame: Bytes, compression: Option<i32>) -> Result<Packet, WireError> {
    let payload = match compression {
        Some(_) => {
            let mut r = PacketReader::new(&frame);
            let declared = r.varint()?;
            if declared < 0 {
                return Err(WireError::NegativeLength(declared));
            }
            let declared = declared as usize;
            let offset = frame.len() - r.remaining().len();
            if declared == 0 {
                frame.slice(offset..)
            } else {
                if declared > MAX_PACKET_BYTES {
                    return Err(WireError::TooLarge(declared));
                }
                let mut out = Vec::with_capacity(declared);
                ZlibDecoder::new(&frame[offset..])
                    .take(declared as u64 + 1)
                    .read_to_end(&mut out)?;
                if out.len() != declared {
                    return Err(WireError::LengthMismatch {
                        declared,
                        actual: out.len(),
                    });
                }
                Bytes::from(out)
            }
        }
        None => frame,
    };

    let (id, n) = read_varint(&payload)?.ok_or(WireError::Eof)?;
    Ok(Packet::new(id, payload.slice(n..)))
}

/// Reading half of a framed leg. Compression and decryption are leg-local state.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    compression: Option<i32>,
    decryptor: Option<Decryptor>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_prefix(inner, BytesMut::new())
    }

    /// Starts from bytes that were already read off the socket (plaintext).
    pub fn with_prefix(inner: R, prefix: BytesMut) -> Self {
        Self {
            inner,
            buf: prefix,
            compression: None,
            decryptor: None,
        }
    }

    pub fn set_compression(&mut self, threshold: Option<i32>) {
        self.compression = threshold.filter(|t| *t >= 0);
    }

    pub fn compression(&self) -> Option<i32> {
        self.compression
    }

    /// Anything still buffered arrived after the switch, so it is decrypted in place.
    pub fn enable_decryption(&mut self, key: &[u8; 16]) {
        let mut dec = Decryptor::new(key);
        dec.apply(&mut self.buf);
        self.decryptor = Some(dec);
    }

    pub fn is_encrypted(&self) -> bool {
        self.decryptor.is_some()
    }

    /// Returns `Ok(None)` on a clean EOF between frames.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, WireError> {
        loop {
            if let Some((len, n)) = read_varint(&self.buf)? {
                if len < 0 {
                    return Err(WireError::NegativeLength(len));
                }
                let len = len as usize;
                if len > MAX_PACKET_BYTES {
                    return Err(WireError::TooLarge(len));
                }
                if self.buf.len() >= n + len {
                    self.buf.advance(n);
                    let frame = self.buf.split_to(len).freeze();
                    return decode_frame(frame, self.compression).map(Some);
                }
            }

            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(WireError::TruncatedFrame);
            }
        }
    }

    async fn fill(&mut self) -> Result<bool, WireError> {
        let start = self.buf.len();
        self.buf.reserve(4096);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Ok(false);
        }
        if let Some(dec) = self.decryptor.as_mut() {
            dec.apply(&mut self.buf[start..]);
        }
        Ok(true)
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

/// Writing half of a framed leg.
pub struct FrameWriter<W> {
    inner: W,
    compression: Option<i32>,
    encryptor: Option<Encryptor>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            compression: None,
            encryptor: None,
        }
    }

    pub fn set_compression(&mut self, threshold: Option<i32>) {
        self.compression = threshold.filter(|t| *t >= 0);
    }

    pub fn compression(&self) -> Option<i32> {
        self.compression
    }

    pub fn enable_encryption(&mut self, key: &[u8; 16]) {
        self.encryptor = Some(Encryptor::new(key));
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_some()
    }

    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), WireError> {
        let mut frame = encode_frame(packet, self.compression)?;
        if let Some(enc) = self.encryptor.as_mut() {
            enc.apply(&mut frame);
        }
        self.inner.write_all(&frame).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.flush().await;
        let _ = self.inner.shutdown().await;
    }
}

/// A framed TCP leg used while the login state machine drives it directly.
pub struct FramedConn {
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: FrameWriter<OwnedWriteHalf>,
    pub peer: SocketAddr,
}

impl FramedConn {
    pub fn new(stream: TcpStream, prefix: BytesMut) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FrameReader::with_prefix(r, prefix),
            writer: FrameWriter::new(w),
            peer,
        })
    }

    pub async fn read_packet(&mut self) -> Result<Option<Packet>, WireError> {
        self.reader.read_packet().await
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), WireError> {
        self.writer.write_packet(packet).await
    }

    pub fn set_compression(&mut self, threshold: Option<i32>) {
        self.reader.set_compression(threshold);
        self.writer.set_compression(threshold);
    }

    pub fn enable_encryption(&mut self, key: &[u8; 16]) {
        self.reader.enable_decryption(key);
        self.writer.enable_encryption(key);
    }

    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_known_values() {
        let cases: &[(i32, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (25565, &[0xDD, 0xC7, 0x01]),
            (2097151, &[0xFF, 0xFF, 0x7F]),
            (-1, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        ];
        for (v, bytes) in cases {
            let mut out = BytesMut::new();
            put_varint(&mut out, *v);
            assert_eq!(&out[..], *bytes, "encode {v}");
            assert_eq!(varint_len(*v), bytes.len());
            assert_eq!(read_varint(bytes).unwrap(), Some((*v, bytes.len())));
        }
    }

    #[test]
    fn varint_needs_more_and_too_long() {
        assert_eq!(read_varint(&[0x80]).unwrap(), None);
        assert!(matches!(
            read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(WireError::VarIntTooLong)
        ));
    }

    #[test]
    fn below_threshold_frames_carry_zero_data_length() {
        let p = Packet::new(0x05, vec![1, 2, 3]);
        let frame = encode_frame(&p, Some(256)).unwrap();
        // len=5, data_len=0, id=5, body
        assert_eq!(&frame[..], &[5, 0, 5, 1, 2, 3]);
    }

    #[tokio::test]
    async fn compressed_frames_decode_on_a_matching_reader() {
        let body = vec![7u8; 1000];
        let p = Packet::new(0x21, body.clone());
        let frame = encode_frame(&p, Some(64)).unwrap();
        assert!(frame.len() < 200, "payload should have been deflated");

        let mut r = FrameReader::new(&frame[..]);
        r.set_compression(Some(64));
        let got = r.read_packet().await.unwrap().unwrap();
        assert_eq!(got.id, 0x21);
        assert_eq!(&got.body[..], &body[..]);
        assert!(r.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn encrypted_round_trip_across_frames() {
        let key = [9u8; 16];
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut w = FrameWriter::new(a);
        let mut r = FrameReader::new(b);
        w.enable_encryption(&key);
        r.enable_decryption(&key);

        for i in 0..3 {
            w.write_packet(&Packet::new(i, vec![i as u8; 10])).await.unwrap();
        }
        for i in 0..3 {
            let p = r.read_packet().await.unwrap().unwrap();
            assert_eq!(p.id, i);
            assert_eq!(&p.body[..], &[i as u8; 10]);
        }
    }

    #[tokio::test]
    async fn truncated_frame_is_reported() {
        let data: &[u8] = &[10, 0, 1, 2];
        let mut r = FrameReader::new(data);
        let err = r.read_packet().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn reader_parses_strings_and_uuids() {
        let id = Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        let p = PacketWriter::new()
            .string("hello")
            .uuid(id)
            .u16(25565)
            .finish(0);
        let mut r = p.reader();
        assert_eq!(r.string().unwrap(), "hello");
        assert_eq!(r.uuid().unwrap(), id);
        assert_eq!(r.u16().unwrap(), 25565);
        assert!(r.is_empty());
        assert!(matches!(r.u8(), Err(WireError::Eof)));
    }
}
