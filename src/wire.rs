//! Length-prefixed binary framing shared by the client-facing protocol
//! (see [`crate::dispatcher`]) and the RPC protocol to the origin (see
//! [`crate::rpc::tcp`]).
//!
//! Every frame is a `u32` big-endian byte length followed by that many
//! bytes of tag+payload, built on [`byteorder`] primitives the way the
//! parser/serializer layers this was adapted from encode primitives: fixed-width
//! big-endian integers and length-prefixed byte strings. A malformed frame
//! (declared length past the sanity ceiling) is rejected rather than panicking.

use std::io;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frames larger than this are rejected as malformed; nothing this protocol
/// carries legitimately exceeds one chunk plus a small header.
pub const MAX_FRAME_LEN: u32 = crate::rpc::CHUNK_SIZE as u32 + 4096;

/// Read one length-prefixed frame from `reader`. Returns `Ok(None)` on clean EOF.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds sanity ceiling {MAX_FRAME_LEN}"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame to `writer`.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> io::Result<()> {
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// A small encoder over an in-memory buffer, mirroring the primitive
/// encoders used elsewhere in this codebase.
#[derive(Default)]
pub struct Encoder(Vec<u8>);

impl Encoder {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.0.write_u32::<BigEndian>(v).expect("write to Vec cannot fail");
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.0.write_u64::<BigEndian>(v).expect("write to Vec cannot fail");
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.0.write_i64::<BigEndian>(v).expect("write to Vec cannot fail");
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.0.extend_from_slice(v);
        self
    }

    pub fn path(&mut self, v: &Path) -> &mut Self {
        self.bytes(v.to_string_lossy().as_bytes());
        self
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

/// A small cursor-backed decoder, the read-side counterpart of [`Encoder`].
pub struct Decoder<'a> {
    cursor: io::Cursor<&'a [u8]>,
}

#[derive(Debug)]
pub struct DecodeError;

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed frame")
    }
}
impl std::error::Error for DecodeError {}

type DecodeResult<T> = std::result::Result<T, DecodeError>;

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { cursor: io::Cursor::new(buf) }
    }

    pub fn u8(&mut self) -> DecodeResult<u8> {
        self.cursor.read_u8().map_err(|_| DecodeError)
    }

    pub fn u32(&mut self) -> DecodeResult<u32> {
        self.cursor.read_u32::<BigEndian>().map_err(|_| DecodeError)
    }

    pub fn u64(&mut self) -> DecodeResult<u64> {
        self.cursor.read_u64::<BigEndian>().map_err(|_| DecodeError)
    }

    pub fn i64(&mut self) -> DecodeResult<i64> {
        self.cursor.read_i64::<BigEndian>().map_err(|_| DecodeError)
    }

    pub fn bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let len = self.u32()? as usize;
        let remaining = self.cursor.get_ref().len().saturating_sub(self.cursor.position() as usize);
        if len > remaining {
            return Err(DecodeError);
        }
        let mut buf = vec![0u8; len];
        std::io::Read::read_exact(&mut self.cursor, &mut buf).map_err(|_| DecodeError)?;
        Ok(buf)
    }

    pub fn path(&mut self) -> DecodeResult<PathBuf> {
        let bytes = self.bytes()?;
        Ok(PathBuf::from(String::from_utf8(bytes).map_err(|_| DecodeError)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut enc = Encoder::new();
        enc.u8(7).u32(42).u64(9_000_000_000).i64(-5).bytes(b"hello").path(Path::new("a/b.txt"));
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.u8().unwrap(), 7);
        assert_eq!(dec.u32().unwrap(), 42);
        assert_eq!(dec.u64().unwrap(), 9_000_000_000);
        assert_eq!(dec.i64().unwrap(), -5);
        assert_eq!(dec.bytes().unwrap(), b"hello");
        assert_eq!(dec.path().unwrap(), PathBuf::from("a/b.txt"));
    }

    #[tokio::test]
    async fn frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"payload").await.unwrap();
        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, b"payload");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_u32(MAX_FRAME_LEN + 1).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn bytes_with_declared_len_past_buffer_end_is_rejected() {
        // declares a 4 GiB payload but the buffer backing it is a few bytes;
        // must be rejected before any allocation is attempted.
        let mut enc = Encoder::new();
        enc.u32(u32::MAX);
        let buf = enc.into_vec();

        let mut dec = Decoder::new(&buf);
        assert!(dec.bytes().is_err());
    }
}
