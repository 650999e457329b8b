//! TCP implementation of the [`Origin`] RPC client, and the matching server
//! loop that exposes an [`OriginServer`] (or any `Origin` impl) to the network.
//!
//! Requests and replies are length-prefixed frames (see [`crate::wire`])
//! carrying an opaque correlation id that the reply echoes back, mirroring
//! the role `xid` plays in the RPC layer this was adapted from. Calls on one
//! [`TcpOrigin`] are serialized through a mutex around the shared connection:
//! the origin is a process-wide singleton and RPC calls block anyway, so
//! there is no fast path worth multiplexing.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{error, warn};

use super::{FetchResponse, Origin, OriginError, Result, TransportError};
use crate::session::OpenMode;
use crate::wire::{read_frame, write_frame, Decoder, Encoder};

const TAG_FETCH: u8 = 0;
const TAG_WRITE: u8 = 1;
const TAG_UNLINK: u8 = 2;

const RESP_INVALID: u8 = 0;
const RESP_UP_TO_DATE: u8 = 1;
const RESP_CHUNK: u8 = 2;
const RESP_OK: u8 = 3;
const RESP_ERR: u8 = 4;

fn mode_tag(mode: OpenMode) -> u8 {
    match mode {
        OpenMode::Read => 0,
        OpenMode::Write => 1,
        OpenMode::Create => 2,
        OpenMode::CreateNew => 3,
    }
}

fn mode_from_tag(tag: u8) -> Option<OpenMode> {
    Some(match tag {
        0 => OpenMode::Read,
        1 => OpenMode::Write,
        2 => OpenMode::Create,
        3 => OpenMode::CreateNew,
        _ => return None,
    })
}

fn error_tag(error: OriginError) -> u8 {
    match error {
        OriginError::Perm => 0,
        OriginError::NoEnt => 1,
        OriginError::Exist => 2,
        OriginError::IsDir => 3,
    }
}

fn error_from_tag(tag: u8) -> Option<OriginError> {
    Some(match tag {
        0 => OriginError::Perm,
        1 => OriginError::NoEnt,
        2 => OriginError::Exist,
        3 => OriginError::IsDir,
        _ => return None,
    })
}

/// RPC client speaking the wire protocol to a remote origin server over TCP.
pub struct TcpOrigin {
    stream: Mutex<TcpStream>,
    next_id: AtomicU64,
}

impl TcpOrigin {
    /// Connect to the origin at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream: Mutex::new(stream), next_id: AtomicU64::new(0) })
    }

    async fn roundtrip(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut framed = Encoder::new();
        framed.u64(id);
        let mut payload = framed.into_vec();
        payload.extend_from_slice(&request);

        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &payload).await.map_err(|e| TransportError(e.to_string()))?;
        let reply = read_frame(&mut *stream)
            .await
            .map_err(|e| TransportError(e.to_string()))?
            .ok_or_else(|| TransportError("origin closed connection".to_string()))?;

        let mut dec = Decoder::new(&reply);
        let reply_id = dec.u64().map_err(|_| TransportError("malformed reply".to_string()))?;
        if reply_id != id {
            return Err(TransportError(format!(
                "reply id {reply_id} does not match request id {id}"
            )));
        }
        Ok(reply[8..].to_vec())
    }
}

#[async_trait]
impl Origin for TcpOrigin {
    async fn fetch(
        &self,
        path: &Path,
        mode: OpenMode,
        known_version: i64,
        offset: u64,
    ) -> Result<FetchResponse> {
        let mut enc = Encoder::new();
        enc.u8(TAG_FETCH).path(path).u8(mode_tag(mode)).i64(known_version).u64(offset);
        let body = self.roundtrip(enc.into_vec()).await?;

        let mut dec = Decoder::new(&body);
        let tag = dec.u8().map_err(|_| TransportError("malformed fetch reply".into()))?;
        match tag {
            RESP_INVALID => {
                let error_tag = dec.u8().map_err(|_| TransportError("malformed reply".into()))?;
                let error = error_from_tag(error_tag)
                    .ok_or_else(|| TransportError("unknown error tag".into()))?;
                Ok(FetchResponse::Invalid { error })
            }
            RESP_UP_TO_DATE => {
                let version = dec.i64().map_err(|_| TransportError("malformed reply".into()))?;
                Ok(FetchResponse::UpToDate { version })
            }
            RESP_CHUNK => {
                let version = dec.i64().map_err(|_| TransportError("malformed reply".into()))?;
                let file_size = dec.u64().map_err(|_| TransportError("malformed reply".into()))?;
                let bytes = dec.bytes().map_err(|_| TransportError("malformed reply".into()))?;
                Ok(FetchResponse::Chunk { version, file_size, bytes })
            }
            _ => Err(TransportError("unknown fetch response tag".into())),
        }
    }

    async fn write(
        &self,
        path: &Path,
        bytes: &[u8],
        offset: u64,
    ) -> Result<std::result::Result<i64, OriginError>> {
        let mut enc = Encoder::new();
        enc.u8(TAG_WRITE).path(path).bytes(bytes).u64(offset);
        let body = self.roundtrip(enc.into_vec()).await?;

        let mut dec = Decoder::new(&body);
        let tag = dec.u8().map_err(|_| TransportError("malformed write reply".into()))?;
        match tag {
            RESP_OK => {
                let version = dec.i64().map_err(|_| TransportError("malformed reply".into()))?;
                Ok(Ok(version))
            }
            RESP_ERR => {
                let error_tag = dec.u8().map_err(|_| TransportError("malformed reply".into()))?;
                let error = error_from_tag(error_tag)
                    .ok_or_else(|| TransportError("unknown error tag".into()))?;
                Ok(Err(error))
            }
            _ => Err(TransportError("unknown write response tag".into())),
        }
    }

    async fn unlink(&self, path: &Path) -> Result<std::result::Result<(), OriginError>> {
        let mut enc = Encoder::new();
        enc.u8(TAG_UNLINK).path(path);
        let body = self.roundtrip(enc.into_vec()).await?;

        let mut dec = Decoder::new(&body);
        let tag = dec.u8().map_err(|_| TransportError("malformed unlink reply".into()))?;
        match tag {
            RESP_OK => Ok(Ok(())),
            RESP_ERR => {
                let error_tag = dec.u8().map_err(|_| TransportError("malformed reply".into()))?;
                let error = error_from_tag(error_tag)
                    .ok_or_else(|| TransportError("unknown error tag".into()))?;
                Ok(Err(error))
            }
            _ => Err(TransportError("unknown unlink response tag".into())),
        }
    }
}

/// Serve `origin` to the network, accepting connections on `listener` forever.
pub async fn serve_origin(
    listener: TcpListener,
    origin: std::sync::Arc<dyn Origin>,
) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let origin = origin.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_origin_connection(socket, origin).await {
                warn!(%peer, %err, "origin connection ended with error");
            }
        });
    }
}

async fn handle_origin_connection(
    mut socket: TcpStream,
    origin: std::sync::Arc<dyn Origin>,
) -> std::io::Result<()> {
    while let Some(frame) = read_frame(&mut socket).await? {
        if frame.len() < 8 {
            error!("origin request frame too short");
            break;
        }
        let mut id_dec = Decoder::new(&frame[..8]);
        let id = id_dec.u64().expect("8 bytes always decode as u64");
        let reply_body = dispatch_origin_request(&origin, &frame[8..]).await;

        let mut reply = Encoder::new();
        reply.u64(id);
        let mut reply_bytes = reply.into_vec();
        reply_bytes.extend_from_slice(&reply_body);
        write_frame(&mut socket, &reply_bytes).await?;
    }
    Ok(())
}

async fn dispatch_origin_request(origin: &std::sync::Arc<dyn Origin>, body: &[u8]) -> Vec<u8> {
    let mut dec = Decoder::new(body);
    let Ok(tag) = dec.u8() else { return encode_transport_failure() };
    match tag {
        TAG_FETCH => {
            let (Ok(path), Ok(mode_raw), Ok(known_version), Ok(offset)) =
                (dec.path(), dec.u8(), dec.i64(), dec.u64())
            else {
                return encode_transport_failure();
            };
            let Some(mode) = mode_from_tag(mode_raw) else { return encode_transport_failure() };
            match origin.fetch(&path, mode, known_version, offset).await {
                Ok(FetchResponse::Invalid { error }) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_INVALID).u8(error_tag(error));
                    e.into_vec()
                }
                Ok(FetchResponse::UpToDate { version }) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_UP_TO_DATE).i64(version);
                    e.into_vec()
                }
                Ok(FetchResponse::Chunk { version, file_size, bytes }) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_CHUNK).i64(version).u64(file_size).bytes(&bytes);
                    e.into_vec()
                }
                Err(_) => encode_transport_failure(),
            }
        }
        TAG_WRITE => {
            let (Ok(path), Ok(bytes), Ok(offset)) = (dec.path(), dec.bytes(), dec.u64()) else {
                return encode_transport_failure();
            };
            match origin.write(&path, &bytes, offset).await {
                Ok(Ok(version)) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_OK).i64(version);
                    e.into_vec()
                }
                Ok(Err(error)) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_ERR).u8(error_tag(error));
                    e.into_vec()
                }
                Err(_) => encode_transport_failure(),
            }
        }
        TAG_UNLINK => {
            let Ok(path) = dec.path() else { return encode_transport_failure() };
            match origin.unlink(&path).await {
                Ok(Ok(())) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_OK);
                    e.into_vec()
                }
                Ok(Err(error)) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_ERR).u8(error_tag(error));
                    e.into_vec()
                }
                Err(_) => encode_transport_failure(),
            }
        }
        _ => encode_transport_failure(),
    }
}

fn encode_transport_failure() -> Vec<u8> {
    let mut e = Encoder::new();
    e.u8(RESP_ERR).u8(error_tag(OriginError::Perm));
    e.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn tcp_roundtrip_fetch_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let origin: Arc<dyn Origin> = Arc::new(super::super::OriginServer::new(dir.path().to_path_buf()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_origin(listener, origin));

        let client = TcpOrigin::connect(&addr.to_string()).await.unwrap();
        let created =
            client.fetch(Path::new("foo"), OpenMode::CreateNew, -1, 0).await.unwrap();
        assert!(matches!(created, FetchResponse::Chunk { file_size: 0, .. }));

        let version = client.write(Path::new("foo"), b"hi", 0).await.unwrap().unwrap();
        assert_eq!(version, 2);

        let fetched = client.fetch(Path::new("foo"), OpenMode::Read, -1, 0).await.unwrap();
        match fetched {
            FetchResponse::Chunk { bytes, file_size, .. } => {
                assert_eq!(file_size, 2);
                assert_eq!(bytes, b"hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
