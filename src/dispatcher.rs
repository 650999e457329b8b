//! Client-facing accept loop and per-connection request dispatch (C5).
//!
//! One task per connection: each connection owns a private [`Session`], so
//! operations from one client are trivially serialized relative to each
//! other and never interleave with another client's.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::cache::Cache;
use crate::error::Errno;
use crate::rpc::{Origin, CHUNK_SIZE};
use crate::session::{OpenMode, Session, Whence};
use crate::wire::{read_frame, write_frame, Decoder, Encoder};

const OP_OPEN: u8 = 0;
const OP_READ: u8 = 1;
const OP_WRITE: u8 = 2;
const OP_CLOSE: u8 = 3;
const OP_LSEEK: u8 = 4;
const OP_UNLINK: u8 = 5;

const RESP_OK: u8 = 0;
const RESP_ERR: u8 = 1;

fn mode_from_tag(tag: u8) -> Option<OpenMode> {
    Some(match tag {
        0 => OpenMode::Read,
        1 => OpenMode::Write,
        2 => OpenMode::Create,
        3 => OpenMode::CreateNew,
        _ => return None,
    })
}

fn whence_from_tag(tag: u8) -> Option<Whence> {
    Some(match tag {
        0 => Whence::Start,
        1 => Whence::Current,
        2 => Whence::End,
        _ => return None,
    })
}

/// Accept connections on `listener` forever, serving each with its own [`Session`].
pub async fn serve(listener: TcpListener, cache: Arc<Cache>, origin: Arc<dyn Origin>) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let cache = cache.clone();
        let origin = origin.clone();
        tokio::spawn(async move {
            info!(%peer, "client connected");
            if let Err(err) = handle_connection(socket, cache, origin).await {
                warn!(%peer, %err, "client connection ended with error");
            } else {
                info!(%peer, "client disconnected");
            }
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    cache: Arc<Cache>,
    origin: Arc<dyn Origin>,
) -> std::io::Result<()> {
    let mut session = Session::new(cache, origin);

    while let Some(frame) = read_frame(&mut socket).await? {
        if frame.len() < 8 {
            warn!("client request frame too short");
            break;
        }
        let mut id_dec = Decoder::new(&frame[..8]);
        let id = id_dec.u64().expect("8 bytes always decode as u64");
        let reply_body = dispatch(&mut session, &frame[8..]).await;

        let mut reply = Encoder::new();
        reply.u64(id);
        let mut reply_bytes = reply.into_vec();
        reply_bytes.extend_from_slice(&reply_body);
        write_frame(&mut socket, &reply_bytes).await?;
    }

    session.clientdone().await;
    Ok(())
}

fn encode_err(e: Errno) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.u8(RESP_ERR).u8(e.tag());
    enc.into_vec()
}

async fn dispatch(session: &mut Session, frame: &[u8]) -> Vec<u8> {
    let mut dec = Decoder::new(frame);
    let Ok(op) = dec.u8() else { return encode_err(Errno::Inval) };

    match op {
        OP_OPEN => {
            let (Ok(path), Ok(mode_raw)) = (dec.path(), dec.u8()) else {
                return encode_err(Errno::Inval);
            };
            let Some(mode) = mode_from_tag(mode_raw) else { return encode_err(Errno::Inval) };
            match session.open(&path, mode).await {
                Ok(handle) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_OK).u64(handle);
                    e.into_vec()
                }
                Err(err) => encode_err(err),
            }
        }

        OP_READ => {
            let (Ok(handle), Ok(len)) = (dec.u64(), dec.u32()) else {
                return encode_err(Errno::Inval);
            };
            if len as usize > CHUNK_SIZE {
                return encode_err(Errno::Inval);
            }
            let mut buf = vec![0u8; len as usize];
            match session.read(handle, &mut buf).await {
                Ok(n) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_OK).bytes(&buf[..n]);
                    e.into_vec()
                }
                Err(err) => encode_err(err),
            }
        }

        OP_WRITE => {
            let (Ok(handle), Ok(bytes)) = (dec.u64(), dec.bytes()) else {
                return encode_err(Errno::Inval);
            };
            match session.write(handle, &bytes).await {
                Ok(n) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_OK).u32(n as u32);
                    e.into_vec()
                }
                Err(err) => encode_err(err),
            }
        }

        OP_CLOSE => {
            let Ok(handle) = dec.u64() else { return encode_err(Errno::Inval) };
            match session.close(handle).await {
                Ok(()) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_OK);
                    e.into_vec()
                }
                Err(err) => encode_err(err),
            }
        }

        OP_LSEEK => {
            let (Ok(handle), Ok(pos), Ok(whence_raw)) = (dec.u64(), dec.i64(), dec.u8()) else {
                return encode_err(Errno::Inval);
            };
            let Some(whence) = whence_from_tag(whence_raw) else {
                return encode_err(Errno::Inval);
            };
            match session.lseek(handle, pos, whence).await {
                Ok(offset) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_OK).u64(offset);
                    e.into_vec()
                }
                Err(err) => encode_err(err),
            }
        }

        OP_UNLINK => {
            let Ok(path) = dec.path() else { return encode_err(Errno::Inval) };
            match session.unlink(&path).await {
                Ok(()) => {
                    let mut e = Encoder::new();
                    e.u8(RESP_OK);
                    e.into_vec()
                }
                Err(err) => encode_err(err),
            }
        }

        _ => encode_err(Errno::Inval),
    }
}
