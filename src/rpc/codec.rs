use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config;
use crate::error::{FsError, FsResult};

/// A connection carrying length-delimited frames.
pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

pub fn framed(stream: TcpStream) -> FramedStream {
    LengthDelimitedCodec::builder()
        .max_frame_length(config::rpc::MAX_FRAME_SIZE)
        .new_framed(stream)
}

/// Encode one frame: `u32` header length (big endian), the JSON-encoded
/// header, then the raw bulk bytes.
pub fn encode_frame<T: Serialize>(header: &T, bulk: &[u8]) -> FsResult<Bytes> {
    let header = serde_json::to_vec(header)?;
    let mut frame = BytesMut::with_capacity(4 + header.len() + bulk.len());
    frame.put_u32(header.len() as u32);
    frame.put_slice(&header);
    frame.put_slice(bulk);
    Ok(frame.freeze())
}

/// Split one received frame back into header and bulk payload.
pub fn decode_frame<T: DeserializeOwned>(frame: BytesMut) -> FsResult<(T, Bytes)> {
    let mut frame = frame.freeze();
    if frame.len() < 4 {
        return Err(FsError::InvalidArgument("short frame".into()));
    }
    let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let _ = frame.split_to(4);
    if frame.len() < header_len {
        return Err(FsError::InvalidArgument("truncated frame header".into()));
    }
    let header = frame.split_to(header_len);
    let header = serde_json::from_slice(&header)?;
    Ok((header, frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Request;

    #[test]
    fn frame_roundtrip() {
        let req = Request::Write {
            path: "/f".into(),
            offset: 3,
            chunk_start: 0,
            chunk_end: 1,
            total_size: 10,
        };
        let bulk = b"0123456789";
        let encoded = encode_frame(&req, bulk).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded);
        let (decoded, got_bulk): (Request, Bytes) = decode_frame(buf).unwrap();
        match decoded {
            Request::Write {
                path, total_size, ..
            } => {
                assert_eq!(path, "/f");
                assert_eq!(total_size, 10);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
        assert_eq!(&got_bulk[..], bulk);
    }

    #[test]
    fn empty_bulk_is_fine() {
        let encoded = encode_frame(&Request::ChunkStat, &[]).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded);
        let (_, bulk): (Request, Bytes) = decode_frame(buf).unwrap();
        assert!(bulk.is_empty());
    }
}
