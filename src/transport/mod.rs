use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod bundle;
pub mod receive;

pub use bundle::{Bundle, Connector, Msg, SendCallback, TcpConnector};
pub use receive::{Demux, RecvHandler, SliceResp, SliceWriters};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown peer '{0}'")]
    UnknownPeer(String),

    #[error("stream '{0}' already registered")]
    StreamRegistered(String),

    #[error("writer '{0}' already registered")]
    WriterRegistered(String),

    #[error("failed to reach peer '{peer}': {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("oversized header ({0} bytes)")]
    HeaderTooBig(usize),

    #[error("bundle is shut down")]
    Shutdown,

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("io error: {0:#}")]
    IO(#[from] std::io::Error),
}

/// object attributes riding in every data-plane header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjAttrs {
    pub size: u64,
    pub version: String,
    pub atime_ns: i64,
    pub cksum_type: String,
    pub cksum_value: String,
}

/// per-message header: bucket, object, attributes, and an opaque
/// request descriptor the receiving subsystem understands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Header {
    pub bucket: String,
    pub objname: String,
    pub attrs: ObjAttrs,
    #[serde(with = "serde_bytes")]
    pub opaque: Vec<u8>,
}

impl Header {
    pub fn uname(&self) -> String {
        format!("{}/{}", self.bucket, self.objname)
    }
}

/// registry key of a pending writer: the responding daemon plus the
/// object identity.
pub fn wire_uname(daemon_id: &str, bucket: &str, objname: &str) -> String {
    format!("{}/{}/{}", daemon_id, bucket, objname)
}

const MAX_HEADER: usize = 1 << 20;

// Wire format, per stream:
//   hello:   u16-le(len) name
//   message: u32-le(len) msgpack(Header)  u64-le(len) body
// Headers are small; bodies can be a whole slice.

pub(crate) async fn write_hello<W: AsyncWrite + Unpin>(w: &mut W, name: &str) -> Result<()> {
    w.write_all(&(name.len() as u16).to_le_bytes()).await?;
    w.write_all(name.as_bytes()).await?;
    Ok(())
}

pub(crate) async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let mut len = [0u8; 2];
    r.read_exact(&mut len).await?;
    let mut name = vec![0u8; u16::from_le_bytes(len) as usize];
    r.read_exact(&mut name).await?;
    String::from_utf8(name)
        .map_err(|_| Error::IO(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad stream name")))
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    hdr: &Header,
    body: Option<&Bytes>,
) -> Result<()> {
    let hdr_buf = rmp_serde::to_vec(hdr)?;
    if hdr_buf.len() > MAX_HEADER {
        return Err(Error::HeaderTooBig(hdr_buf.len()));
    }
    w.write_all(&(hdr_buf.len() as u32).to_le_bytes()).await?;
    w.write_all(&hdr_buf).await?;

    let body_len = body.map(|b| b.len() as u64).unwrap_or(0);
    w.write_all(&body_len.to_le_bytes()).await?;
    if let Some(body) = body {
        w.write_all(body).await?;
    }
    w.flush().await?;
    Ok(())
}

/// read one message; Ok(None) on a clean end of stream. the body is
/// always drained fully, even if the caller later drops it.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(Header, Bytes)>> {
    let mut len = [0u8; 4];
    match r.read_exact(&mut len).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let hdr_len = u32::from_le_bytes(len) as usize;
    if hdr_len > MAX_HEADER {
        return Err(Error::HeaderTooBig(hdr_len));
    }
    let mut hdr_buf = vec![0u8; hdr_len];
    r.read_exact(&mut hdr_buf).await?;
    let hdr: Header = rmp_serde::from_slice(&hdr_buf)?;

    let mut len = [0u8; 8];
    r.read_exact(&mut len).await?;
    let mut body = vec![0u8; u64::from_le_bytes(len) as usize];
    r.read_exact(&mut body).await?;

    Ok(Some((hdr, Bytes::from(body))))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let hdr = Header {
            bucket: "B".into(),
            objname: "a/b.bin".into(),
            attrs: ObjAttrs {
                size: 11,
                version: "3".into(),
                atime_ns: 42,
                cksum_type: "xxhash".into(),
                cksum_value: "00ff".into(),
            },
            opaque: vec![1, 2, 3],
        };
        let body = Bytes::from_static(b"hello world");

        let mut buf = Vec::new();
        write_frame(&mut buf, &hdr, Some(&body)).await.unwrap();
        write_frame(&mut buf, &hdr, None).await.unwrap();

        let mut r = buf.as_slice();
        let (h1, b1) = read_frame(&mut r).await.unwrap().unwrap();
        assert_eq!(h1.bucket, "B");
        assert_eq!(h1.attrs, hdr.attrs);
        assert_eq!(b1, body);

        let (_, b2) = read_frame(&mut r).await.unwrap().unwrap();
        assert!(b2.is_empty());

        assert!(read_frame(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hello_roundtrip() {
        let mut buf = Vec::new();
        write_hello(&mut buf, "ec-req").await.unwrap();
        let name = read_hello(&mut buf.as_slice()).await.unwrap();
        assert_eq!(name, "ec-req");
    }

    #[test]
    fn uname_format() {
        assert_eq!(wire_uname("t1", "B", "a/b"), "t1/B/a/b");
    }
}
