use super::{read_frame, read_hello, Error, Header, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// receive-side handler for one stream name. the demux drains every
/// body before dispatching, so a handler never has to worry about
/// poisoning the connection.
#[async_trait::async_trait]
pub trait RecvHandler: Send + Sync {
    async fn recv(&self, hdr: Header, body: Bytes) -> anyhow::Result<()>;
}

/// routes inbound connections to handlers by stream name ("ec-req",
/// "ec-resp", ...).
pub struct Demux {
    handlers: RwLock<HashMap<String, Arc<dyn RecvHandler>>>,
}

impl Default for Demux {
    fn default() -> Self {
        Self::new()
    }
}

impl Demux {
    pub fn new() -> Demux {
        Demux {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, stream: &str, handler: Arc<dyn RecvHandler>) -> Result<()> {
        let mut handlers = self.handlers.write().unwrap();
        if handlers.contains_key(stream) {
            return Err(Error::StreamRegistered(stream.into()));
        }
        handlers.insert(stream.into(), handler);
        Ok(())
    }

    pub fn unregister(&self, stream: &str) {
        self.handlers.write().unwrap().remove(stream);
    }

    /// accept loop over the target's data port.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let conn = tokio::select! {
                _ = shutdown.cancelled() => return,
                conn = listener.accept() => conn,
            };
            match conn {
                Ok((sock, peer)) => {
                    let demux = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = demux.serve_conn(sock).await {
                            log::warn!("connection from {} failed: {:#}", peer, err);
                        }
                    });
                }
                Err(err) => log::warn!("accept failed: {:#}", err),
            }
        }
    }

    /// one inbound connection: hello names the stream, then messages.
    pub async fn serve_conn<R: AsyncRead + Unpin>(&self, mut conn: R) -> Result<()> {
        let stream = read_hello(&mut conn).await?;
        self.serve_stream(&stream, conn).await
    }

    /// message loop for an identified stream. a handler error is logged
    /// and counted against that message only; the body was already
    /// drained, so the loop continues.
    pub async fn serve_stream<R: AsyncRead + Unpin>(&self, stream: &str, mut conn: R) -> Result<()> {
        loop {
            let (hdr, body) = match read_frame(&mut conn).await? {
                Some(frame) => frame,
                None => return Ok(()),
            };
            let handler = self.handlers.read().unwrap().get(stream).cloned();
            match handler {
                Some(handler) => {
                    if let Err(err) = handler.recv(hdr, body).await {
                        log::warn!("stream '{}': handler error: {:#}", stream, err);
                    }
                }
                None => {
                    log::warn!("stream '{}': no handler, message dropped", stream);
                }
            }
        }
    }
}

/// one delivered slice (or a negative answer).
#[derive(Debug)]
pub struct SliceResp {
    pub hdr: Header,
    pub body: Bytes,
    pub exists: bool,
}

struct PendingWriter {
    tx: oneshot::Sender<SliceResp>,
}

/// process-wide registry of waiters for inbound slices during EC
/// restore, keyed by (daemon-id, bucket, object). a response arriving
/// after its waiter unregistered has nowhere to deliver and is dropped;
/// the body was drained by the demux either way.
pub struct SliceWriters {
    writers: Mutex<HashMap<String, PendingWriter>>,
}

impl Default for SliceWriters {
    fn default() -> Self {
        Self::new()
    }
}

impl SliceWriters {
    pub fn new() -> SliceWriters {
        SliceWriters {
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// register a waiter; fails if the key is already taken.
    pub fn reg_writer(&self, uname: &str) -> Result<oneshot::Receiver<SliceResp>> {
        let mut writers = self.writers.lock().unwrap();
        if writers.contains_key(uname) {
            return Err(Error::WriterRegistered(uname.into()));
        }
        let (tx, rx) = oneshot::channel();
        writers.insert(uname.into(), PendingWriter { tx });
        Ok(rx)
    }

    pub fn unreg_writer(&self, uname: &str) -> bool {
        self.writers.lock().unwrap().remove(uname).is_some()
    }

    /// hand a delivered response to its waiter. returns false for a
    /// late or unexpected response.
    pub fn writer_receive(&self, uname: &str, resp: SliceResp) -> bool {
        let writer = self.writers.lock().unwrap().remove(uname);
        match writer {
            Some(w) => w.tx.send(resp).is_ok(),
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.writers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::{write_frame, write_hello, ObjAttrs};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter(AtomicUsize);

    #[async_trait::async_trait]
    impl RecvHandler for Counter {
        async fn recv(&self, _hdr: Header, _body: Bytes) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn register_is_exclusive() {
        let demux = Demux::new();
        demux
            .register("ec-req", Arc::new(Counter(AtomicUsize::new(0))))
            .unwrap();
        let dup = demux.register("ec-req", Arc::new(Counter(AtomicUsize::new(0))));
        assert!(matches!(dup, Err(Error::StreamRegistered(_))));

        demux.unregister("ec-req");
        demux
            .register("ec-req", Arc::new(Counter(AtomicUsize::new(0))))
            .unwrap();
    }

    #[tokio::test]
    async fn serve_conn_dispatches() {
        let demux = Arc::new(Demux::new());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        demux.register("data", counter.clone()).unwrap();

        let mut wire = Vec::new();
        write_hello(&mut wire, "data").await.unwrap();
        let hdr = Header {
            bucket: "B".into(),
            objname: "o".into(),
            attrs: ObjAttrs::default(),
            opaque: vec![],
        };
        write_frame(&mut wire, &hdr, Some(&Bytes::from_static(b"one")))
            .await
            .unwrap();
        write_frame(&mut wire, &hdr, None).await.unwrap();

        demux.serve_conn(wire.as_slice()).await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unhandled_stream_is_drained() {
        let demux = Arc::new(Demux::new());

        let mut wire = Vec::new();
        write_hello(&mut wire, "nobody-home").await.unwrap();
        write_frame(&mut wire, &Header::default(), Some(&Bytes::from_static(b"x")))
            .await
            .unwrap();

        // no handler: messages are dropped, the stream still parses
        demux.serve_conn(wire.as_slice()).await.unwrap();
    }

    #[tokio::test]
    async fn slice_writers_lifecycle() {
        let writers = SliceWriters::new();
        let rx = writers.reg_writer("t1/B/o").unwrap();

        let dup = writers.reg_writer("t1/B/o");
        assert!(matches!(dup, Err(Error::WriterRegistered(_))));

        let delivered = writers.writer_receive(
            "t1/B/o",
            SliceResp {
                hdr: Header::default(),
                body: Bytes::from_static(b"slice"),
                exists: true,
            },
        );
        assert!(delivered);
        assert_eq!(writers.pending(), 0);

        let resp = rx.await.unwrap();
        assert!(resp.exists);
        assert_eq!(&resp.body[..], b"slice");
    }

    #[tokio::test]
    async fn late_response_dropped() {
        let writers = SliceWriters::new();
        let rx = writers.reg_writer("t2/B/o").unwrap();
        assert!(writers.unreg_writer("t2/B/o"));
        drop(rx);

        let delivered = writers.writer_receive(
            "t2/B/o",
            SliceResp {
                hdr: Header::default(),
                body: Bytes::new(),
                exists: false,
            },
        );
        assert!(!delivered);
    }

    #[tokio::test]
    async fn waiter_timeout() {
        let writers = SliceWriters::new();
        let rx = writers.reg_writer("t3/B/o").unwrap();

        let out = tokio::time::timeout(Duration::from_millis(20), rx).await;
        assert!(out.is_err());
        assert!(writers.unreg_writer("t3/B/o"));
    }
}
