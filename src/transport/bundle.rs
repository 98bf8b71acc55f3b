use super::{write_frame, write_hello, Error, Header, Result};
use crate::cluster::{SmapReceiver, TargetNode};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// per-peer queue depth before senders feel back-pressure.
const SEND_QUEUE: usize = 128;

/// completion callback: (header, body, error). fired exactly once per
/// destination; the body's last clone dropping releases its memory.
pub type SendCallback = Arc<dyn Fn(&Header, Option<&Bytes>, Option<&Error>) + Send + Sync>;

pub struct Msg {
    pub hdr: Header,
    pub body: Option<Bytes>,
    pub cb: Option<SendCallback>,
}

impl Msg {
    fn complete(self, err: Option<&Error>) {
        if let Some(cb) = &self.cb {
            cb(&self.hdr, self.body.as_ref(), err);
        }
    }
}

/// the dialing seam; tests swap in an in-process loopback.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        peer: &TargetNode,
        stream_name: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;
}

/// production connector: one TCP stream per (peer, lane), identified to
/// the remote demux by the stream name.
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        peer: &TargetNode,
        stream_name: &str,
    ) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let sock = TcpStream::connect(&peer.addr)
            .await
            .map_err(|err| Error::PeerUnreachable {
                peer: peer.daemon_id.clone(),
                reason: err.to_string(),
            })?;
        let mut out = BufWriter::new(sock);
        write_hello(&mut out, stream_name).await?;
        Ok(Box::new(out))
    }
}

struct PeerLanes {
    txs: Vec<mpsc::Sender<Msg>>,
    next: usize,
}

/// a fan-out of multiplexed connections to peer targets for one logical
/// stream. destinations are daemon-ids resolved through the current
/// cluster map; each destination gets `multiplier` lanes, each owned by
/// one sender task.
pub struct Bundle {
    name: String,
    smap: SmapReceiver,
    connector: Arc<dyn Connector>,
    multiplier: usize,
    peers: Mutex<HashMap<String, PeerLanes>>,
    shutdown: CancellationToken,
}

impl Bundle {
    pub fn new(
        name: &str,
        smap: SmapReceiver,
        connector: Arc<dyn Connector>,
        multiplier: usize,
    ) -> Bundle {
        Bundle {
            name: name.into(),
            smap,
            connector,
            multiplier: multiplier.max(1),
            peers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// queue one message to every destination. an unresolvable peer
    /// completes the callback with `UnknownPeer` without affecting the
    /// other destinations.
    pub async fn send(&self, msg: Msg, to: &[String]) -> Result<()> {
        if self.shutdown.is_cancelled() {
            msg.complete(Some(&Error::Shutdown));
            return Err(Error::Shutdown);
        }

        for daemon_id in to {
            let clone = Msg {
                hdr: msg.hdr.clone(),
                body: msg.body.clone(),
                cb: msg.cb.clone(),
            };

            let node = self.smap.borrow().get(daemon_id).cloned();
            let node = match node {
                Some(node) => node,
                None => {
                    clone.complete(Some(&Error::UnknownPeer(daemon_id.clone())));
                    continue;
                }
            };

            let tx = self.lane(&node);
            if let Err(rejected) = tx.send(clone).await {
                // sender task is gone; treat like an unreachable peer
                let err = Error::PeerUnreachable {
                    peer: daemon_id.clone(),
                    reason: "send lane closed".into(),
                };
                rejected.0.complete(Some(&err));
            }
        }
        Ok(())
    }

    /// round-robin lane to a peer, spawning the lane tasks on first use.
    fn lane(&self, node: &TargetNode) -> mpsc::Sender<Msg> {
        let mut peers = self.peers.lock().unwrap();
        let lanes = peers.entry(node.daemon_id.clone()).or_insert_with(|| {
            let txs = (0..self.multiplier)
                .map(|_| {
                    let (tx, rx) = mpsc::channel(SEND_QUEUE);
                    tokio::spawn(lane_sender(
                        self.name.clone(),
                        node.clone(),
                        self.connector.clone(),
                        rx,
                        self.shutdown.clone(),
                    ));
                    tx
                })
                .collect();
            PeerLanes { txs, next: 0 }
        });
        let tx = lanes.txs[lanes.next % lanes.txs.len()].clone();
        lanes.next = lanes.next.wrapping_add(1);
        tx
    }

    /// stop all lanes; queued messages complete with `Shutdown`.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.peers.lock().unwrap().clear();
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn lane_sender(
    stream_name: String,
    node: TargetNode,
    connector: Arc<dyn Connector>,
    mut rx: mpsc::Receiver<Msg>,
    shutdown: CancellationToken,
) {
    let mut conn: Option<Box<dyn AsyncWrite + Send + Unpin>> = None;

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        if conn.is_none() {
            match connector.connect(&node, &stream_name).await {
                Ok(c) => conn = Some(c),
                Err(err) => {
                    log::warn!(
                        "stream '{}': cannot reach {}: {:#}",
                        stream_name,
                        node.daemon_id,
                        err
                    );
                    msg.complete(Some(&err));
                    continue;
                }
            }
        }
        let w = match conn.as_mut() {
            Some(w) => w,
            None => continue,
        };
        match write_frame(w, &msg.hdr, msg.body.as_ref()).await {
            Ok(()) => msg.complete(None),
            Err(err) => {
                // drop the connection; the next message redials
                conn = None;
                log::warn!(
                    "stream '{}': send to {} failed: {:#}",
                    stream_name,
                    node.daemon_id,
                    err
                );
                msg.complete(Some(&err));
            }
        }
    }

    // drain whatever is still queued
    while let Ok(msg) = rx.try_recv() {
        msg.complete(Some(&Error::Shutdown));
    }
}
