use crate::bmd::BucketProps;
use crate::cluster::SmapReceiver;
use crate::config::{EcConf, TimeoutConf};
use crate::fs::{Locality, MountedFs};
use crate::lom::{self, Lom};
use crate::transport::{
    self, Bundle, Connector, Demux, Header, RecvHandler, SliceWriters,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod encode;
pub mod respond;
pub mod restore;
pub mod xaction;

pub use xaction::{XactEc, XactRespond};

/// stream names the EC engine registers with the receive demux.
pub const STREAM_REQ: &str = "ec-req";
pub const STREAM_RESP: &str = "ec-resp";

/// connections per peer and stream.
const BUNDLE_MULTIPLIER: usize = 4;

/// extended attribute carrying the slice metadata of locally stored
/// slices and encoded primaries.
pub const XATTR_EC: &str = "user.tos.ec";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("EC disabled on bucket '{0}'")]
    Disabled(String),

    #[error("insufficient targets: need {need}, have {have}")]
    InsufficientTargets { need: usize, have: usize },

    #[error("not enough slices to restore '{0}'")]
    NotEnoughSlices(String),

    #[error("timed out waiting for '{0}'")]
    Timeout(String),

    #[error("no jogger for mountpath {0:?}")]
    NoJogger(std::path::PathBuf),

    #[error("no available mountpaths")]
    NoMountpaths,

    #[error("xaction aborted")]
    Aborted,

    #[error("erasure codec error: {0}")]
    Codec(String),

    #[error("corrupted slice metadata: {0}")]
    CorruptedSliceMeta(String),

    #[error("lom error: {0}")]
    Lom(#[from] lom::Error),

    #[error("transport error: {0}")]
    Transport(#[from] transport::Error),

    #[error("io error: {0:#}")]
    IO(#[from] std::io::Error),
}

impl From<reed_solomon_erasure::Error> for Error {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

/// what a local caller asks of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcAction {
    SplitEncode,
    Delete,
    Restore,
}

/// one queued request. the error-reply channel is optional: fire-and-
/// forget callers rely on logs and counters instead.
pub struct EcRequest {
    pub action: EcAction,
    pub lom: Lom,
    /// small object: replicate instead of split
    pub is_copy: bool,
    pub err_tx: Option<oneshot::Sender<Result<()>>>,
    pub enq_at: std::time::Instant,
    pub disp_at: Option<std::time::Instant>,
}

impl EcRequest {
    pub fn new(action: EcAction, lom: Lom, is_copy: bool) -> (EcRequest, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            EcRequest {
                action,
                lom,
                is_copy,
                err_tx: Some(tx),
                enq_at: std::time::Instant::now(),
                disp_at: None,
            },
            rx,
        )
    }

    pub fn fail(self, err: Error) {
        if let Some(tx) = self.err_tx {
            let _ = tx.send(Err(err));
        }
    }

    pub fn done(self) {
        if let Some(tx) = self.err_tx {
            let _ = tx.send(Ok(()));
        }
    }
}

/// action tag of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireAction {
    /// store the attached slice or replica
    StoreSlice,
    /// return your slice/replica of the named object
    GetSlice,
    /// answer to GetSlice
    SliceResp,
    /// drop your slice of the named object
    Cleanup,
}

/// per-slice metadata; rides in descriptors and persists beside stored
/// slices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceMeta {
    pub obj_size: u64,
    pub data_slices: usize,
    pub parity_slices: usize,
    /// 0 for a full replica, 1..=data+parity for a slice
    pub slice_id: usize,
    pub obj_version: String,
    /// checksum of the whole object, restored into the rebuilt LOM
    pub obj_cksum: Option<crate::hash::Cksum>,
    /// checksum of this message's payload
    pub slice_cksum: Option<crate::hash::Cksum>,
}

/// the opaque request descriptor carried in every intra-target header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub action: WireAction,
    pub sender: String,
    pub meta: Option<SliceMeta>,
    pub exists: bool,
    pub is_slice: bool,
}

impl Descriptor {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self).map_err(transport::Error::from)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Descriptor> {
        Ok(rmp_serde::from_slice(buf).map_err(transport::Error::from)?)
    }
}

/// everything a jogger needs to reach the rest of the target.
pub struct EcCtx {
    pub daemon_id: String,
    pub mfs: Arc<MountedFs>,
    pub smap: SmapReceiver,
    pub req_bundle: Bundle,
    pub resp_bundle: Bundle,
    pub writers: Arc<SliceWriters>,
    pub send_file: Duration,
}

impl EcCtx {
    /// idle period of the demand xactions: three send-file timeouts.
    pub fn idle(&self) -> Duration {
        self.send_file * 3
    }
}

struct BucketEc {
    local: Locality,
    conf: EcConf,
    put: Arc<XactEc>,
    get: Arc<XactEc>,
    respond: Arc<XactRespond>,
}

/// the per-target EC engine: per-bucket xaction triples, entry points,
/// and the receive-side wiring. created lazily by the coordinator the
/// first time any bucket enables EC.
pub struct Manager {
    ctx: Arc<EcCtx>,
    buckets: Mutex<HashMap<String, BucketEc>>,
}

impl Manager {
    pub fn new(
        daemon_id: &str,
        mfs: Arc<MountedFs>,
        smap: SmapReceiver,
        connector: Arc<dyn Connector>,
        timeout: &TimeoutConf,
        demux: &Demux,
    ) -> Result<Arc<Manager>> {
        let ctx = Arc::new(EcCtx {
            daemon_id: daemon_id.into(),
            mfs,
            smap: smap.clone(),
            req_bundle: Bundle::new(STREAM_REQ, smap.clone(), connector.clone(), 1),
            resp_bundle: Bundle::new(STREAM_RESP, smap, connector, BUNDLE_MULTIPLIER),
            writers: Arc::new(SliceWriters::new()),
            send_file: timeout.send_file,
        });

        let mgr = Arc::new(Manager {
            ctx,
            buckets: Mutex::new(HashMap::new()),
        });

        demux.register(STREAM_REQ, Arc::new(ReqHandler { mgr: mgr.clone() }))?;
        demux.register(STREAM_RESP, Arc::new(RespHandler { mgr: mgr.clone() }))?;
        Ok(mgr)
    }

    pub fn ctx(&self) -> &Arc<EcCtx> {
        &self.ctx
    }

    fn target_count(&self) -> usize {
        self.ctx.smap.borrow().count_targets()
    }

    /// bring a bucket's xaction triple up (or re-open its gates).
    pub async fn enable_bucket(&self, bucket: &str, props: &BucketProps) {
        let existing = {
            let buckets = self.buckets.lock().unwrap();
            buckets.get(bucket).map(|entry| (entry.put.clone(), entry.get.clone()))
        };
        if let Some((put, get)) = existing {
            put.enable_requests().await;
            get.enable_requests().await;
            return;
        }
        let mut buckets = self.buckets.lock().unwrap();
        buckets.insert(
            bucket.into(),
            BucketEc {
                local: props.local,
                conf: props.ec.clone(),
                put: XactEc::start(
                    xaction::KIND_PUT,
                    bucket,
                    props.local,
                    props.ec.clone(),
                    self.ctx.clone(),
                ),
                get: XactEc::start(
                    xaction::KIND_GET,
                    bucket,
                    props.local,
                    props.ec.clone(),
                    self.ctx.clone(),
                ),
                respond: XactRespond::start(bucket, props.local, self.ctx.clone()),
            },
        );
        log::info!("EC enabled on bucket '{}'", bucket);
    }

    /// tear a bucket's triple down: drain queued requests, then abort.
    pub async fn disable_bucket(&self, bucket: &str) {
        let entry = self.buckets.lock().unwrap().remove(bucket);
        let entry = match entry {
            Some(entry) => entry,
            None => return,
        };
        entry.put.clear_requests().await;
        entry.get.clear_requests().await;
        use crate::xaction::Xact;
        entry.put.abort();
        entry.get.abort();
        entry.respond.abort();
        log::info!("EC disabled on bucket '{}'", bucket);
    }

    /// cluster-map change: stop what the new size cannot support.
    /// Respond xactions keep answering peers regardless.
    pub fn on_smap_change(&self) {
        use crate::xaction::Xact;
        let have = self.target_count();
        let buckets = self.buckets.lock().unwrap();
        for (name, entry) in buckets.iter() {
            if have < entry.conf.required_encode_targets() && !entry.put.finished() {
                log::warn!(
                    "bucket '{}': {} targets cannot support encode, stopping {}",
                    name,
                    have,
                    entry.put.base()
                );
                entry.put.abort();
            }
            if have < entry.conf.required_restore_targets() && !entry.get.finished() {
                log::warn!(
                    "bucket '{}': {} targets cannot support restore, stopping {}",
                    name,
                    have,
                    entry.get.base()
                );
                entry.get.abort();
            }
        }
    }

    /// submit a split-encode (or replicate, for small objects).
    pub async fn encode(&self, lom: Lom) -> Result<oneshot::Receiver<Result<()>>> {
        let bucket = lom.bucket().to_string();
        let (conf, put) = {
            let buckets = self.buckets.lock().unwrap();
            let entry = buckets
                .get(&bucket)
                .ok_or_else(|| Error::Disabled(bucket.clone()))?;
            (entry.conf.clone(), entry.put.clone())
        };

        let need = conf.required_encode_targets();
        let have = self.target_count();
        if have < need {
            return Err(Error::InsufficientTargets { need, have });
        }

        let put = self.renew_if_finished(&bucket, put, xaction::KIND_PUT);
        let is_copy = lom.size <= conf.obj_size_limit;
        let (req, rx) = EcRequest::new(EcAction::SplitEncode, lom, is_copy);
        put.dispatch(req).await?;
        Ok(rx)
    }

    /// submit a restore of a lost object.
    pub async fn restore(&self, lom: Lom) -> Result<oneshot::Receiver<Result<()>>> {
        let bucket = lom.bucket().to_string();
        let (conf, get) = {
            let buckets = self.buckets.lock().unwrap();
            let entry = buckets
                .get(&bucket)
                .ok_or_else(|| Error::Disabled(bucket.clone()))?;
            (entry.conf.clone(), entry.get.clone())
        };

        let need = conf.required_restore_targets();
        let have = self.target_count();
        if have < need {
            return Err(Error::InsufficientTargets { need, have });
        }

        let get = self.renew_if_finished(&bucket, get, xaction::KIND_GET);
        let (req, rx) = EcRequest::new(EcAction::Restore, lom, false);
        get.dispatch(req).await?;
        Ok(rx)
    }

    /// drop every remote slice of a deleted object.
    pub async fn cleanup(&self, lom: &Lom) -> Result<()> {
        let bucket = lom.bucket().to_string();
        if !self.buckets.lock().unwrap().contains_key(&bucket) {
            return Err(Error::Disabled(bucket));
        }

        let desc = Descriptor {
            action: WireAction::Cleanup,
            sender: self.ctx.daemon_id.clone(),
            meta: None,
            exists: false,
            is_slice: false,
        };
        let peers: Vec<String> = self
            .ctx
            .smap
            .borrow()
            .hrw_targets(&lom.uname(), &self.ctx.daemon_id)
            .iter()
            .map(|t| t.daemon_id.clone())
            .collect();
        self.ctx
            .req_bundle
            .send(
                transport::Msg {
                    hdr: Header {
                        bucket: lom.bucket().into(),
                        objname: lom.objname().into(),
                        attrs: Default::default(),
                        opaque: desc.to_bytes()?,
                    },
                    body: None,
                    cb: None,
                },
                &peers,
            )
            .await?;
        Ok(())
    }

    /// a demand xaction that idled out is restarted on the next request.
    fn renew_if_finished(&self, bucket: &str, xact: Arc<XactEc>, kind: &'static str) -> Arc<XactEc> {
        use crate::xaction::Xact;
        if !xact.finished() {
            return xact;
        }
        let mut buckets = self.buckets.lock().unwrap();
        let entry = match buckets.get_mut(bucket) {
            Some(entry) => entry,
            None => return xact,
        };
        let fresh = XactEc::start(kind, bucket, entry.local, entry.conf.clone(), self.ctx.clone());
        if kind == xaction::KIND_PUT {
            entry.put = fresh.clone();
        } else {
            entry.get = fresh.clone();
        }
        log::info!("renewed {} for bucket '{}'", fresh.base(), bucket);
        fresh
    }

    fn respond_for(&self, bucket: &str) -> Option<Arc<XactRespond>> {
        self.buckets
            .lock()
            .unwrap()
            .get(bucket)
            .map(|e| e.respond.clone())
    }
}

/// "ec-req" stream: slice requests and cleanups from peers.
struct ReqHandler {
    mgr: Arc<Manager>,
}

#[async_trait::async_trait]
impl RecvHandler for ReqHandler {
    async fn recv(&self, hdr: Header, _body: Bytes) -> anyhow::Result<()> {
        let desc = Descriptor::from_bytes(&hdr.opaque)?;
        let respond = match self.mgr.respond_for(&hdr.bucket) {
            Some(respond) => respond,
            None => {
                log::debug!("EC request for unmanaged bucket '{}' ignored", hdr.bucket);
                return Ok(());
            }
        };
        respond.submit(respond::RespondWork::Request { hdr, desc }).await;
        Ok(())
    }
}

/// "ec-resp" stream: bulk data, both slices to store and answers to
/// our own restore queries.
struct RespHandler {
    mgr: Arc<Manager>,
}

#[async_trait::async_trait]
impl RecvHandler for RespHandler {
    async fn recv(&self, hdr: Header, body: Bytes) -> anyhow::Result<()> {
        let desc = Descriptor::from_bytes(&hdr.opaque)?;
        match desc.action {
            WireAction::StoreSlice => {
                let respond = match self.mgr.respond_for(&hdr.bucket) {
                    Some(respond) => respond,
                    None => {
                        log::debug!("slice for unmanaged bucket '{}' dropped", hdr.bucket);
                        return Ok(());
                    }
                };
                respond
                    .submit(respond::RespondWork::Store { hdr, desc, body })
                    .await;
            }
            WireAction::SliceResp => {
                let uname = transport::wire_uname(&desc.sender, &hdr.bucket, &hdr.objname);
                let delivered = self.mgr.ctx.writers.writer_receive(
                    &uname,
                    transport::SliceResp {
                        hdr,
                        body,
                        exists: desc.exists,
                    },
                );
                if !delivered {
                    // late answer: waiter already timed out; body was
                    // drained by the demux, nothing else to do
                    log::debug!("late slice response for '{}' dropped", uname);
                }
            }
            other => log::warn!("unexpected action {:?} on '{}'", other, STREAM_RESP),
        }
        Ok(())
    }
}
