use super::{encode, restore, EcAction, EcCtx, EcRequest, Error, Result};
use crate::config::EcConf;
use crate::fs::{Locality, MountpathInfo};
use crate::xaction::{Xact, XactBase, XactDemand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const KIND_PUT: &str = "ec-put";
pub const KIND_GET: &str = "ec-get";
pub const KIND_RESPOND: &str = "ec-respond";

const REQ_QUEUE: usize = 256;
const JOGGER_QUEUE: usize = 64;
const CTL_QUEUE: usize = 8;

/// control-channel messages; processed ahead of queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ctl {
    /// reject new requests and fail everything queued
    Clear,
    /// accept requests again
    Enable,
}

/// the Put and Get halves of a bucket's EC: a demand xaction owning one
/// jogger per mountpath. requests route to the jogger of the mountpath
/// holding the primary LOM.
pub struct XactEc {
    demand: Arc<XactDemand>,
    conf: EcConf,
    req_tx: mpsc::Sender<EcRequest>,
    ctl_tx: mpsc::Sender<Ctl>,
    stop: CancellationToken,
}

impl Xact for XactEc {
    fn base(&self) -> &XactBase {
        self.demand.base()
    }
}

impl XactEc {
    pub fn start(
        kind: &'static str,
        bucket: &str,
        local: Locality,
        conf: EcConf,
        ctx: Arc<EcCtx>,
    ) -> Arc<XactEc> {
        let demand = Arc::new(XactDemand::new(
            kind,
            Some((bucket.into(), local)),
            ctx.idle(),
        ));
        let (req_tx, req_rx) = mpsc::channel(REQ_QUEUE);
        let (ctl_tx, ctl_rx) = mpsc::channel(CTL_QUEUE);
        let stop = CancellationToken::new();

        let mut joggers = HashMap::new();
        for (path, mp) in ctx.mfs.get().available.iter() {
            let (tx, rx) = mpsc::channel(JOGGER_QUEUE);
            joggers.insert(path.clone(), tx);
            tokio::spawn(jogger(
                mp.clone(),
                rx,
                conf.clone(),
                demand.clone(),
                ctx.clone(),
                stop.clone(),
            ));
        }

        let xact = Arc::new(XactEc {
            demand,
            conf,
            req_tx,
            ctl_tx,
            stop,
        });
        tokio::spawn(run(xact.clone(), req_rx, ctl_rx, joggers));
        log::info!("{} started", xact.base());
        xact
    }

    pub fn conf(&self) -> &EcConf {
        &self.conf
    }

    /// enqueue one request; back-pressure applies when the queue is
    /// full.
    pub async fn dispatch(&self, req: EcRequest) -> Result<()> {
        if self.finished() {
            req.fail(Error::Aborted);
            return Err(Error::Aborted);
        }
        self.demand.renew();
        self.demand.inc_pending();
        if let Err(rejected) = self.req_tx.send(req).await {
            self.demand.dec_pending();
            rejected.0.fail(Error::Aborted);
            return Err(Error::Aborted);
        }
        Ok(())
    }

    /// reject new requests and fail everything already queued. the
    /// xaction loop keeps running so `enable_requests` can re-open it.
    pub async fn clear_requests(&self) {
        let _ = self.ctl_tx.send(Ctl::Clear).await;
    }

    pub async fn enable_requests(&self) {
        let _ = self.ctl_tx.send(Ctl::Enable).await;
    }

    pub fn pending(&self) -> i64 {
        self.demand.pending()
    }
}

impl Drop for XactEc {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run(
    xact: Arc<XactEc>,
    mut req_rx: mpsc::Receiver<EcRequest>,
    mut ctl_rx: mpsc::Receiver<Ctl>,
    joggers: HashMap<PathBuf, mpsc::Sender<EcRequest>>,
) {
    let abort = xact.chan_abort();
    let mut ticker = xact.demand.ticker();
    let bucket = xact.bucket().unwrap_or_default().to_string();
    let mut rejecting = false;

    loop {
        tokio::select! {
            biased;

            _ = abort.cancelled() => break,

            Some(ctl) = ctl_rx.recv() => match ctl {
                Ctl::Clear => {
                    rejecting = true;
                    while let Ok(req) = req_rx.try_recv() {
                        xact.demand.dec_pending();
                        req.fail(Error::Disabled(bucket.clone()));
                    }
                }
                Ctl::Enable => rejecting = false,
            },

            Some(mut req) = req_rx.recv() => {
                if rejecting {
                    xact.demand.dec_pending();
                    req.fail(Error::Disabled(bucket.clone()));
                    continue;
                }
                req.disp_at = Some(std::time::Instant::now());
                let owner = req.lom.mpath().path.clone();
                match joggers.get(&owner) {
                    Some(tx) => {
                        if let Err(rejected) = tx.send(req).await {
                            xact.demand.dec_pending();
                            rejected.0.fail(Error::Aborted);
                        }
                    }
                    None => {
                        xact.demand.dec_pending();
                        req.fail(Error::NoJogger(owner));
                    }
                }
            }

            _ = ticker.tick() => {
                if xact.demand.timeout() {
                    log::info!("{} idled out", xact.base());
                    break;
                }
            }
        }
    }

    // whatever is still queued fails; nothing new can complete
    req_rx.close();
    while let Ok(req) = req_rx.try_recv() {
        xact.demand.dec_pending();
        req.fail(Error::Aborted);
    }
    xact.base().finish();
    xact.stop.cancel();
    log::info!("{} stopped", xact.base());
}

/// per-mountpath worker: executes the requests whose primary LOM lives
/// on its mountpath.
async fn jogger(
    mp: Arc<MountpathInfo>,
    mut rx: mpsc::Receiver<EcRequest>,
    conf: EcConf,
    demand: Arc<XactDemand>,
    ctx: Arc<EcCtx>,
    stop: CancellationToken,
) {
    loop {
        let mut req = tokio::select! {
            _ = stop.cancelled() => return,
            req = rx.recv() => match req {
                Some(req) => req,
                None => return,
            },
        };

        let queued = req.disp_at.unwrap_or(req.enq_at).elapsed();
        log::debug!(
            "jogger[{}]: {:?} {} (queued {:?})",
            mp.path.display(),
            req.action,
            req.lom,
            queued
        );

        let out = match req.action {
            EcAction::SplitEncode => {
                encode::encode_object(&ctx, &conf, &req.lom, req.is_copy).await
            }
            EcAction::Restore => restore::restore_object(&ctx, &conf, &mut req.lom).await,
            EcAction::Delete => encode::cleanup_local(&req.lom).await,
        };
        demand.dec_pending();

        match out {
            Ok(()) => req.done(),
            Err(err) => {
                log::error!("jogger[{}]: {:#}", mp.path.display(), err);
                req.fail(err);
            }
        }
    }
}

/// the Respond xaction: answers peers' slice requests and stores the
/// slices peers push here. never stopped by cluster shrink; only a
/// bucket-level EC disable tears it down.
pub struct XactRespond {
    base: XactBase,
    work_tx: mpsc::Sender<super::respond::RespondWork>,
    stop: CancellationToken,
}

impl Xact for XactRespond {
    fn base(&self) -> &XactBase {
        &self.base
    }
}

impl XactRespond {
    pub fn start(bucket: &str, local: Locality, ctx: Arc<EcCtx>) -> Arc<XactRespond> {
        let base = XactBase::new(KIND_RESPOND, Some((bucket.into(), local)));
        let (work_tx, work_rx) = mpsc::channel(REQ_QUEUE);
        let stop = CancellationToken::new();

        let xact = Arc::new(XactRespond {
            base,
            work_tx,
            stop,
        });
        tokio::spawn(super::respond::run(xact.clone(), local, ctx, work_rx));
        log::info!("{} started", xact.base());
        xact
    }

    pub(super) async fn submit(&self, work: super::respond::RespondWork) {
        if self.work_tx.send(work).await.is_err() {
            log::warn!("{}: work dropped, xaction stopped", self.base());
        }
    }

    pub(super) fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

impl Drop for XactRespond {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
