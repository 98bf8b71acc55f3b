use crate::config::MirrorConf;
use crate::disk::IostatContext;
use crate::fs::content::WORK_COPY;
use crate::fs::{Locality, MountpathInfo};
use crate::lom::{self, Lom};
use crate::xaction::{Xact, XactBase, XactDemand, DEFAULT_IDLE};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("mirroring requires copies=2, got {0}")]
    BadCopies(u32),

    #[error("mirror xaction is not running")]
    NotRunning,

    #[error("lom error: {0}")]
    Lom(#[from] lom::Error),

    #[error("io error: {0:#}")]
    IO(#[from] std::io::Error),
}

// sentinel above any reachable disk utilization
const UTIL_SENTINEL: i64 = 101;

const KIND_MIRROR: &str = "mirror";

struct CopyReq {
    lom: Lom,
    dst: Arc<MountpathInfo>,
}

/// n-way local replication for one bucket: a demand xaction with one
/// worker per mountpath plus the dispatching entry point. a PUT
/// completion hands the primary LOM to `copy`; the engine picks the
/// least-utilized peer mountpath and replicates there.
pub struct XactCopy {
    demand: Arc<XactDemand>,
    conf: MirrorConf,
    iostat: Arc<IostatContext>,
    mpaths: Vec<Arc<MountpathInfo>>,
    workers: HashMap<PathBuf, mpsc::Sender<CopyReq>>,
    stop: CancellationToken,
}

impl Xact for XactCopy {
    fn base(&self) -> &XactBase {
        self.demand.base()
    }
}

impl XactCopy {
    /// spawn the workers and the idle monitor. `mpaths` is the mountpath
    /// snapshot this xaction serves; the coordinator restarts the
    /// xaction when the set changes.
    pub fn start(
        bucket: &str,
        local: Locality,
        conf: MirrorConf,
        mpaths: Vec<Arc<MountpathInfo>>,
        iostat: Arc<IostatContext>,
    ) -> Result<Arc<XactCopy>> {
        if conf.copies != 2 {
            return Err(Error::BadCopies(conf.copies));
        }

        let demand = Arc::new(XactDemand::new(
            KIND_MIRROR,
            Some((bucket.into(), local)),
            DEFAULT_IDLE,
        ));
        let stop = CancellationToken::new();

        let mut workers = HashMap::new();
        for mp in &mpaths {
            let (tx, rx) = mpsc::channel(conf.burst_buffer.max(1));
            workers.insert(mp.path.clone(), tx);
            tokio::spawn(worker(rx, demand.clone(), stop.clone()));
        }

        let xact = Arc::new(XactCopy {
            demand,
            conf,
            iostat,
            mpaths,
            workers,
            stop,
        });

        tokio::spawn(monitor(xact.clone()));
        log::info!("{} started", xact.base());
        Ok(xact)
    }

    /// schedule one replication. no eligible destination is not an
    /// error: the object simply stays single-copy for this PUT.
    pub fn copy(&self, lom: Lom) -> Result<()> {
        if self.finished() {
            return Err(Error::NotRunning);
        }
        self.demand.renew();

        let dst = match self.find_least_utilized(&lom) {
            Some(dst) => dst,
            None => {
                log::debug!("{}: no eligible mountpath for a copy of {}", self.base(), lom);
                return Ok(());
            }
        };

        let tx = self
            .workers
            .get(&dst.path)
            .cloned()
            .ok_or(Error::NotRunning)?;
        self.demand.inc_pending();
        if let Err(err) = tx.try_send(CopyReq { lom, dst }) {
            // burst buffer full (or worker gone): drop the copy, the
            // object stays readable from its primary
            self.demand.dec_pending();
            log::warn!("{}: copy dropped: {}", self.base(), err);
        }
        Ok(())
    }

    /// destination selection: skip the primary's mountpath and any
    /// mountpath already holding a copy; of the survivors take the one
    /// with the lowest current utilization.
    fn find_least_utilized(&self, lom: &Lom) -> Option<Arc<MountpathInfo>> {
        let mut best: Option<Arc<MountpathInfo>> = None;
        let mut best_util = UTIL_SENTINEL;
        for mp in &self.mpaths {
            if mp.path == lom.mpath().path {
                continue;
            }
            if lom.has_copies() && lom.is_copy_on(mp) {
                continue;
            }
            let util = self.iostat.utilization(&mp.path);
            if util < best_util {
                best_util = util;
                best = Some(mp.clone());
            }
        }
        best
    }

    pub fn pending(&self) -> i64 {
        self.demand.pending()
    }

    pub fn util_thresh(&self) -> i64 {
        self.conf.util_thresh
    }
}

async fn monitor(xact: Arc<XactCopy>) {
    let abort = xact.chan_abort();
    let mut ticker = xact.demand.ticker();
    loop {
        tokio::select! {
            _ = abort.cancelled() => break,
            _ = ticker.tick() => {
                if xact.demand.timeout() {
                    break;
                }
            }
        }
    }
    xact.base().finish();
    xact.stop.cancel();
    log::info!("{} stopped", xact.base());
}

async fn worker(
    mut rx: mpsc::Receiver<CopyReq>,
    demand: Arc<XactDemand>,
    stop: CancellationToken,
) {
    loop {
        let req = tokio::select! {
            _ = stop.cancelled() => return,
            req = rx.recv() => match req {
                Some(req) => req,
                None => return,
            },
        };

        let primary = req.lom.fqn.clone();
        if let Err(err) = copy_one(req).await {
            log::error!("failed to mirror '{}': {:#}", primary.display(), err);
        }
        demand.dec_pending();
    }
}

/// the copy protocol: stream into a workfile on the destination, rename
/// into place, then persist both sides of the copy relationship.
async fn copy_one(req: CopyReq) -> Result<()> {
    let CopyReq { mut lom, dst } = req;

    let work_fqn = dst.work_fqn(lom.local(), lom.bucket(), lom.objname(), WORK_COPY);
    let copy_fqn = dst.obj_fqn(lom.local(), lom.bucket(), lom.objname());

    if let Some(parent) = work_fqn.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // fixed-size buffered copy of the primary's bytes
    let src = tokio::fs::File::open(&lom.fqn).await?;
    let dst_file = tokio::fs::File::create(&work_fqn).await?;
    let mut reader = BufReader::with_capacity(128 * 1024, src);
    let mut writer = BufWriter::with_capacity(128 * 1024, dst_file);
    if let Err(err) = tokio::io::copy(&mut reader, &mut writer).await {
        let _ = tokio::fs::remove_file(&work_fqn).await;
        return Err(err.into());
    }
    writer.flush().await?;
    drop(writer);

    if let Some(parent) = copy_fqn.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // same filesystem: atomic
    if let Err(err) = tokio::fs::rename(&work_fqn, &copy_fqn).await {
        let _ = tokio::fs::remove_file(&work_fqn).await;
        return Err(err.into());
    }

    let metadata = match lom.add_xcopy(copy_fqn.clone()) {
        Ok(()) => lom.clone_to(dst).persist(),
        Err(err) => Err(err),
    };
    if let Err(err) = metadata {
        // the copy file without metadata is useless; drop it and leave
        // the primary as it was
        let _ = tokio::fs::remove_file(&copy_fqn).await;
        lom.recache();
        return Err(err.into());
    }

    lom.recache();
    Ok(())
}

impl Drop for XactCopy {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
