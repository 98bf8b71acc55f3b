use crate::bmd::{self, Bmd, BmdReceiver, BucketProps};
use crate::cluster::SmapReceiver;
use crate::config::{self, ConfigView, MirrorConf};
use crate::disk::IostatContext;
use crate::ec;
use crate::fs::content::WORK_PUT;
use crate::fs::{self, Locality, MountedFs, MpathEvent};
use crate::hash::{self, CksumType, Hasher};
use crate::lom::{self, Lom};
use crate::mirror::{self, XactCopy};
use crate::transport::{self, Connector, Demux};
use crate::xaction::Xact;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown bucket '{0}'")]
    UnknownBucket(String),

    #[error("no available mountpaths")]
    NoMountpaths,

    #[error("object '{bucket}/{objname}' not found")]
    NotFound { bucket: String, objname: String },

    #[error("config error: {0}")]
    Config(#[from] config::Error),

    #[error("fs error: {0}")]
    Fs(#[from] fs::Error),

    #[error("lom error: {0}")]
    Lom(#[from] lom::Error),

    #[error("mirror error: {0}")]
    Mirror(#[from] mirror::Error),

    #[error("ec error: {0}")]
    Ec(#[from] ec::Error),

    #[error("transport error: {0}")]
    Transport(#[from] transport::Error),

    #[error("bucket metadata error: {0}")]
    Bmd(#[from] bmd::Error),

    #[error("io error: {0:#}")]
    IO(#[from] std::io::Error),
}

/// anyone who needs to know when the mountpath set changes: stats,
/// health checker, caches, the mirror and EC engines.
#[async_trait::async_trait]
pub trait PathRunner: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_mpath_event(&self, event: &MpathEvent);
}

/// the per-target coordinator: owns the mountpath manager, the
/// utilization sampler, the mirror and EC engines, and the listeners
/// reacting to cluster-map and bucket-metadata versions.
pub struct Target {
    daemon_id: String,
    config: Arc<ConfigView>,
    mfs: Arc<MountedFs>,
    iostat: Arc<IostatContext>,
    smap: SmapReceiver,
    bmd: BmdReceiver,
    demux: Arc<Demux>,
    connector: Arc<dyn Connector>,
    // EC comes up lazily, the first time any bucket enables it
    ec: Mutex<Option<Arc<ec::Manager>>>,
    ec_buckets: Mutex<HashSet<String>>,
    mirrors: Mutex<HashMap<String, Arc<XactCopy>>>,
    runners: Mutex<Vec<Arc<dyn PathRunner>>>,
    shutdown: CancellationToken,
}

impl Target {
    pub async fn new(
        daemon_id: &str,
        config: ConfigView,
        smap: SmapReceiver,
        bmd: BmdReceiver,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Target>> {
        let cfg = config.get();
        let mfs = Arc::new(MountedFs::new());
        let iostat = Arc::new(IostatContext::new(cfg.disk.clone()));

        if cfg.test_fspaths.count > 0 {
            // virtual mountpaths share one filesystem
            mfs.disable_fsid_check();
            let root = cfg
                .fspaths
                .first()
                .cloned()
                .unwrap_or_else(|| std::env::temp_dir().join("tos"))
                .join(cfg.test_fspaths.instance.to_string());
            for i in 0..cfg.test_fspaths.count {
                let path = root.join(format!("mp{}", i));
                tokio::fs::create_dir_all(&path).await?;
                mfs.add(&path).await?;
            }
        } else {
            for path in &cfg.fspaths {
                mfs.add(path).await?;
            }
        }

        {
            let snap = mfs.get();
            for mp in snap.available.values() {
                iostat.register_mountpath(&mp.path).await;
            }
        }

        let target = Arc::new(Target {
            daemon_id: daemon_id.into(),
            config: Arc::new(config),
            mfs,
            iostat: iostat.clone(),
            smap,
            bmd,
            demux: Arc::new(Demux::new()),
            connector,
            ec: Mutex::new(None),
            ec_buckets: Mutex::new(HashSet::new()),
            mirrors: Mutex::new(HashMap::new()),
            runners: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(iostat.run(target.shutdown.clone()));
        Ok(target)
    }

    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    pub fn mfs(&self) -> &Arc<MountedFs> {
        &self.mfs
    }

    pub fn iostat(&self) -> &Arc<IostatContext> {
        &self.iostat
    }

    /// the receive demux; the embedding daemon serves it on the
    /// target's data port.
    pub fn demux(&self) -> &Arc<Demux> {
        &self.demux
    }

    pub fn register_path_runner(&self, runner: Arc<dyn PathRunner>) {
        self.runners.lock().unwrap().push(runner);
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// start the listener loop: cluster-map versions, bucket-metadata
    /// versions, and mountpath lifecycle events.
    pub fn run(self: Arc<Self>) {
        let this = self;
        // subscribe before handing off so no event falls between
        let mut events = this.mfs.subscribe();
        tokio::spawn(async move {
            let mut smap_rx = this.smap.clone();
            let mut bmd_rx = this.bmd.clone();

            // act on whatever view versions exist at startup
            let initial = bmd_rx.borrow().clone();
            this.sync_bmd(&initial).await;

            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,

                    Ok(()) = smap_rx.changed() => {
                        let version = smap_rx.borrow().version;
                        log::info!("cluster map v{} received", version);
                        let mgr = this.ec.lock().unwrap().clone();
                        if let Some(mgr) = mgr {
                            mgr.on_smap_change();
                        }
                    }

                    Ok(()) = bmd_rx.changed() => {
                        let bmd = bmd_rx.borrow().clone();
                        log::info!("bucket metadata v{} received", bmd.version);
                        this.sync_bmd(&bmd).await;
                        if let Err(err) = bmd::store(&this.mfs, &bmd) {
                            log::warn!("failed to persist bucket metadata: {:#}", err);
                        }
                    }

                    Ok(event) = events.recv() => {
                        this.on_mpath_event(event).await;
                    }
                }
            }
        });
    }

    async fn sync_bmd(&self, bmd: &Bmd) {
        // EC per bucket
        let previously: HashSet<String> = self.ec_buckets.lock().unwrap().clone();
        let mut now = HashSet::new();
        for (bucket, props) in &bmd.buckets {
            if props.ec.enabled {
                now.insert(bucket.clone());
                match self.ec_manager() {
                    Ok(mgr) => mgr.enable_bucket(bucket, props).await,
                    Err(err) => log::error!("cannot bring up EC: {:#}", err),
                }
            }
        }
        for gone in previously.difference(&now) {
            let mgr = self.ec.lock().unwrap().clone();
            if let Some(mgr) = mgr {
                mgr.disable_bucket(gone).await;
            }
        }
        *self.ec_buckets.lock().unwrap() = now;

        // mirror engines for buckets that turned mirroring off
        let mut mirrors = self.mirrors.lock().unwrap();
        mirrors.retain(|bucket, xact| {
            let keep = bmd.mirror_enabled(bucket);
            if !keep {
                xact.abort();
            }
            keep
        });
    }

    async fn on_mpath_event(&self, event: MpathEvent) {
        log::info!("mountpath event: {:?}", event);
        match &event {
            MpathEvent::Added(path) | MpathEvent::Enabled(path) => {
                self.iostat.register_mountpath(path).await;
            }
            MpathEvent::Removed(path) | MpathEvent::Disabled(path) => {
                self.iostat.unregister_mountpath(path);
            }
        }

        // mirror workers hold a mountpath snapshot; retire them and let
        // the next PUT start fresh ones
        {
            let mut mirrors = self.mirrors.lock().unwrap();
            for (_, xact) in mirrors.drain() {
                xact.abort();
            }
        }

        let runners: Vec<Arc<dyn PathRunner>> = self.runners.lock().unwrap().clone();
        for runner in runners {
            runner.on_mpath_event(&event).await;
        }
    }

    fn bucket_props(&self, bucket: &str) -> Result<BucketProps> {
        self.bmd
            .borrow()
            .get(bucket)
            .cloned()
            .ok_or_else(|| Error::UnknownBucket(bucket.into()))
    }

    fn ec_manager(&self) -> Result<Arc<ec::Manager>> {
        let mut guard = self.ec.lock().unwrap();
        if let Some(mgr) = &*guard {
            return Ok(mgr.clone());
        }
        let mgr = ec::Manager::new(
            &self.daemon_id,
            self.mfs.clone(),
            self.smap.clone(),
            self.connector.clone(),
            &self.config.get().timeout,
            &self.demux,
        )?;
        *guard = Some(mgr.clone());
        Ok(mgr)
    }

    fn mirror_xact(
        &self,
        bucket: &str,
        local: Locality,
        conf: &MirrorConf,
    ) -> Result<Arc<XactCopy>> {
        let mut mirrors = self.mirrors.lock().unwrap();
        if let Some(xact) = mirrors.get(bucket) {
            if !xact.finished() {
                return Ok(xact.clone());
            }
        }
        let mpaths = self.mfs.get().available.values().cloned().collect();
        let xact = XactCopy::start(bucket, local, conf.clone(), mpaths, self.iostat.clone())?;
        mirrors.insert(bucket.into(), xact.clone());
        Ok(xact)
    }

    /// the write path: workfile on the HRW mountpath, checksum while
    /// writing, atomic rename, LOM persist, then mirror and EC.
    pub async fn put_object(&self, bucket: &str, objname: &str, data: &[u8]) -> Result<PathBuf> {
        let props = self.bucket_props(bucket)?;
        let local = props.local;
        let uname = format!("{}/{}", bucket, objname);

        let mp = {
            let snap = self.mfs.get();
            snap.available
                .values()
                .max_by_key(|mp| hash::hrw_weight(&uname, mp.digest))
                .cloned()
                .ok_or(Error::NoMountpaths)?
        };

        // one writer at a time per object; concurrent writers get
        // distinct workfiles and the last rename wins
        let work_fqn = mp.work_fqn(local, bucket, objname, WORK_PUT);
        if let Some(parent) = work_fqn.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut hasher = Hasher::new(CksumType::Xxhash);
        hasher.update(data);
        if let Err(err) = tokio::fs::write(&work_fqn, data).await {
            let _ = tokio::fs::remove_file(&work_fqn).await;
            return Err(err.into());
        }

        // bump the version of an existing object
        let version = {
            let mut prev = Lom::new(mp.clone(), local, bucket, objname);
            match prev.load_meta_from_fs().await {
                Ok(()) => prev.version.parse::<u64>().unwrap_or(0) + 1,
                Err(_) => 1,
            }
        };

        let mut lom = Lom::new(mp, local, bucket, objname);
        if let Some(parent) = lom.fqn.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(err) = tokio::fs::rename(&work_fqn, &lom.fqn).await {
            let _ = tokio::fs::remove_file(&work_fqn).await;
            return Err(err.into());
        }

        lom.size = data.len() as u64;
        lom.version = version.to_string();
        lom.cksum = Some(hasher.finish());
        lom.touch();
        // a fresh record: an overwrite drops the previous copy list and
        // the mirror engine re-replicates
        lom.persist()?;
        let fqn = lom.fqn.clone();

        if props.mirror.enabled {
            // replication is best-effort: the object is durable on its
            // primary either way
            match self.mirror_xact(bucket, local, &props.mirror) {
                Ok(xact) => {
                    if let Err(err) = xact.copy(lom) {
                        log::warn!("mirror of '{}' skipped: {:#}", uname, err);
                    }
                }
                Err(err) => log::warn!("mirror engine unavailable: {:#}", err),
            }
        }

        if props.ec.enabled {
            let mgr = self.ec_manager()?;
            let mut ec_lom = Lom::new(
                self.mfs.resolve_fqn(&fqn)?.mpath.clone(),
                local,
                bucket,
                objname,
            );
            ec_lom.load().await?;
            // queue and return; delivery failures are the engine's to
            // log, but a cluster too small to encode fails the PUT
            let _completion = mgr.encode(ec_lom).await?;
        }

        Ok(fqn)
    }

    /// the read path: primary by HRW first, then any surviving mirror
    /// copy, then EC restore.
    pub async fn get_object(&self, bucket: &str, objname: &str) -> Result<Vec<u8>> {
        let props = self.bucket_props(bucket)?;
        let local = props.local;
        let uname = format!("{}/{}", bucket, objname);

        let mut candidates: Vec<_> = {
            let snap = self.mfs.get();
            snap.available.values().cloned().collect()
        };
        candidates.sort_by_key(|mp| std::cmp::Reverse(hash::hrw_weight(&uname, mp.digest)));

        for mp in candidates {
            let mut lom = Lom::new(mp, local, bucket, objname);
            match lom.load().await {
                Ok(()) => {
                    let data = tokio::fs::read(&lom.fqn).await?;
                    lom.touch();
                    lom.recache();
                    return Ok(data);
                }
                Err(err) => {
                    log::debug!("{}: {:#}", lom, err);
                }
            }
        }

        if props.ec.enabled {
            let mgr = self.ec_manager()?;
            let mp = {
                let snap = self.mfs.get();
                snap.available
                    .values()
                    .max_by_key(|mp| hash::hrw_weight(&uname, mp.digest))
                    .cloned()
                    .ok_or(Error::NoMountpaths)?
            };
            let lom = Lom::new(mp.clone(), local, bucket, objname);
            let fqn = lom.fqn.clone();
            let completion = mgr.restore(lom).await?;
            match completion.await {
                Ok(Ok(())) => return Ok(tokio::fs::read(&fqn).await?),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(ec::Error::Aborted.into()),
            }
        }

        Err(Error::NotFound {
            bucket: bucket.into(),
            objname: objname.into(),
        })
    }

    /// remove the object, its mirror copies, and (when EC is on) its
    /// remote slices.
    pub async fn delete_object(&self, bucket: &str, objname: &str) -> Result<()> {
        let props = self.bucket_props(bucket)?;
        let local = props.local;

        let mut found = false;
        let snap = self.mfs.get();
        for mp in snap.available.values() {
            let lom = Lom::new(mp.clone(), local, bucket, objname);
            match tokio::fs::remove_file(&lom.fqn).await {
                Ok(()) => {
                    lom.uncache();
                    found = true;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        if props.ec.enabled {
            if let Ok(mgr) = self.ec_manager() {
                let mp = snap
                    .available
                    .values()
                    .next()
                    .cloned()
                    .ok_or(Error::NoMountpaths)?;
                let lom = Lom::new(mp, local, bucket, objname);
                if let Err(err) = mgr.cleanup(&lom).await {
                    log::warn!("slice cleanup for '{}/{}': {:#}", bucket, objname, err);
                }
            }
        }

        if !found {
            return Err(Error::NotFound {
                bucket: bucket.into(),
                objname: objname.into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test;
