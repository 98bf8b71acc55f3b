use crate::config::{EcConf, MirrorConf};
use crate::fs::{self, Locality, MountedFs};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// extended attribute on the metadata mountpath holding the snapshot.
pub const XATTR_BMD: &str = "user.tos.bmd";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("fs error: {0}")]
    Fs(#[from] fs::Error),

    #[error("corrupted bucket metadata snapshot: {0}")]
    Corrupted(#[from] serde_json::Error),

    #[error("io error: {0:#}")]
    IO(#[from] std::io::Error),
}

/// per-bucket data-plane properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketProps {
    pub local: Locality,
    pub mirror: MirrorConf,
    pub ec: EcConf,
}

impl Default for BucketProps {
    fn default() -> Self {
        BucketProps {
            local: Locality::Local,
            mirror: MirrorConf::default(),
            ec: EcConf::default(),
        }
    }
}

/// the bucket-metadata view. owned by an out-of-scope collaborator;
/// the core consumes versions over a watch channel and persists a
/// snapshot on the metadata mountpath.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bmd {
    pub version: u64,
    pub buckets: HashMap<String, BucketProps>,
}

impl Bmd {
    pub fn get<S: AsRef<str>>(&self, bucket: S) -> Option<&BucketProps> {
        self.buckets.get(bucket.as_ref())
    }

    pub fn ec_enabled<S: AsRef<str>>(&self, bucket: S) -> bool {
        self.get(bucket).map(|p| p.ec.enabled).unwrap_or(false)
    }

    pub fn mirror_enabled<S: AsRef<str>>(&self, bucket: S) -> bool {
        self.get(bucket).map(|p| p.mirror.enabled).unwrap_or(false)
    }
}

pub type BmdSender = watch::Sender<Arc<Bmd>>;
pub type BmdReceiver = watch::Receiver<Arc<Bmd>>;

pub fn bmd_channel(initial: Bmd) -> (BmdSender, BmdReceiver) {
    watch::channel(Arc::new(initial))
}

/// persist the snapshot in an extended attribute on the mountpath with
/// the largest path digest.
pub fn store(mfs: &MountedFs, bmd: &Bmd) -> Result<()> {
    let mp = mfs.mpath_for_xattr()?;
    let buf = serde_json::to_vec(bmd)?;
    xattr::set(&mp.path, XATTR_BMD, &buf)?;
    Ok(())
}

/// read the snapshot back; None if this target never persisted one.
pub fn load(mfs: &MountedFs) -> Result<Option<Bmd>> {
    let mp = mfs.mpath_for_xattr()?;
    let raw = xattr::get(&mp.path, XATTR_BMD)?;
    match raw {
        Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_slice(&raw)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Bmd {
        let mut bmd = Bmd {
            version: 9,
            buckets: HashMap::new(),
        };
        bmd.buckets.insert(
            "B".into(),
            BucketProps {
                local: Locality::Local,
                mirror: MirrorConf {
                    enabled: true,
                    ..MirrorConf::default()
                },
                ec: EcConf {
                    enabled: true,
                    data_slices: 3,
                    parity_slices: 2,
                    ..EcConf::default()
                },
            },
        );
        bmd
    }

    #[test]
    fn props_lookup() {
        let bmd = sample();
        assert!(bmd.ec_enabled("B"));
        assert!(bmd.mirror_enabled("B"));
        assert!(!bmd.ec_enabled("unknown"));
        assert_eq!(bmd.get("B").unwrap().ec.data_slices, 3);
    }

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let d1 = TempDir::new().unwrap();
        let mfs = MountedFs::new();
        mfs.disable_fsid_check();
        mfs.add(d1.path()).await.unwrap();

        assert!(load(&mfs).unwrap().is_none());

        let bmd = sample();
        store(&mfs, &bmd).unwrap();

        let back = load(&mfs).unwrap().expect("snapshot missing");
        assert_eq!(back.version, 9);
        assert!(back.ec_enabled("B"));
        assert_eq!(back.get("B").unwrap().ec.parity_slices, 2);
    }

    #[tokio::test]
    async fn watch_publishes() {
        let (tx, mut rx) = bmd_channel(Bmd::default());
        assert_eq!(rx.borrow().version, 0);

        tx.send(Arc::new(sample())).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 9);
    }
}
