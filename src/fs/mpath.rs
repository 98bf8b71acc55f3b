use super::content::{self, ContentType};
use super::{Error, FsInfo, Locality, Result};
use crate::hash;
use crate::lom::cache::LomCaches;
use anyhow::Context;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const TRASH_DIR: &str = ".trash";

/// one local filesystem serving one disk (or RAID group).
pub struct MountpathInfo {
    /// cleaned absolute path; the registration key.
    pub path: PathBuf,
    /// path exactly as it was entered.
    pub orig: PathBuf,
    /// stable identifier of the backing filesystem.
    pub fsid: u64,
    /// filesystem name as reported by the mount table.
    pub fs_name: String,
    /// 64-bit digest of the cleaned path, HRW input.
    pub digest: u64,
    // generates unique trash directory names for fast async removal
    tmp_counter: AtomicU64,
    caches: LomCaches,
}

impl std::fmt::Debug for MountpathInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mp[{} fs={} fsid={:#x}]",
            self.path.display(),
            self.fs_name,
            self.fsid
        )
    }
}

impl MountpathInfo {
    pub fn new(path: PathBuf, orig: PathBuf, fsid: u64, fs_name: String) -> MountpathInfo {
        let digest = hash::path_digest(path.to_string_lossy());
        MountpathInfo {
            path,
            orig,
            fsid,
            fs_name,
            digest,
            tmp_counter: AtomicU64::new(0),
            caches: LomCaches::new(),
        }
    }

    /// directory holding a bucket's files of one content type.
    pub fn make_bucket_dir(&self, ct: ContentType, local: Locality, bucket: &str) -> PathBuf {
        self.path.join(ct.as_str()).join(local.as_str()).join(bucket)
    }

    /// canonical FQN of an object on this mountpath.
    pub fn obj_fqn(&self, local: Locality, bucket: &str, objname: &str) -> PathBuf {
        self.make_bucket_dir(ContentType::Object, local, bucket)
            .join(objname)
    }

    /// unique workfile FQN for a concurrent writer of `objname`.
    pub fn work_fqn(&self, local: Locality, bucket: &str, objname: &str, role: &str) -> PathBuf {
        self.make_bucket_dir(ContentType::Workfile, local, bucket)
            .join(content::work_name(objname, role))
    }

    pub fn lom_caches(&self) -> &LomCaches {
        &self.caches
    }

    /// move a directory into a uniquely named trash entry and remove it in
    /// the background. the rename is what callers wait for; reclaiming the
    /// space is not on anyone's critical path.
    pub async fn fast_remove_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let trash = self.path.join(TRASH_DIR);
        tokio::fs::create_dir_all(&trash)
            .await
            .with_context(|| format!("failed to create trash dir: {:?}", trash))?;

        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let dest = trash.join(format!("{:016x}", n));
        tokio::fs::rename(dir, &dest).await?;

        tokio::spawn(async move {
            if let Err(err) = tokio::fs::remove_dir_all(&dest).await {
                log::warn!("failed to reclaim trash dir {:?}: {:#}", dest, err);
            }
        });

        Ok(())
    }

    /// used/capacity/percent-used of the backing filesystem.
    pub fn fs_info(&self) -> Result<FsInfo> {
        let st = nix::sys::statvfs::statvfs(&self.path).map_err(|err| Error::NotUsable {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;

        let frsize = st.fragment_size() as u64;
        let capacity = st.blocks() as u64 * frsize;
        let used = capacity - st.blocks_free() as u64 * frsize;
        Ok(FsInfo {
            used,
            capacity,
            pct_used: if capacity == 0 {
                0
            } else {
                (used * 100 / capacity) as u8
            },
        })
    }
}

/// normalize a mountpath: absolute, no '.', '..', or trailing separator.
pub(super) fn clean_path(p: &Path) -> Result<PathBuf> {
    if !p.is_absolute() {
        return Err(Error::NotAbsolute(p.into()));
    }
    let mut out = PathBuf::from("/");
    for c in p.components() {
        match c {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(s) => out.push(s),
            Component::Prefix(_) => {}
        }
    }
    Ok(out)
}
