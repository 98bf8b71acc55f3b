use super::content::{self, ParsedFqn};
use super::mpath::{clean_path, MountpathInfo};
use super::{Error, FsInfo, Result};
use crate::disk;
use arc_swap::{ArcSwap, ArcSwapOption};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;

pub type MpathMap = HashMap<PathBuf, Arc<MountpathInfo>>;

/// lifecycle notifications, multicast by the coordinator to every
/// registered path runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpathEvent {
    Added(PathBuf),
    Removed(PathBuf),
    Enabled(PathBuf),
    Disabled(PathBuf),
}

/// one published generation of the mountpath sets. both maps live behind
/// a single pointer so readers always observe a consistent pair.
#[derive(Default)]
pub struct Mountpaths {
    pub available: MpathMap,
    pub disabled: MpathMap,
}

/// the set of local filesystems a target serves. all mutations hold one
/// mutex and publish a freshly built `Mountpaths`; readers load the
/// current snapshot without locking.
pub struct MountedFs {
    snap: ArcSwap<Mountpaths>,
    // fsid -> registered path, guarded mutation lock
    fsids: Mutex<HashMap<u64, PathBuf>>,
    check_fsid: AtomicBool,
    // cached metadata mountpath (largest path digest), dropped on every
    // publication
    xattr_mpath: ArcSwapOption<MountpathInfo>,
    events: broadcast::Sender<MpathEvent>,
}

impl Default for MountedFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MountedFs {
    pub fn new() -> MountedFs {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        MountedFs {
            snap: ArcSwap::from_pointee(Mountpaths::default()),
            fsids: Mutex::new(HashMap::new()),
            check_fsid: AtomicBool::new(true),
            xattr_mpath: ArcSwapOption::empty(),
            events,
        }
    }

    /// test environments co-locate many mountpaths on one filesystem.
    pub fn disable_fsid_check(&self) {
        self.check_fsid.store(false, Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MpathEvent> {
        self.events.subscribe()
    }

    /// current (available, disabled) snapshot.
    pub fn get(&self) -> Arc<Mountpaths> {
        self.snap.load_full()
    }

    pub fn num_avail(&self) -> usize {
        self.snap.load().available.len()
    }

    /// register a new mountpath.
    pub async fn add<P: AsRef<Path>>(&self, path: P) -> Result<Arc<MountpathInfo>> {
        let orig: PathBuf = path.as_ref().into();
        let clean = clean_path(&orig)?;

        for comp in clean.components() {
            if let Component::Normal(seg) = comp {
                let seg = seg.to_string_lossy();
                if seg == "local" || seg == "cloud" {
                    return Err(Error::ReservedSegment {
                        path: clean.clone(),
                        segment: seg.into_owned(),
                    });
                }
            }
        }

        let meta = tokio::fs::metadata(&clean)
            .await
            .map_err(|err| Error::NotUsable {
                path: clean.clone(),
                reason: err.to_string(),
            })?;
        if !meta.is_dir() {
            return Err(Error::NotUsable {
                path: clean,
                reason: "not a directory".into(),
            });
        }
        let fsid = meta.dev();

        nix::sys::statvfs::statvfs(&clean).map_err(|err| Error::NotUsable {
            path: clean.clone(),
            reason: err.to_string(),
        })?;

        let fs_name = disk::mount::filesystem_of(&clean)
            .await
            .unwrap_or_else(|| "unknown".into());

        let mut fsids = self.fsids.lock().unwrap();
        let cur = self.snap.load();
        if cur.available.contains_key(&clean) || cur.disabled.contains_key(&clean) {
            return Err(Error::AlreadyRegistered(clean));
        }
        if self.check_fsid.load(Ordering::Relaxed) {
            if let Some(other) = fsids.get(&fsid) {
                return Err(Error::FsidInUse {
                    path: clean,
                    fsid,
                    other: other.clone(),
                });
            }
        }

        let mp = Arc::new(MountpathInfo::new(clean.clone(), orig, fsid, fs_name));

        let mut available = cur.available.clone();
        available.insert(clean.clone(), mp.clone());
        self.publish(Mountpaths {
            available,
            disabled: cur.disabled.clone(),
        });
        fsids.insert(fsid, clean.clone());
        drop(fsids);

        let _ = self.events.send(MpathEvent::Added(clean));
        Ok(mp)
    }

    /// unregister a mountpath; searches available, then disabled. removing
    /// the last available mountpath succeeds; the coordinator uses that as
    /// the signal to unregister the whole target from the cluster.
    pub fn remove<P: AsRef<Path>>(&self, path: P) -> Result<Arc<MountpathInfo>> {
        let clean = clean_path(path.as_ref())?;

        let mut fsids = self.fsids.lock().unwrap();
        let cur = self.snap.load();

        let (mp, next) = if let Some(mp) = cur.available.get(&clean).cloned() {
            let mut available = cur.available.clone();
            available.remove(&clean);
            if available.is_empty() {
                log::error!(
                    "removed the last available mountpath '{}'; target has no usable storage",
                    clean.display()
                );
            }
            (
                mp,
                Mountpaths {
                    available,
                    disabled: cur.disabled.clone(),
                },
            )
        } else if let Some(mp) = cur.disabled.get(&clean).cloned() {
            let mut disabled = cur.disabled.clone();
            disabled.remove(&clean);
            (
                mp,
                Mountpaths {
                    available: cur.available.clone(),
                    disabled,
                },
            )
        } else {
            return Err(Error::NotRegistered(clean));
        };

        self.publish(next);
        fsids.remove(&mp.fsid);
        drop(fsids);

        let _ = self.events.send(MpathEvent::Removed(clean));
        Ok(mp)
    }

    /// move a mountpath disabled -> available. returns (changed, exists);
    /// re-enabling an already-available mountpath is (false, true).
    pub fn enable<P: AsRef<Path>>(&self, path: P) -> (bool, bool) {
        self.toggle(path.as_ref(), true)
    }

    /// move a mountpath available -> disabled. returns (changed, exists).
    pub fn disable<P: AsRef<Path>>(&self, path: P) -> (bool, bool) {
        self.toggle(path.as_ref(), false)
    }

    fn toggle(&self, path: &Path, to_available: bool) -> (bool, bool) {
        let clean = match clean_path(path) {
            Ok(c) => c,
            Err(_) => return (false, false),
        };

        let fsids = self.fsids.lock().unwrap();
        let cur = self.snap.load();

        let (from, to) = if to_available {
            (&cur.disabled, &cur.available)
        } else {
            (&cur.available, &cur.disabled)
        };

        if to.contains_key(&clean) {
            return (false, true);
        }
        let mp = match from.get(&clean) {
            Some(mp) => mp.clone(),
            None => return (false, false),
        };

        let mut from = (*from).clone();
        let mut to = (*to).clone();
        from.remove(&clean);
        to.insert(clean.clone(), mp);

        let next = if to_available {
            Mountpaths {
                available: to,
                disabled: from,
            }
        } else {
            Mountpaths {
                available: from,
                disabled: to,
            }
        };
        self.publish(next);
        drop(fsids);

        let event = if to_available {
            MpathEvent::Enabled(clean)
        } else {
            MpathEvent::Disabled(clean)
        };
        let _ = self.events.send(event);
        (true, true)
    }

    /// the available mountpath with the largest path digest; bucket
    /// metadata persists there. cached until the next publication.
    pub fn mpath_for_xattr(&self) -> Result<Arc<MountpathInfo>> {
        if let Some(mp) = self.xattr_mpath.load_full() {
            return Ok(mp);
        }
        let cur = self.snap.load();
        let mp = cur
            .available
            .values()
            .max_by_key(|mp| mp.digest)
            .cloned()
            .ok_or(Error::NoMountpaths)?;
        self.xattr_mpath.store(Some(mp.clone()));
        Ok(mp)
    }

    /// aggregate used/capacity over the distinct filesystems backing the
    /// available mountpaths.
    pub fn fetch_fs_info(&self) -> Result<FsInfo> {
        let cur = self.snap.load();
        let mut seen = std::collections::HashSet::new();
        let mut total = FsInfo::default();
        for mp in cur.available.values() {
            if !seen.insert(mp.fsid) {
                continue;
            }
            total = total.aggregate(&mp.fs_info()?);
        }
        Ok(total)
    }

    /// resolve an FQN to (mountpath, content-type, locality, bucket,
    /// object). the mountpath match is by longest prefix over the
    /// available set.
    pub fn resolve_fqn(&self, fqn: &Path) -> Result<ParsedFqn> {
        let cur = self.snap.load();
        let mp = cur
            .available
            .values()
            .filter(|mp| fqn.starts_with(&mp.path))
            .max_by_key(|mp| mp.path.as_os_str().len())
            .cloned()
            .ok_or_else(|| Error::InvalidFqn(fqn.into()))?;
        content::parse_under(&mp, fqn)
    }

    fn publish(&self, next: Mountpaths) {
        self.snap.store(Arc::new(next));
        self.xattr_mpath.store(None);
    }
}

#[cfg(test)]
mod test;
