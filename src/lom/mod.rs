use crate::fs::{self, ContentType, Locality, MountedFs, MountpathInfo, ParsedFqn};
use crate::hash::{self, Cksum};
use std::fmt::Display;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub mod cache;
pub mod meta;

use cache::CachedLom;
use meta::{LomMeta, XATTR_LOM};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("corrupted lom metadata: {0}")]
    CorruptedMeta(String),

    #[error("no lom metadata on {0:?}")]
    MissingMeta(PathBuf),

    #[error("checksum mismatch on {fqn:?}: recorded {recorded}, computed {computed}")]
    ChecksumMismatch {
        fqn: PathBuf,
        recorded: Cksum,
        computed: Cksum,
    },

    #[error("{0:?} is not an object fqn")]
    NotObject(PathBuf),

    #[error("fs error: {0}")]
    Fs(#[from] fs::Error),

    #[error("io error: {0:#}")]
    IO(#[from] std::io::Error),
}

/// Local Object Metadata: the record of one object on one target.
///
/// A LOM is mutated only by the jogger owning its mountpath or by the
/// write path, which serializes writers per object; `&mut self` on the
/// mutators expresses that implicit lock.
pub struct Lom {
    parsed: ParsedFqn,
    pub fqn: PathBuf,
    pub size: u64,
    pub atime_ns: i64,
    pub version: String,
    pub cksum: Option<Cksum>,
    copies: Vec<PathBuf>,
}

impl Display for Lom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lom[{}/{} @ {}]",
            self.parsed.bucket,
            self.parsed.objname,
            self.parsed.mpath.path.display()
        )
    }
}

impl Lom {
    /// construct for a known mountpath and object coordinates.
    pub fn new(
        mpath: Arc<MountpathInfo>,
        local: Locality,
        bucket: &str,
        objname: &str,
    ) -> Lom {
        let fqn = mpath.obj_fqn(local, bucket, objname);
        Lom {
            parsed: ParsedFqn {
                mpath,
                content_type: ContentType::Object,
                local,
                bucket: bucket.into(),
                objname: objname.into(),
            },
            fqn,
            size: 0,
            atime_ns: 0,
            version: String::new(),
            cksum: None,
            copies: Vec::new(),
        }
    }

    /// construct by parsing an FQN against the mounted filesystems.
    pub fn init(mfs: &MountedFs, fqn: &Path) -> Result<Lom> {
        let parsed = mfs.resolve_fqn(fqn)?;
        if parsed.content_type != ContentType::Object {
            return Err(Error::NotObject(fqn.into()));
        }
        let canonical = parsed.fqn();
        Ok(Lom {
            parsed,
            fqn: canonical,
            size: 0,
            atime_ns: 0,
            version: String::new(),
            cksum: None,
            copies: Vec::new(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.parsed.bucket
    }

    pub fn objname(&self) -> &str {
        &self.parsed.objname
    }

    pub fn local(&self) -> Locality {
        self.parsed.local
    }

    pub fn mpath(&self) -> &Arc<MountpathInfo> {
        &self.parsed.mpath
    }

    pub fn parsed(&self) -> &ParsedFqn {
        &self.parsed
    }

    /// bucket-scoped unique name; the cache key and the wire identity.
    pub fn uname(&self) -> String {
        format!("{}/{}", self.parsed.bucket, self.parsed.objname)
    }

    fn meta(&self) -> LomMeta {
        LomMeta {
            cksum: self.cksum.clone(),
            version: self.version.clone(),
            copies: self.copies.clone(),
        }
    }

    fn apply(&mut self, entry: &CachedLom) {
        self.size = entry.size;
        self.atime_ns = entry.atime_ns;
        self.version = entry.meta.version.clone();
        self.cksum = entry.meta.cksum.clone();
        self.copies = entry.meta.copies.clone();
    }

    /// fill from cache if resident, the filesystem otherwise. a cached
    /// entry that disagrees with stat is dropped and reloaded.
    pub async fn load(&mut self) -> Result<()> {
        let uname = self.uname();
        let digest = hash::name_digest(&uname);
        if let Some(entry) = self.parsed.mpath.lom_caches().get(digest, &uname) {
            match tokio::fs::metadata(&self.fqn).await {
                Ok(st) if st.len() == entry.size => {
                    self.apply(&entry);
                    return Ok(());
                }
                _ => self.parsed.mpath.lom_caches().remove(digest, &uname),
            }
        }
        self.load_meta_from_fs().await
    }

    /// force a fresh read of stat + extended attribute, bypassing the
    /// cache.
    pub async fn load_meta_from_fs(&mut self) -> Result<()> {
        let st = tokio::fs::metadata(&self.fqn).await?;
        self.size = st.len();
        self.atime_ns = st.atime() * 1_000_000_000 + st.atime_nsec();

        // xattr reads are a single syscall; not worth a blocking task
        let raw = xattr::get(&self.fqn, XATTR_LOM)?;
        let raw = match raw {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Err(Error::MissingMeta(self.fqn.clone())),
        };

        let meta = match meta::decode(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                self.uncache();
                return Err(err);
            }
        };

        self.version = meta.version;
        self.cksum = meta.cksum;
        self.copies = meta.copies;
        self.recache();
        Ok(())
    }

    /// marshal (version, checksum, copy list) into the extended
    /// attribute. atomicity is the attribute-write atomicity of the
    /// underlying filesystem.
    pub fn persist(&self) -> Result<()> {
        let buf = meta::encode(&self.meta());
        xattr::set(&self.fqn, XATTR_LOM, &buf)?;
        self.recache();
        Ok(())
    }

    pub fn has_copies(&self) -> bool {
        !self.copies.is_empty()
    }

    pub fn copy_fqn(&self) -> &[PathBuf] {
        &self.copies
    }

    pub fn is_copy_on(&self, mpath: &MountpathInfo) -> bool {
        self.copies.iter().any(|fqn| fqn.starts_with(&mpath.path))
    }

    /// record one more local replica and persist.
    pub fn add_xcopy(&mut self, fqn: PathBuf) -> Result<()> {
        if fqn != self.fqn && !self.copies.contains(&fqn) {
            self.copies.push(fqn);
        }
        self.persist()
    }

    /// replace the whole replica list and persist.
    pub fn set_copy_fqn(&mut self, copies: Vec<PathBuf>) -> Result<()> {
        self.copies = copies;
        self.persist()
    }

    /// the LOM of a new replica of self on another mountpath; its copy
    /// list points back at the primary.
    pub fn clone_to(&self, mpath: Arc<MountpathInfo>) -> Lom {
        let mut copy = Lom::new(mpath, self.parsed.local, &self.parsed.bucket, &self.parsed.objname);
        copy.size = self.size;
        copy.atime_ns = self.atime_ns;
        copy.version = self.version.clone();
        copy.cksum = self.cksum.clone();
        copy.copies = vec![self.fqn.clone()];
        copy
    }

    pub fn recache(&self) {
        let uname = self.uname();
        let digest = hash::name_digest(&uname);
        self.parsed.mpath.lom_caches().put(
            digest,
            &uname,
            CachedLom {
                meta: self.meta(),
                size: self.size,
                atime_ns: self.atime_ns,
            },
        );
    }

    pub fn uncache(&self) {
        let uname = self.uname();
        let digest = hash::name_digest(&uname);
        self.parsed.mpath.lom_caches().remove(digest, &uname);
    }

    pub fn is_cached(&self) -> bool {
        let uname = self.uname();
        self.parsed
            .mpath
            .lom_caches()
            .get(hash::name_digest(&uname), &uname)
            .is_some()
    }

    /// stamp the access time (GET/PUT completion).
    pub fn touch(&mut self) {
        self.atime_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
    }

    /// recompute the content checksum and compare with the recorded one.
    /// a mismatch uncaches the LOM; the object is unavailable until
    /// healed.
    pub async fn validate_checksum(&self) -> Result<()> {
        let recorded = match &self.cksum {
            Some(ck) => ck.clone(),
            None => return Ok(()),
        };
        let data = tokio::fs::read(&self.fqn).await?;
        let computed = hash::checksum(recorded.typ, &data);
        if computed != recorded {
            self.uncache();
            return Err(Error::ChecksumMismatch {
                fqn: self.fqn.clone(),
                recorded,
                computed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash::CksumType;
    use tempfile::TempDir;

    async fn mountpath(tmp: &TempDir) -> Arc<MountpathInfo> {
        Arc::new(MountpathInfo::new(
            tmp.path().into(),
            tmp.path().into(),
            1,
            "test".into(),
        ))
    }

    async fn put_file(lom: &Lom, content: &[u8]) {
        tokio::fs::create_dir_all(lom.fqn.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&lom.fqn, content).await.unwrap();
    }

    #[tokio::test]
    async fn persist_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mp = mountpath(&tmp).await;

        let mut lom = Lom::new(mp.clone(), Locality::Local, "B", "a/b.bin");
        put_file(&lom, b"hello world").await;

        lom.size = 11;
        lom.version = "7".into();
        lom.cksum = Some(hash::checksum(CksumType::Xxhash, b"hello world"));
        lom.set_copy_fqn(vec!["/mnt/other/object/local/B/a/b.bin".into()])
            .unwrap();

        let mut fresh = Lom::new(mp, Locality::Local, "B", "a/b.bin");
        fresh.load_meta_from_fs().await.expect("load failed");

        assert_eq!(fresh.size, 11);
        assert_eq!(fresh.version, "7");
        assert_eq!(fresh.cksum, lom.cksum);
        assert_eq!(fresh.copy_fqn(), lom.copy_fqn());
        assert!(fresh.has_copies());
    }

    #[tokio::test]
    async fn load_missing_meta() {
        let tmp = TempDir::new().unwrap();
        let mp = mountpath(&tmp).await;

        let mut lom = Lom::new(mp, Locality::Local, "B", "naked");
        put_file(&lom, b"no xattr here").await;

        let out = lom.load().await;
        assert!(matches!(out, Err(Error::MissingMeta(_))));
    }

    #[tokio::test]
    async fn load_detects_corruption() {
        let tmp = TempDir::new().unwrap();
        let mp = mountpath(&tmp).await;

        let mut lom = Lom::new(mp.clone(), Locality::Local, "B", "obj");
        put_file(&lom, b"payload").await;
        lom.version = "1".into();
        lom.persist().unwrap();

        // flip one byte of the stored record
        let mut raw = xattr::get(&lom.fqn, XATTR_LOM).unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        xattr::set(&lom.fqn, XATTR_LOM, &raw).unwrap();

        let mut fresh = Lom::new(mp, Locality::Local, "B", "obj");
        let out = fresh.load_meta_from_fs().await;
        assert!(matches!(out, Err(Error::CorruptedMeta(_))));
        assert!(!fresh.is_cached());
    }

    #[tokio::test]
    async fn load_prefers_cache_until_fs_changes() {
        let tmp = TempDir::new().unwrap();
        let mp = mountpath(&tmp).await;

        let mut lom = Lom::new(mp.clone(), Locality::Local, "B", "obj");
        put_file(&lom, b"12345").await;
        lom.size = 5;
        lom.version = "1".into();
        lom.persist().unwrap();
        assert!(lom.is_cached());

        let mut cached = Lom::new(mp.clone(), Locality::Local, "B", "obj");
        cached.load().await.unwrap();
        assert_eq!(cached.version, "1");

        // grow the file behind the cache's back: entry is invalidated and
        // the next load goes to the filesystem
        tokio::fs::write(&lom.fqn, b"1234567890").await.unwrap();
        let mut reread = Lom::new(mp, Locality::Local, "B", "obj");
        reread.load().await.unwrap();
        assert_eq!(reread.size, 10);
    }

    #[tokio::test]
    async fn uncache_and_recache() {
        let tmp = TempDir::new().unwrap();
        let mp = mountpath(&tmp).await;

        let mut lom = Lom::new(mp, Locality::Local, "B", "obj");
        put_file(&lom, b"x").await;
        lom.persist().unwrap();
        assert!(lom.is_cached());

        lom.uncache();
        assert!(!lom.is_cached());
        lom.recache();
        assert!(lom.is_cached());
    }

    #[tokio::test]
    async fn checksum_validation() {
        let tmp = TempDir::new().unwrap();
        let mp = mountpath(&tmp).await;

        let mut lom = Lom::new(mp, Locality::Local, "B", "obj");
        put_file(&lom, b"content").await;
        lom.cksum = Some(hash::checksum(CksumType::Md5, b"content"));
        lom.persist().unwrap();

        lom.validate_checksum().await.expect("valid checksum rejected");

        tokio::fs::write(&lom.fqn, b"tampered").await.unwrap();
        let out = lom.validate_checksum().await;
        assert!(matches!(out, Err(Error::ChecksumMismatch { .. })));
        assert!(!lom.is_cached());
    }

    #[tokio::test]
    async fn clone_points_back() {
        let t1 = TempDir::new().unwrap();
        let t2 = TempDir::new().unwrap();
        let mp1 = mountpath(&t1).await;
        let mp2 = mountpath(&t2).await;

        let mut primary = Lom::new(mp1, Locality::Local, "B", "obj");
        primary.version = "2".into();
        primary.size = 9;

        let copy = primary.clone_to(mp2.clone());
        assert_eq!(copy.copy_fqn(), &[primary.fqn.clone()]);
        assert_eq!(copy.version, "2");
        assert_eq!(copy.size, 9);
        assert!(copy.fqn.starts_with(&mp2.path));
        assert!(!primary.is_copy_on(&mp2));
    }
}
